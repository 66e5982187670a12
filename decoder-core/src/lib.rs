//! Host-side Vulkan command decoder and state tracker.
//!
//! Owns the boxed-handle manager, the ordering coordinator, the
//! device-op tracker, the state registries, the command dispatchers, the
//! descriptor-update protocol, compressed-texture emulation, and the
//! snapshot engine, wired together by [`global::VkDecoderGlobalState`].

pub mod boxed;
pub mod command;
pub mod compressed_image;
pub mod compressed_pipeline;
pub mod config;
pub mod descriptor;
pub mod device_op_tracker;
pub mod error;
pub mod external;
pub mod fence;
pub mod global;
pub mod memory;
pub mod ordering;
pub mod registries;
pub mod snapshot;

pub use global::{global, try_global, Collaborators, VkDecoderGlobalState};
