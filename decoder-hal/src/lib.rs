//! Raw native-driver access: `ash`-backed instance/device setup, dispatch
//! tables, and the handful of type conversions the core crate needs but
//! that have nothing to do with state tracking.
//!
//! Structured the way `wgpu_hal::vulkan` is structured — a `Shared` struct
//! per instance/device holding the raw `ash` object plus whatever extension
//! function pointers were loaded, wrapped in `Arc` so dependents (queues,
//! the device-op tracker) can hold a cheap reference without re-querying
//! the loader.

pub mod vulkan;

pub use vulkan::{DeviceExtensionFunctions, DeviceShared, ExtensionFn, Instance, InstanceShared};
