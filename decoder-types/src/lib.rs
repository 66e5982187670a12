//! Plain-data types shared between `decoder-hal` and `decoder-core`.
//!
//! Mirrors the role `wgpu-types` plays for the wgpu stack: no driver calls,
//! no locks, just the vocabulary every other crate in the workspace agrees on.

mod error;
mod flags;
mod handle;

pub use error::{abort_reason, DriverError, FatalError};
pub use flags::{ExternalHandleTypes, TextureEmulationFlags, Workarounds};
pub use handle::{BoxedHandle, HandleKind};

/// Sequence number used by the ordering coordinator (`host_sync`) and by
/// the device-op tracker's fence/semaphore bookkeeping.
pub type SequenceNumber = u64;

/// A boxed-handle-sorted ordering key, used by the snapshot engine so save
/// and load iterate images/buffers in the same positional order.
pub type BoxedOrderKey = u64;
