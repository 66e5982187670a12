pub use dty::DriverError;

/// Errors from the descriptor-update batched protocol (§4.7), distinct
/// from a plain `DriverError` because most of these are caught before any
/// native call is made.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorUpdateError {
    #[error("pending-allocation slot referenced an unknown pool")]
    UnknownPool,
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Errors from the snapshot engine (§4.10).
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("io error during snapshot: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported: vkBindImageMemory2 with bindInfoCount > 1 cannot be snapshotted")]
    MultiBindImageMemoryUnsupported,
    #[error("snapshot stream truncated while reading {0}")]
    Truncated(&'static str),
    #[error(transparent)]
    Driver(#[from] DriverError),
}
