use ash::vk;

/// Errors propagated to the guest, one per native-driver failure mode the
/// spec distinguishes. Mirrors `wgpu_hal::vulkan::Device`'s
/// `From<vk::Result> for DeviceError` conversion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    #[error("out of host memory")]
    OutOfHostMemory,
    #[error("out of device memory")]
    OutOfDeviceMemory,
    #[error("device lost")]
    DeviceLost,
    #[error("initialization failed")]
    InitializationFailed,
    #[error("format not supported")]
    FormatNotSupported,
    #[error("incompatible driver version")]
    IncompatibleDriver,
    #[error("descriptor/pool memory exhausted")]
    OutOfPoolMemory,
    #[error("surface out of date")]
    Outdated,
    #[error("surface lost")]
    SurfaceLost,
    /// The device was not created with the extension a dispatcher needed
    /// (e.g. external-memory/semaphore/fence fd export without the
    /// matching `VK_KHR_external_*_fd` extension enabled).
    #[error("required extension not enabled")]
    ExtensionNotPresent,
    #[error("unknown driver error {0:?}")]
    Unknown(i32),
}

impl From<vk::Result> for DriverError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::OutOfHostMemory,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Self::OutOfDeviceMemory,
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::ERROR_INITIALIZATION_FAILED => Self::InitializationFailed,
            vk::Result::ERROR_FORMAT_NOT_SUPPORTED => Self::FormatNotSupported,
            vk::Result::ERROR_INCOMPATIBLE_DRIVER => Self::IncompatibleDriver,
            vk::Result::ERROR_OUT_OF_POOL_MEMORY => Self::OutOfPoolMemory,
            vk::Result::ERROR_OUT_OF_DATE_KHR => Self::Outdated,
            vk::Result::ERROR_SURFACE_LOST_KHR => Self::SurfaceLost,
            other => {
                log::warn!("unrecognized driver error {other:?}");
                Self::Unknown(other.as_raw())
            }
        }
    }
}

/// Reasons the process aborts rather than returns a `Result`, per the
/// spec's "state-tracker corruption" error class (§7): these indicate a
/// host-side programming error, not a condition a guest can trigger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FatalError {
    /// Unboxing found no entry for a dispatchable (or fence-exempt
    /// non-dispatchable) handle.
    UnknownHandle(crate::HandleKind),
    /// A `DeviceOpBuilder` was dropped without ever recording which fence
    /// was submitted (gfxstream: `DeviceOpBuilder::~DeviceOpBuilder`).
    DeviceOpBuilderMisuse,
    /// `OnQueueSubmittedWithFence` was called with a fence that doesn't
    /// match the one the builder itself created.
    DeviceOpFenceMismatch,
    /// A registry iterator encountered a slot whose status byte matches
    /// no known variant; the storage block is corrupt.
    CorruptStorage,
}

impl std::fmt::Display for FatalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownHandle(kind) => write!(f, "unknown boxed handle of kind {kind:?}"),
            Self::DeviceOpBuilderMisuse => {
                write!(f, "DeviceOpBuilder dropped without a submitted fence")
            }
            Self::DeviceOpFenceMismatch => {
                write!(f, "fence submitted does not match the one this builder created")
            }
            Self::CorruptStorage => write!(f, "registry storage slot has an invalid status"),
        }
    }
}

impl std::error::Error for FatalError {}

/// Abort with a structured reason, mirroring gfxstream's `GFXSTREAM_ABORT`.
/// This is the only place the stack deliberately panics; every other
/// failure is a `Result`.
#[macro_export]
macro_rules! abort_with_reason {
    ($reason:expr) => {{
        log::error!("fatal decoder error: {}", $reason);
        panic!("fatal decoder error: {}", $reason);
    }};
}

/// Convenience used by callers that want the reason string without
/// immediately aborting (e.g. to log before propagating up through a test
/// harness's `Result`-based assertions).
pub fn abort_reason(reason: FatalError) -> String {
    reason.to_string()
}
