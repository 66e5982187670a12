use bitflags::bitflags;

bitflags! {
    /// Per-device texture-emulation switches. Modelled directly on
    /// `wgpu_hal::vulkan::Workarounds`: a small set of independent quirks
    /// a device may or may not need, checked on the hot path without a
    /// branch per feature.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureEmulationFlags: u32 {
        /// Emulate ETC2 via a compute-shader shadow image.
        const ETC2 = 1 << 0;
        /// Emulate ASTC via a compute-shader shadow image.
        const ASTC = 1 << 1;
        /// Decompress ASTC on the CPU instead of via compute shader when
        /// the copy source is a host-visible buffer.
        const ASTC_CPU_DECODE = 1 << 2;
    }
}

bitflags! {
    /// Driver quirks that change dispatcher behaviour, analogous to
    /// `wgpu_hal::vulkan::Workarounds`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Workarounds: u32 {
        /// Some Android implementations return `VK_SUBOPTIMAL_KHR` for
        /// reasons that do not matter to a host decoder; treat it as
        /// success.
        const IGNORE_SUBOPTIMAL_ON_ANDROID = 1 << 0;
        /// Serialize `vkCreateInstance`/`vkCreateDevice` under the global
        /// lock instead of releasing it, for drivers not safe to call
        /// concurrently with other global-state mutation.
        const SERIALIZE_INSTANCE_DEVICE_CREATION = 1 << 1;
    }
}

bitflags! {
    /// External memory/semaphore/fence handle types a device can
    /// import or export, gathered from `VkExternalMemoryHandleTypeFlags`
    /// and its semaphore/fence counterparts into one mask the
    /// external-resource bridge checks before attempting an import.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExternalHandleTypes: u32 {
        const OPAQUE_FD = 1 << 0;
        const OPAQUE_WIN32 = 1 << 1;
        const DMA_BUF = 1 << 2;
        const HOST_ALLOCATION = 1 << 3;
        const ANDROID_HARDWARE_BUFFER = 1 << 4;
        const ZIRCON_VMO = 1 << 5;
    }
}
