use std::time::Duration;

use dty::TextureEmulationFlags;

/// Tunables read from the environment at process start, the way
/// `wgpu_hal`'s Vulkan backend reads `WGPU_VALIDATION`/`WGPU_DEBUG` style
/// variables. None of these change wire-format semantics; they only
/// change when the decoder emulates, warns, or leaks.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// Compressed-texture formats to emulate on devices lacking native
    /// support. Defaults to ETC2 + ASTC, matching the common guest
    /// feature set gfxstream targets.
    pub texture_emulation: TextureEmulationFlags,
    /// Deadline after which `host_sync`/`host_sync_queue` gives up
    /// waiting on a sibling thread and advances unilaterally (§4.2).
    pub host_sync_deadline: Duration,
    /// Number of entries in the device-op tracker's poll queue or
    /// pending-garbage queue past which a warning is logged (gfxstream:
    /// `kSizeLoggingThreshold`).
    pub gc_queue_warn_threshold: usize,
    /// Age past which pending garbage is leaked rather than waited on
    /// (gfxstream: `kTimeThreshold`).
    pub gc_leak_timeout: Duration,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            texture_emulation: TextureEmulationFlags::ETC2 | TextureEmulationFlags::ASTC,
            host_sync_deadline: Duration::from_secs(5),
            gc_queue_warn_threshold: 20,
            gc_leak_timeout: Duration::from_secs(5),
        }
    }
}

impl DecoderConfig {
    /// Reads `DECODER_DISABLE_ETC2`, `DECODER_DISABLE_ASTC`,
    /// `DECODER_ASTC_CPU_DECODE`, `DECODER_HOST_SYNC_DEADLINE_MS`,
    /// `DECODER_GC_WARN_THRESHOLD`, `DECODER_GC_LEAK_TIMEOUT_MS`,
    /// falling back to `Default` for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if env_flag_set("DECODER_DISABLE_ETC2") {
            cfg.texture_emulation.remove(TextureEmulationFlags::ETC2);
        }
        if env_flag_set("DECODER_DISABLE_ASTC") {
            cfg.texture_emulation.remove(TextureEmulationFlags::ASTC);
        }
        if env_flag_set("DECODER_ASTC_CPU_DECODE") {
            cfg.texture_emulation.insert(TextureEmulationFlags::ASTC_CPU_DECODE);
        }
        if let Some(ms) = env_u64("DECODER_HOST_SYNC_DEADLINE_MS") {
            cfg.host_sync_deadline = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("DECODER_GC_WARN_THRESHOLD") {
            cfg.gc_queue_warn_threshold = n as usize;
        }
        if let Some(ms) = env_u64("DECODER_GC_LEAK_TIMEOUT_MS") {
            cfg.gc_leak_timeout = Duration::from_millis(ms);
        }
        cfg
    }
}

fn env_flag_set(name: &str) -> bool {
    std::env::var_os(name).is_some_and(|v| v != "0")
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
