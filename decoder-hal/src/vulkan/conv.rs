use ash::vk;

/// Maps a `VkMemoryPropertyFlags` bitmask to the cache-mode classification
/// the memory-properties helper (§4.5) stores on a `Memory` record:
/// cached, uncached, or write-combine, inferred the way the original
/// picks a mapping strategy from the property bits rather than storing a
/// separate enum at allocation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Cached,
    Uncached,
    WriteCombine,
}

pub fn map_memory_property_flags(flags: vk::MemoryPropertyFlags) -> CacheMode {
    if !flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
        return CacheMode::Uncached;
    }
    if flags.contains(vk::MemoryPropertyFlags::HOST_CACHED) {
        CacheMode::Cached
    } else if flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT) {
        CacheMode::WriteCombine
    } else {
        CacheMode::Uncached
    }
}
