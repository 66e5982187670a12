//! State registries (§4.4): per-handle-kind record tables keyed by the
//! *native* (unboxed) handle, each behind the global recursive mutex.
//!
//! Grounded on `wgpu_core::registry::Registry<A, T, F>`'s role as "the
//! table that owns every live object of one kind", generalized from
//! wgpu's id-indexed `Storage` to a plain `FxHashMap` keyed by the native
//! handle's integer value — the simplification recorded in DESIGN.md's
//! Open Questions.

use std::sync::Arc;

use ash::vk;
use rustc_hash::FxHashMap;

use crate::compressed_image::CompressedImageInfo;
use crate::device_op_tracker::{DeviceOpTracker, DeviceOpWaitable};
use crate::fence::FenceRecord;
use crate::ordering::OrderingToken;

/// A weak liveness flag attached to resources descriptor writes may
/// depend on (images, image views, samplers, buffers), so a write
/// entry's staleness is observable at snapshot-save time (§3, §4.7,
/// invariant 7).
pub type Liveness = std::sync::Weak<()>;

pub fn new_liveness() -> (Arc<()>, Liveness) {
    let strong = Arc::new(());
    let weak = Arc::downgrade(&strong);
    (strong, weak)
}

pub struct InstanceRecord {
    pub raw: vk::Instance,
    pub shared: Arc<dhal::vulkan::InstanceShared>,
    pub enabled_extensions: Vec<String>,
    pub is_angle: bool,
}

pub struct PhysicalDeviceRecord {
    pub raw: vk::PhysicalDevice,
    pub instance: vk::Instance,
    pub queue_families: Vec<vk::QueueFamilyProperties>,
}

pub struct DeviceRecord {
    pub raw: vk::Device,
    pub shared: Arc<dhal::vulkan::DeviceShared>,
    pub physical_device: vk::PhysicalDevice,
    pub op_tracker: Arc<DeviceOpTracker>,
    pub texture_emulation: dty::TextureEmulationFlags,
    pub external_fence_types: dty::ExternalHandleTypes,
    pub external_semaphore_types: dty::ExternalHandleTypes,
    /// Built lazily on this device's first decompression dispatch (§4.9);
    /// `None` for a device that never emulates a compressed format.
    pub decompression: once_cell::sync::OnceCell<crate::compressed_pipeline::DecompressionResources>,
}

pub struct QueueRecord {
    pub raw: vk::Queue,
    pub device: vk::Device,
    pub family_index: u32,
    pub ordering: OrderingToken,
    pub sequence: std::sync::atomic::AtomicU64,
    /// Held across every native `vkQueueSubmit`/`vkQueueSubmit2`/
    /// `vkQueueBindSparse`/`vkQueueWaitIdle` call on this queue (§5 "each
    /// queue has its own lock"), so same-queue native submits are totally
    /// ordered (invariant 6). `OrderingToken` only gates guest-visible
    /// sequencing; it does not serialize the native call itself. `Arc`-
    /// wrapped so a dispatcher can clone it out and drop the global
    /// registries lock before blocking on the native call.
    pub submit_lock: Arc<parking_lot::Mutex<()>>,
}

pub struct MemoryRecord {
    pub raw: vk::DeviceMemory,
    pub device: vk::Device,
    pub size: vk::DeviceSize,
    pub cache_mode: crate::memory::CacheMode,
    pub provenance: crate::memory::MemoryProvenance,
    pub mapped_ptr: Option<u64>,
}

pub struct BufferRecord {
    pub raw: vk::Buffer,
    pub device: vk::Device,
    pub size: vk::DeviceSize,
    pub bound_memory: Option<(vk::DeviceMemory, vk::DeviceSize)>,
    pub liveness: Arc<()>,
}

pub struct ImageRecord {
    pub raw: vk::Image,
    pub device: vk::Device,
    pub format: vk::Format,
    pub create_info_extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub current_layout: vk::ImageLayout,
    pub bound_memory: Option<(vk::DeviceMemory, vk::DeviceSize)>,
    pub colorbuffer_id: Option<u32>,
    pub compressed: Option<CompressedImageInfo>,
    pub liveness: Arc<()>,
}

pub struct ImageViewRecord {
    pub raw: vk::ImageView,
    pub image: vk::Image,
    pub emulated_alpha: bool,
    pub liveness: Arc<()>,
}

pub struct SamplerRecord {
    pub raw: vk::Sampler,
    pub emulated_alpha: bool,
    pub liveness: Arc<()>,
}

pub struct SemaphoreRecord {
    pub raw: vk::Semaphore,
    pub latest_use: parking_lot::Mutex<Option<DeviceOpWaitable>>,
    pub exported_handle: Option<i32>,
}

/// A single tagged descriptor write, recorded into its owning set's
/// binding table so a later snapshot save can check dependency liveness
/// (§3, §4.7).
#[derive(Clone)]
pub enum DescriptorWriteEntry {
    Empty,
    Image {
        view: Liveness,
        sampler: Option<Liveness>,
    },
    Buffer {
        buffer: Liveness,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    },
    BufferView {
        buffer: Liveness,
    },
    InlineUniformBlock {
        bytes: Vec<u8>,
    },
    AccelerationStructure {
        structure: Liveness,
    },
}

pub struct DescriptorSetLayoutRecord {
    pub raw: vk::DescriptorSetLayout,
    pub bindings: Vec<vk::DescriptorSetLayoutBinding>,
}

pub struct DescriptorPoolRecord {
    pub raw: vk::DescriptorPool,
    pub device: vk::Device,
    pub max_sets: u32,
    pub allocated: FxHashMap<u64, vk::DescriptorSet>,
}

pub struct DescriptorSetRecord {
    pub raw: vk::DescriptorSet,
    pub pool: vk::DescriptorPool,
    pub layout: vk::DescriptorSetLayout,
    /// One entry per `(binding, element)`; `None` for unwritten slots.
    pub writes: FxHashMap<(u32, u32), DescriptorWriteEntry>,
}

impl DescriptorSetRecord {
    /// Records one write into the binding table (§4.7's shared
    /// `update_descriptor_sets` path, "records each write into the owning
    /// set's binding table"). Overwrites whatever was previously recorded
    /// at that slot, matching descriptor-update semantics (a later write
    /// to the same slot replaces the earlier one).
    pub fn apply_write(&mut self, binding: u32, element: u32, entry: DescriptorWriteEntry) {
        self.writes.insert((binding, element), entry);
    }
}

pub struct FenceTableRecord {
    pub record: Arc<FenceRecord>,
}

pub struct CommandPoolRecord {
    pub raw: vk::CommandPool,
    pub device: vk::Device,
}

pub struct CommandBufferRecord {
    pub raw: vk::CommandBuffer,
    pub pool: vk::CommandPool,
    pub acquired_colorbuffers: Vec<(u32, vk::ImageLayout)>,
    pub released_colorbuffers: Vec<u32>,
    pub image_layout_transitions: FxHashMap<vk::Image, vk::ImageLayout>,
    pub last_bound_compute: Option<(vk::Pipeline, Vec<vk::DescriptorSet>)>,
}

/// A plain keyed table, generic over the record type, protected by the
/// caller's global recursive lock (the table itself performs no
/// locking — see `GlobalState`).
pub struct Table<K, V> {
    entries: FxHashMap<K, V>,
}

impl<K: std::hash::Hash + Eq + Copy, V> Default for Table<K, V> {
    fn default() -> Self {
        Self {
            entries: FxHashMap::default(),
        }
    }
}

impl<K: std::hash::Hash + Eq + Copy, V> Table<K, V> {
    pub fn insert(&mut self, key: K, value: V) {
        self.entries.insert(key, value);
    }

    pub fn remove(&mut self, key: K) -> Option<V> {
        self.entries.remove(&key)
    }

    pub fn get(&self, key: K) -> Option<&V> {
        self.entries.get(&key)
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut V> {
        self.entries.get_mut(&key)
    }

    pub fn contains(&self, key: K) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter()
    }

    pub fn keys_sorted(&self) -> Vec<K>
    where
        K: Ord,
    {
        let mut keys: Vec<K> = self.entries.keys().copied().collect();
        keys.sort();
        keys
    }
}

/// Every per-kind table, owned by `VkDecoderGlobalState` and guarded by
/// its single recursive mutex (§4.4, §5).
#[derive(Default)]
pub struct Registries {
    pub instances: Table<u64, InstanceRecord>,
    pub physical_devices: Table<u64, PhysicalDeviceRecord>,
    pub devices: Table<u64, DeviceRecord>,
    pub queues: Table<u64, QueueRecord>,
    pub memories: Table<u64, MemoryRecord>,
    pub buffers: Table<u64, BufferRecord>,
    pub images: Table<u64, ImageRecord>,
    pub image_views: Table<u64, ImageViewRecord>,
    pub samplers: Table<u64, SamplerRecord>,
    pub semaphores: Table<u64, SemaphoreRecord>,
    pub fences: Table<u64, FenceTableRecord>,
    pub descriptor_set_layouts: Table<u64, DescriptorSetLayoutRecord>,
    pub descriptor_pools: Table<u64, DescriptorPoolRecord>,
    pub descriptor_sets: Table<u64, DescriptorSetRecord>,
    pub command_pools: Table<u64, CommandPoolRecord>,
    pub command_buffers: Table<u64, CommandBufferRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_insert_get_remove() {
        let mut table: Table<u64, u32> = Table::default();
        table.insert(1, 100);
        assert_eq!(table.get(1), Some(&100));
        assert_eq!(table.remove(1), Some(100));
        assert!(table.get(1).is_none());
    }

    #[test]
    fn keys_sorted_is_positional_for_snapshot() {
        let mut table: Table<u64, u32> = Table::default();
        table.insert(3, 0);
        table.insert(1, 0);
        table.insert(2, 0);
        assert_eq!(table.keys_sorted(), vec![1, 2, 3]);
    }
}
