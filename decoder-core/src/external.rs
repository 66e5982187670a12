//! Collaborator contracts (§6): narrow trait interfaces to systems this
//! crate treats as out of scope (colour-buffer manager, external-object
//! manager, address-space device, process-cleanup registry, metrics
//! logger). A production embedding supplies concrete implementations; the
//! `tests` crate supplies fakes.

use ash::vk;
use dty::ExternalHandleTypes;

use crate::device_op_tracker::{DeviceOpTracker, DeviceOpWaitable};

/// Allocation facts about a colour buffer, returned to the memory
/// allocator when a guest imports one as `VkDeviceMemory` (§4.5).
#[derive(Debug, Clone, Copy)]
pub struct ColorBufferAllocationInfo {
    pub size: vk::DeviceSize,
    pub host_memory_type_index: u32,
    pub uses_dedicated_allocation: bool,
}

/// The compositor-owned surface manager. Images backed by a colour buffer
/// never have their native `VkImage` owned by this crate; every access
/// goes through this trait (§6).
pub trait ColorBufferManager: Send + Sync {
    fn get_allocation_info(&self, id: u32) -> Option<ColorBufferAllocationInfo>;
    fn get_external_memory_handle(&self, id: u32) -> Option<i32>;
    fn get_image(&self, id: u32) -> Option<vk::Image>;
    fn invalidate(&self, id: u32);
    fn flush(&self, id: u32);
    fn set_current_layout(&self, id: u32, layout: vk::ImageLayout);
    /// Records the waitable for the submission that last touched this
    /// colour buffer, so the compositor can defer reading it until the
    /// GPU work is actually done (§4.8 step 5, §6).
    fn set_latest_use(&self, id: u32, waitable: DeviceOpWaitable, tracker: &DeviceOpTracker);
    /// Copies a tracked image's current contents into the colour buffer's
    /// backing storage, used when the two are not the same underlying
    /// allocation (§6).
    fn sync_image_to_colorbuffer(&self, id: u32, image: vk::Image, layout: vk::ImageLayout);
}

/// Cache mode inferred from `VkMemoryPropertyFlags`, attached to every
/// blob the external-object manager tracks.
pub use crate::memory::CacheMode;

#[derive(Debug, Clone, Copy)]
pub struct VulkanBlobInfo {
    pub memory_type_index: u32,
    pub device_uuid: [u8; 16],
}

/// Shared with the guest-memory subsystem: registers OS handles exported
/// from this crate's allocations, and returns them back on import (§4.5,
/// §4.6).
pub trait ExternalObjectManager: Send + Sync {
    fn add_blob_descriptor_info(
        &self,
        blob_id: u64,
        handle: i32,
        handle_type: ExternalHandleTypes,
        cache_mode: CacheMode,
        vulkan_info: Option<VulkanBlobInfo>,
    );
    fn remove_blob_descriptor_info(&self, blob_id: u64) -> Option<(i32, ExternalHandleTypes)>;
    /// Registers an exported semaphore/fence OS handle, mirroring
    /// `add_blob_descriptor_info` for memory but keyed on the sync object's
    /// boxed token rather than a blob id (§6).
    fn add_sync_descriptor_info(&self, sync_id: u64, handle: i32, handle_type: ExternalHandleTypes);
    fn add_mapping(&self, blob_id: u64, ptr: *mut u8, cache_mode: CacheMode);
}

/// The address-space device (`goldfish_address_space` in the original):
/// maps/unmaps host-allocated memory into guest physical address space
/// for the direct-map allocation path (§4.5).
pub trait AddressSpaceDevice: Send + Sync {
    fn map_user_backed_ram(&self, gpa: u64, hva: *mut u8, size: u64);
    fn unmap_user_backed_ram(&self, gpa: u64, size: u64);
    fn register_deallocation_callback(&self, key: u64, gpa: u64, cb: Box<dyn FnOnce() + Send>);
}

/// Tracks per-process cleanup so the facade can tear down all instances
/// a crashed guest process owned (§6).
pub trait ProcessCleanupRegistry: Send + Sync {
    fn register(&self, process_id: u64, cb: Box<dyn FnOnce() + Send>);
    fn unregister(&self, process_id: u64);
}

/// Reports out-of-memory events, the only metric the spec names (§7).
pub trait MetricsLogger: Send + Sync {
    fn report_out_of_memory(&self, op_code: u32, allocation_size: Option<u64>);
}
