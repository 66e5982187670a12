//! Memory allocation and mapping (§4.5): translates guest memory-type
//! indices, handles colour-buffer/blob import, and owns the single
//! whole-range mapping a host-visible allocation gets.

use std::sync::Arc;

use ash::vk;
pub use dhal::vulkan::conv::CacheMode;
pub use dhal::vulkan::map_memory_property_flags;
use dty::DriverError;

use crate::external::{ColorBufferManager, ExternalObjectManager, VulkanBlobInfo};

/// Where a `Memory` record's bytes ultimately came from, per §3's
/// "discriminated reference to its provenance".
pub enum MemoryProvenance {
    LocalAllocation,
    ImportedColorBuffer { colorbuffer_id: u32 },
    ImportedBuffer { blob_id: u64 },
    SharedMemoryBlob { blob_id: u64 },
    PrivateHostPointerImport,
    DirectMappedToGuestPhysical { gpa: u64 },
}

pub struct Memory {
    pub raw: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    pub cache_mode: CacheMode,
    pub provenance: MemoryProvenance,
    /// Non-null only once `map_memory` has been called; the whole range
    /// is mapped exactly once and cached here for the allocation's
    /// lifetime (invariant 4, §8).
    mapping: Option<*mut u8>,
}

// SAFETY: the mapping pointer is host-visible device memory; access to
// it is externally synchronized by the guest's own barriers, same as any
// `wgpu_hal` mapped-pointer field.
unsafe impl Send for Memory {}
unsafe impl Sync for Memory {}

impl Memory {
    pub fn new(raw: vk::DeviceMemory, size: vk::DeviceSize, cache_mode: CacheMode, provenance: MemoryProvenance) -> Self {
        Self {
            raw,
            size,
            cache_mode,
            provenance,
            mapping: None,
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    /// Maps the whole range if not already mapped, and returns
    /// `base_ptr + offset`.
    pub fn map(&mut self, device: &ash::Device, offset: vk::DeviceSize) -> Result<*mut u8, DriverError> {
        let base = match self.mapping {
            Some(ptr) => ptr,
            None => {
                let ptr = unsafe {
                    device.map_memory(self.raw, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                }
                .map_err(DriverError::from)? as *mut u8;
                self.mapping = Some(ptr);
                ptr
            }
        };
        Ok(unsafe { base.add(offset as usize) })
    }
}

/// Drives the allocate-memory dispatcher's provenance decisions (§4.5).
pub struct MemoryAllocator {
    colorbuffers: Arc<dyn ColorBufferManager>,
    external_objects: Arc<dyn ExternalObjectManager>,
}

impl MemoryAllocator {
    pub fn new(
        colorbuffers: Arc<dyn ColorBufferManager>,
        external_objects: Arc<dyn ExternalObjectManager>,
    ) -> Self {
        Self {
            colorbuffers,
            external_objects,
        }
    }

    /// Resolves which provenance an allocate-memory call should use,
    /// given the guest's requested colour-buffer/blob id (if any). Does
    /// not call the driver; the dispatcher combines this with the actual
    /// `vkAllocateMemory` call (§4.4's creation-path recipe).
    pub fn resolve_provenance(
        &self,
        colorbuffer_id: Option<u32>,
        import_blob_id: Option<u64>,
    ) -> Option<MemoryProvenance> {
        if let Some(id) = colorbuffer_id {
            self.colorbuffers.get_allocation_info(id)?;
            return Some(MemoryProvenance::ImportedColorBuffer { colorbuffer_id: id });
        }
        if let Some(blob) = import_blob_id {
            return Some(MemoryProvenance::ImportedBuffer { blob_id: blob });
        }
        Some(MemoryProvenance::LocalAllocation)
    }

    /// Exports an allocation as a reusable blob (`get_blob`, §4.5):
    /// registers it with the external-object manager and returns the
    /// blob id the guest should remember.
    pub fn get_blob(
        &self,
        blob_id: u64,
        os_handle: i32,
        handle_type: dty::ExternalHandleTypes,
        memory: &Memory,
        memory_type_index: u32,
        device_uuid: [u8; 16],
    ) {
        self.external_objects.add_blob_descriptor_info(
            blob_id,
            os_handle,
            handle_type,
            memory.cache_mode,
            Some(VulkanBlobInfo {
                memory_type_index,
                device_uuid,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoColorBuffers;
    impl ColorBufferManager for NoColorBuffers {
        fn get_allocation_info(&self, _id: u32) -> Option<crate::external::ColorBufferAllocationInfo> {
            None
        }
        fn get_external_memory_handle(&self, _id: u32) -> Option<i32> {
            None
        }
        fn get_image(&self, _id: u32) -> Option<vk::Image> {
            None
        }
        fn invalidate(&self, _id: u32) {}
        fn flush(&self, _id: u32) {}
        fn set_current_layout(&self, _id: u32, _layout: vk::ImageLayout) {}
        fn set_latest_use(
            &self,
            _id: u32,
            _waitable: crate::device_op_tracker::DeviceOpWaitable,
            _tracker: &crate::device_op_tracker::DeviceOpTracker,
        ) {
        }
        fn sync_image_to_colorbuffer(&self, _id: u32, _image: vk::Image, _layout: vk::ImageLayout) {}
    }

    struct NoExternalObjects;
    impl ExternalObjectManager for NoExternalObjects {
        fn add_blob_descriptor_info(
            &self,
            _blob_id: u64,
            _handle: i32,
            _handle_type: dty::ExternalHandleTypes,
            _cache_mode: CacheMode,
            _vulkan_info: Option<VulkanBlobInfo>,
        ) {
        }
        fn remove_blob_descriptor_info(&self, _blob_id: u64) -> Option<(i32, dty::ExternalHandleTypes)> {
            None
        }
        fn add_sync_descriptor_info(&self, _sync_id: u64, _handle: i32, _handle_type: dty::ExternalHandleTypes) {}
        fn add_mapping(&self, _blob_id: u64, _ptr: *mut u8, _cache_mode: CacheMode) {}
    }

    #[test]
    fn default_provenance_is_local_allocation() {
        let allocator = MemoryAllocator::new(Arc::new(NoColorBuffers), Arc::new(NoExternalObjects));
        let provenance = allocator.resolve_provenance(None, None).unwrap();
        assert!(matches!(provenance, MemoryProvenance::LocalAllocation));
    }

    #[test]
    fn unknown_colorbuffer_id_fails_resolution() {
        let allocator = MemoryAllocator::new(Arc::new(NoColorBuffers), Arc::new(NoExternalObjects));
        assert!(allocator.resolve_provenance(Some(7), None).is_none());
    }
}
