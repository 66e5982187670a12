use ash::vk;
use dty::{BoxedHandle, DriverError, HandleKind};

use crate::global::VkDecoderGlobalState;
use crate::memory::{map_memory_property_flags, MemoryAllocator, MemoryProvenance};
use crate::registries::MemoryRecord;

/// `vkAllocateMemory`, boxed (§4.5). Resolves provenance (plain
/// allocation, colour-buffer import, or guest-blob import) via
/// `MemoryAllocator`, chains the matching import struct onto the native
/// call, and maps the whole range immediately when the memory type is
/// host-visible and no external pathway already owns the mapping.
pub fn allocate_memory(
    state: &VkDecoderGlobalState,
    boxed_device: u64,
    memory_type_index: u32,
    size: vk::DeviceSize,
    colorbuffer_id: Option<u32>,
    import_blob_id: Option<u64>,
) -> Result<BoxedHandle, DriverError> {
    let device_underlying = state.boxed.get_or_abort(boxed_device, HandleKind::Device);
    let dispatch = state
        .boxed
        .get_dispatch(boxed_device)
        .expect("device dispatch missing for a live boxed device");
    let shared = dispatch
        .downcast::<dhal::vulkan::DeviceShared>()
        .expect("device dispatch entry was not a DeviceShared");

    let allocator = MemoryAllocator::new(
        state.collaborators.colorbuffers.clone(),
        state.collaborators.external_objects.clone(),
    );
    let provenance = allocator
        .resolve_provenance(colorbuffer_id, import_blob_id)
        .ok_or(DriverError::FormatNotSupported)?;

    let memory_properties = unsafe {
        shared
            .instance
            .raw
            .get_physical_device_memory_properties(shared.physical_device)
    };
    let property_flags = memory_properties
        .memory_types
        .get(memory_type_index as usize)
        .map(|t| t.property_flags)
        .unwrap_or(vk::MemoryPropertyFlags::empty());
    let cache_mode = map_memory_property_flags(property_flags);
    let host_visible = property_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE);

    let mut imported_fd: Option<i32> = None;
    if let MemoryProvenance::ImportedBuffer { blob_id } = &provenance {
        if let Some((fd, _handle_type)) = state.collaborators.external_objects.remove_blob_descriptor_info(*blob_id) {
            imported_fd = Some(fd);
        }
    }

    let alloc_info = vk::MemoryAllocateInfo::default()
        .allocation_size(size)
        .memory_type_index(memory_type_index);

    let mut import_info;
    let alloc_info = if let Some(fd) = imported_fd {
        import_info = vk::ImportMemoryFdInfoKHR::default()
            .handle_type(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD)
            .fd(fd);
        alloc_info.push_next(&mut import_info)
    } else {
        alloc_info
    };

    let raw = {
        profiling::scope!("vkAllocateMemory");
        unsafe { shared.raw.allocate_memory(&alloc_info, None) }.map_err(DriverError::from)?
    };

    let mapped_ptr = if host_visible && !matches!(provenance, MemoryProvenance::ImportedColorBuffer { .. }) {
        let ptr = unsafe { shared.raw.map_memory(raw, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()) }
            .map_err(DriverError::from)? as *mut u8;
        Some(ptr as u64)
    } else {
        None
    };

    state.with_registries(|regs| {
        regs.memories.insert(
            raw.as_raw(),
            MemoryRecord {
                raw,
                device: vk::Device::from_raw(device_underlying),
                size,
                cache_mode,
                provenance,
                mapped_ptr,
            },
        );
    });

    Ok(state.boxed.add(HandleKind::Memory, raw.as_raw()))
}

/// `map_memory(offset, size)` (§4.5): never calls the driver, returns
/// `mapping.ptr + offset` from the whole-range mapping cached at
/// allocation time.
pub fn map_memory(state: &VkDecoderGlobalState, boxed_memory: u64, offset: vk::DeviceSize) -> Option<*mut u8> {
    let underlying = state.boxed.get(boxed_memory)?;
    state.with_registries(|regs| {
        regs.memories
            .get(underlying)
            .and_then(|m| m.mapped_ptr)
            .map(|base| unsafe { (base as *mut u8).add(offset as usize) })
    })
}

/// `get_blob` (§4.5): exports the allocation as a reusable OS handle and
/// registers it with the external-object manager along with its cache
/// mode and Vulkan-specific metadata.
pub fn get_memory_blob(
    state: &VkDecoderGlobalState,
    boxed_device: u64,
    boxed_memory: u64,
    blob_id: u64,
    device_uuid: [u8; 16],
) -> Result<i32, DriverError> {
    let memory_underlying = state.boxed.get_or_abort(boxed_memory, HandleKind::Memory);
    let dispatch = state
        .boxed
        .get_dispatch(boxed_device)
        .expect("device dispatch missing for a live boxed device");
    let shared = dispatch
        .downcast::<dhal::vulkan::DeviceShared>()
        .expect("device dispatch entry was not a DeviceShared");

    let raw = vk::DeviceMemory::from_raw(memory_underlying);
    let os_handle = dhal::vulkan::export_memory_fd(&shared.extension_fns, raw)?;

    let cache_mode = state.with_registries(|regs| regs.memories.get(memory_underlying).map(|m| m.cache_mode));
    if let Some(cache_mode) = cache_mode {
        state.collaborators.external_objects.add_blob_descriptor_info(
            blob_id,
            os_handle,
            dty::ExternalHandleTypes::OPAQUE_FD,
            cache_mode,
            Some(crate::external::VulkanBlobInfo {
                memory_type_index: 0,
                device_uuid,
            }),
        );
    }

    Ok(os_handle)
}

/// `vkFreeMemory`, boxed (§4.4 destruction-path recipe): unmaps the
/// cached whole-range mapping (if any) before freeing the native
/// allocation.
pub fn free_memory(state: &VkDecoderGlobalState, boxed_device: u64, boxed_memory: u64) {
    let underlying = match state.boxed.get(boxed_memory) {
        Some(u) => u,
        None => return,
    };

    let dispatch = state.boxed.get_dispatch(boxed_device);
    let shared = dispatch.and_then(|d| d.downcast::<dhal::vulkan::DeviceShared>().ok());

    let was_mapped = state.with_registries(|regs| {
        let was_mapped = regs.memories.get(underlying).is_some_and(|m| m.mapped_ptr.is_some());
        regs.memories.remove(underlying);
        was_mapped
    });
    state.boxed.remove(boxed_memory);

    if let Some(shared) = shared {
        let raw = vk::DeviceMemory::from_raw(underlying);
        if was_mapped {
            unsafe { shared.raw.unmap_memory(raw) };
        }
        unsafe { shared.raw.free_memory(raw, None) };
    }
}
