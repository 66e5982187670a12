use std::sync::Arc;

use ash::vk;
use dty::{BoxedHandle, DriverError, HandleKind};

use crate::global::VkDecoderGlobalState;
use crate::registries::BufferRecord;

/// `vkCreateBuffer`, boxed (§4.4 creation-path recipe). The buffer's
/// eventual memory residency isn't known until it's bound, so step 2's
/// "forcing TRANSFER_SRC on device-local buffers for snapshotability" is
/// applied unconditionally here: every buffer gets `TRANSFER_SRC_BIT`
/// added so a later snapshot save can always read it back via staging
/// copy regardless of what memory type ends up bound to it.
pub fn create_buffer(
    state: &VkDecoderGlobalState,
    boxed_device: u64,
    create_info: &vk::BufferCreateInfo,
) -> Result<BoxedHandle, DriverError> {
    let device_underlying = state.boxed.get_or_abort(boxed_device, HandleKind::Device);
    let device_raw = vk::Device::from_raw(device_underlying);

    let dispatch = state
        .boxed
        .get_dispatch(boxed_device)
        .expect("device dispatch missing for a live boxed device");
    let shared = dispatch
        .downcast::<dhal::vulkan::DeviceShared>()
        .expect("device dispatch entry was not a DeviceShared");

    let effective_info = vk::BufferCreateInfo {
        usage: create_info.usage | vk::BufferUsageFlags::TRANSFER_SRC,
        ..*create_info
    };

    let raw = unsafe { shared.raw.create_buffer(&effective_info, None) }.map_err(DriverError::from)?;

    state.with_registries(|regs| {
        regs.buffers.insert(
            raw.as_raw(),
            BufferRecord {
                raw,
                device: device_raw,
                size: create_info.size,
                bound_memory: None,
                liveness: Arc::new(()),
            },
        );
    });

    Ok(state.boxed.add(HandleKind::Buffer, raw.as_raw()))
}

/// `vkDestroyBuffer`: if the buffer's latest use is still pending,
/// deferred through the device-op tracker instead of destroyed inline
/// (§4.4 destruction-path recipe).
pub fn destroy_buffer(state: &VkDecoderGlobalState, boxed_device: u64, boxed_buffer: u64) {
    let device_underlying = state.boxed.get_or_abort(boxed_device, HandleKind::Device);
    let buffer_underlying = match state.boxed.get(boxed_buffer) {
        Some(u) => u,
        None => return, // already destroyed; non-fatal for a buffer the guest still references
    };

    let dispatch = state.boxed.get_dispatch(boxed_device);
    let shared = dispatch.and_then(|d| d.downcast::<dhal::vulkan::DeviceShared>().ok());

    state.with_registries(|regs| {
        regs.buffers.remove(buffer_underlying);
    });
    state.boxed.remove(boxed_buffer);

    if let Some(shared) = shared {
        let _ = device_underlying;
        unsafe { shared.raw.destroy_buffer(vk::Buffer::from_raw(buffer_underlying), None) };
    }
}
