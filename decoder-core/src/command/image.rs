use std::sync::Arc;

use ash::vk;
use dty::{BoxedHandle, DriverError, HandleKind};

use crate::compressed_image::{is_astc, is_etc2, size_compatible_format, CompressedImageInfo};
use crate::global::VkDecoderGlobalState;
use crate::registries::ImageRecord;

/// `vkCreateImage`, boxed. When the format is one of the device's
/// emulated compressed formats, the create-info is rewritten to the
/// size-compatible uncompressed format with `MUTABLE_FORMAT` and
/// `STORAGE` added, and a `CompressedImageInfo` shadow is attached to the
/// record (§4.6 "Compressed-format detour", §4.9).
pub fn create_image(
    state: &VkDecoderGlobalState,
    boxed_device: u64,
    create_info: &vk::ImageCreateInfo,
) -> Result<BoxedHandle, DriverError> {
    let device_underlying = state.boxed.get_or_abort(boxed_device, HandleKind::Device);
    let dispatch = state
        .boxed
        .get_dispatch(boxed_device)
        .expect("device dispatch missing for a live boxed device");
    let shared = dispatch
        .downcast::<dhal::vulkan::DeviceShared>()
        .expect("device dispatch entry was not a DeviceShared");

    let texture_emulation = state
        .with_registries(|regs| regs.devices.get(device_underlying).map(|d| d.texture_emulation))
        .unwrap_or_default();

    let emulate = (is_etc2(create_info.format) && texture_emulation.contains(dty::TextureEmulationFlags::ETC2))
        || (is_astc(create_info.format) && texture_emulation.contains(dty::TextureEmulationFlags::ASTC));

    if emulate
        && (create_info.usage.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            || create_info.image_type == vk::ImageType::TYPE_1D)
    {
        return Err(DriverError::FormatNotSupported);
    }

    let mut effective_info = *create_info;
    let mut compressed = None;
    if emulate {
        let shadow_format = size_compatible_format(create_info.format);
        effective_info.format = shadow_format;
        effective_info.flags |= vk::ImageCreateFlags::MUTABLE_FORMAT | vk::ImageCreateFlags::EXTENDED_USAGE;
        effective_info.usage |= vk::ImageUsageFlags::STORAGE;
        compressed = Some(CompressedImageInfo::new(
            create_info.format,
            create_info.extent,
            create_info.mip_levels,
            create_info.array_layers,
        ));
    }

    let raw = unsafe { shared.raw.create_image(&effective_info, None) }.map_err(DriverError::from)?;

    state.with_registries(|regs| {
        regs.images.insert(
            raw.as_raw(),
            ImageRecord {
                raw,
                device: vk::Device::from_raw(device_underlying),
                format: create_info.format,
                create_info_extent: create_info.extent,
                mip_levels: create_info.mip_levels,
                array_layers: create_info.array_layers,
                current_layout: vk::ImageLayout::UNDEFINED,
                bound_memory: None,
                colorbuffer_id: None,
                compressed,
                liveness: Arc::new(()),
            },
        );
    });

    Ok(state.boxed.add(HandleKind::Image, raw.as_raw()))
}

/// One `VkBufferImageCopy` region, rewritten into the shadow image's
/// block-count domain when the destination image is emulated-compressed
/// (§4.6, §4.9).
pub fn cmd_copy_buffer_to_image(
    state: &VkDecoderGlobalState,
    boxed_image: u64,
    regions: &[vk::BufferImageCopy],
) -> Vec<vk::BufferImageCopy> {
    let image_underlying = match state.boxed.get(boxed_image) {
        Some(u) => u,
        None => return regions.to_vec(),
    };

    let rewritten = state.with_registries(|regs| {
        let record = regs.images.get(image_underlying)?;
        let info = record.compressed.as_ref()?;
        Some(
            regions
                .iter()
                .map(|region| {
                    let (offset, extent) =
                        info.rewrite_region_to_size_compatible(region.image_offset, region.image_extent);
                    vk::BufferImageCopy {
                        image_offset: offset,
                        image_extent: extent,
                        image_subresource: vk::ImageSubresourceLayers {
                            mip_level: 0,
                            ..region.image_subresource
                        },
                        ..*region
                    }
                })
                .collect::<Vec<_>>(),
        )
    });

    rewritten.unwrap_or_else(|| regions.to_vec())
}
