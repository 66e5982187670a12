//! Compressed-texture decompression dispatch (§4.9): the dispatcher that
//! actually drives `CompressedPipelineManager` — building each image's
//! decode descriptor sets once, then recording the decode dispatch (and,
//! when it interrupts an in-flight compute pass, re-binding whatever the
//! command buffer had bound before).

use ash::vk;
use dty::{DriverError, HandleKind};

use crate::compressed_image::CompressedImageInfo;
use crate::compressed_pipeline::{CompressedShaderSource, DecompressionResources};
use crate::global::VkDecoderGlobalState;

/// Allocates (once, lazily) the per-mip descriptor sets binding a
/// compressed image's size-compatible shadow and decompressed-image
/// views (§4.9: "per image, `CompressedImageInfo` holds a shadow set").
fn ensure_image_descriptor_sets(
    device: &ash::Device,
    descriptor_set_layout: vk::DescriptorSetLayout,
    info: &mut CompressedImageInfo,
) -> Result<(), DriverError> {
    if info.decomp_descriptor_pool.is_some() {
        return Ok(());
    }
    let mip_levels = info.mip_levels.max(1);
    let pool_sizes = [vk::DescriptorPoolSize::default()
        .ty(vk::DescriptorType::STORAGE_IMAGE)
        .descriptor_count(mip_levels * 2)];
    let pool_info = vk::DescriptorPoolCreateInfo::default()
        .max_sets(mip_levels)
        .pool_sizes(&pool_sizes);
    let pool = unsafe { device.create_descriptor_pool(&pool_info, None) }.map_err(DriverError::from)?;

    let layouts = vec![descriptor_set_layout; mip_levels as usize];
    let alloc_info = vk::DescriptorSetAllocateInfo::default()
        .descriptor_pool(pool)
        .set_layouts(&layouts);
    let sets = match unsafe { device.allocate_descriptor_sets(&alloc_info) } {
        Ok(sets) => sets,
        Err(e) => {
            unsafe { device.destroy_descriptor_pool(pool, None) };
            return Err(DriverError::from(e));
        }
    };

    for (mip, &set) in sets.iter().enumerate() {
        let src_view = info.size_comp_images.get(mip).map(|m| m.view).unwrap_or(vk::ImageView::null());
        let dst_view = info.decomp_image_views.get(mip).copied().unwrap_or(vk::ImageView::null());
        let src_info = [vk::DescriptorImageInfo::default()
            .image_view(src_view)
            .image_layout(vk::ImageLayout::GENERAL)];
        let dst_info = [vk::DescriptorImageInfo::default()
            .image_view(dst_view)
            .image_layout(vk::ImageLayout::GENERAL)];
        let writes = [
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .image_info(&src_info),
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(1)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .image_info(&dst_info),
        ];
        unsafe { device.update_descriptor_sets(&writes, &[]) };
    }

    info.decomp_descriptor_pool = Some(pool);
    info.decomp_descriptor_sets = sets;
    info.decomp_descriptor_set_layout = Some(descriptor_set_layout);
    Ok(())
}

/// Records one compressed-mip decode dispatch into `command_buffer`
/// (§4.9's worked example): binds the cached pipeline and this mip's
/// descriptor set, pushes the decode constants (ETC2's
/// `{compressed-format, base-layer}` or ASTC's `{block-extent, format,
/// base-layer, sRGB-flag, small-block-flag}`, built by the caller),
/// dispatches one workgroup per compressed block, then re-binds whatever
/// compute pipeline/descriptor set the command buffer had bound before
/// this call, if any.
pub fn record_decompression_dispatch(
    state: &VkDecoderGlobalState,
    boxed_device: u64,
    boxed_image: u64,
    command_buffer: vk::CommandBuffer,
    mip_level: u32,
    push_constants: &[u8],
    shader_source: &dyn CompressedShaderSource,
) -> Result<(), DriverError> {
    let device_underlying = state.boxed.get_or_abort(boxed_device, HandleKind::Device);
    let image_underlying = state.boxed.get_or_abort(boxed_image, HandleKind::Image);
    let dispatch = state
        .boxed
        .get_dispatch(boxed_device)
        .expect("device dispatch missing for a live boxed device");
    let shared = dispatch
        .downcast::<dhal::vulkan::DeviceShared>()
        .expect("device dispatch entry was not a DeviceShared");

    let (pipeline_layout, pipeline, descriptor_set, groups, previous_bound) =
        state.with_registries(|regs| -> Result<_, DriverError> {
            let device_record = regs
                .devices
                .get_mut(device_underlying)
                .expect("decompression dispatch on a device with no tracked DeviceRecord");
            if device_record.decompression.get().is_none() {
                let resources = DecompressionResources::create(&shared.raw)?;
                let _ = device_record.decompression.set(resources);
            }
            let resources = device_record
                .decompression
                .get()
                .expect("decompression resources just initialized above");

            let image_record = regs
                .images
                .get_mut(image_underlying)
                .expect("decompression dispatch on an image with no tracked ImageRecord");
            let info = image_record.compressed.as_mut().ok_or(DriverError::FormatNotSupported)?;
            ensure_image_descriptor_sets(&shared.raw, resources.descriptor_set_layout, info)?;

            let pipeline =
                resources
                    .manager
                    .get_or_create(&shared.raw, shader_source, info.comp_format, info.extent.depth > 1)?;
            let descriptor_set = info
                .decomp_descriptor_sets
                .get(mip_level as usize)
                .copied()
                .ok_or(DriverError::FormatNotSupported)?;
            let groups = info.dispatch_groups(mip_level);

            let previous_bound = regs
                .command_buffers
                .get(command_buffer.as_raw())
                .and_then(|c| c.last_bound_compute.clone());
            if let Some(c) = regs.command_buffers.get_mut(command_buffer.as_raw()) {
                c.last_bound_compute = Some((pipeline, vec![descriptor_set]));
            }

            Ok((resources.pipeline_layout, pipeline, descriptor_set, groups, previous_bound))
        })?;

    unsafe {
        profiling::scope!("decompression dispatch");
        shared.raw.cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::COMPUTE, pipeline);
        shared.raw.cmd_bind_descriptor_sets(
            command_buffer,
            vk::PipelineBindPoint::COMPUTE,
            pipeline_layout,
            0,
            &[descriptor_set],
            &[],
        );
        if !push_constants.is_empty() {
            shared.raw.cmd_push_constants(
                command_buffer,
                pipeline_layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                push_constants,
            );
        }
        shared.raw.cmd_dispatch(command_buffer, groups.0, groups.1, groups.2);

        if let Some((prev_pipeline, prev_sets)) = previous_bound {
            shared.raw.cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::COMPUTE, prev_pipeline);
            if !prev_sets.is_empty() {
                shared.raw.cmd_bind_descriptor_sets(
                    command_buffer,
                    vk::PipelineBindPoint::COMPUTE,
                    pipeline_layout,
                    0,
                    &prev_sets,
                    &[],
                );
            }
        }
    }

    Ok(())
}
