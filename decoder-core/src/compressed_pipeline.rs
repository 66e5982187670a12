//! Lazy compute-pipeline manager for compressed-texture decompression
//! (§4.9, §1): turns a SPIR-V blob supplied by an out-of-scope
//! collaborator into a cached `VkPipeline`, one per `(compressed format,
//! is-3d)` pair, the way `CompressedImageInfo` caches its per-image
//! shadow resources.

use std::ffi::CStr;

use ash::vk;
use dty::DriverError;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// The compute shader blobs themselves are an explicit out-of-scope
/// collaborator (§1): this crate only knows how to turn one into a
/// pipeline, not where its bytes come from.
pub trait CompressedShaderSource: Send + Sync {
    /// Returns the SPIR-V words for decompressing `comp_format`, or
    /// `None` if this source has no shader for it.
    fn spirv_for(&self, comp_format: vk::Format, is_3d: bool) -> Option<Vec<u32>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PipelineKey {
    format: vk::Format,
    is_3d: bool,
}

struct CachedPipeline {
    shader_module: vk::ShaderModule,
    pipeline: vk::Pipeline,
}

/// Push-constant block size the decode shaders are compiled against:
/// large enough for ETC2's `{compressed-format, base-layer}` and ASTC's
/// `{block-extent, format, base-layer, sRGB-flag, small-block-flag}`
/// (§4.9).
pub const DECOMPRESSION_PUSH_CONSTANT_BYTES: u32 = 16;

/// One device's lazily-built decompression resources: a descriptor-set
/// layout shared by every compressed format (binding 0: the compressed
/// image's size-compatible shadow view, binding 1: the decompressed
/// output view) and the pipeline layout/manager built against it (§4.9).
pub struct DecompressionResources {
    pub descriptor_set_layout: vk::DescriptorSetLayout,
    pub pipeline_layout: vk::PipelineLayout,
    pub manager: CompressedPipelineManager,
}

impl DecompressionResources {
    pub fn create(device: &ash::Device) -> Result<Self, DriverError> {
        let bindings = [
            vk::DescriptorSetLayoutBinding::default()
                .binding(0)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE),
            vk::DescriptorSetLayoutBinding::default()
                .binding(1)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE),
        ];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let descriptor_set_layout =
            unsafe { device.create_descriptor_set_layout(&layout_info, None) }.map_err(DriverError::from)?;

        let push_constant_range = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(DECOMPRESSION_PUSH_CONSTANT_BYTES);
        let set_layouts = [descriptor_set_layout];
        let push_constant_ranges = [push_constant_range];
        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constant_ranges);
        let pipeline_layout = match unsafe { device.create_pipeline_layout(&pipeline_layout_info, None) } {
            Ok(layout) => layout,
            Err(e) => {
                unsafe { device.destroy_descriptor_set_layout(descriptor_set_layout, None) };
                return Err(DriverError::from(e));
            }
        };

        Ok(Self {
            descriptor_set_layout,
            pipeline_layout,
            manager: CompressedPipelineManager::new(pipeline_layout),
        })
    }

    pub fn destroy(&self, device: &ash::Device) {
        self.manager.destroy_all(device);
        unsafe {
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
        }
    }
}

/// Caches one decompression `VkPipeline` per `(format, is_3d)`, built
/// against a fixed pipeline layout supplied at construction (the layout
/// is shared across every compressed format since the binding set shape
/// is the same, per gfxstream's single decompression descriptor layout).
pub struct CompressedPipelineManager {
    layout: vk::PipelineLayout,
    cache: Mutex<FxHashMap<PipelineKey, CachedPipeline>>,
}

impl CompressedPipelineManager {
    pub fn new(layout: vk::PipelineLayout) -> Self {
        Self {
            layout,
            cache: Mutex::new(FxHashMap::default()),
        }
    }

    /// Returns the cached pipeline for `(comp_format, is_3d)`, building it
    /// from `source` on first use.
    pub fn get_or_create(
        &self,
        device: &ash::Device,
        source: &dyn CompressedShaderSource,
        comp_format: vk::Format,
        is_3d: bool,
    ) -> Result<vk::Pipeline, DriverError> {
        let key = PipelineKey { format: comp_format, is_3d };
        let mut cache = self.cache.lock();
        if let Some(cached) = cache.get(&key) {
            return Ok(cached.pipeline);
        }

        let spirv = source.spirv_for(comp_format, is_3d).ok_or(DriverError::FormatNotSupported)?;
        let module_info = vk::ShaderModuleCreateInfo::default().code(&spirv);
        let shader_module = unsafe { device.create_shader_module(&module_info, None) }.map_err(DriverError::from)?;

        let entry_point = CStr::from_bytes_with_nul(b"main\0").expect("literal nul-terminated string");
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader_module)
            .name(entry_point);
        let pipeline_info = vk::ComputePipelineCreateInfo::default().stage(stage).layout(self.layout);

        let pipeline = match unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        } {
            Ok(pipelines) => pipelines[0],
            Err((_, result)) => {
                unsafe { device.destroy_shader_module(shader_module, None) };
                return Err(DriverError::from(result));
            }
        };

        cache.insert(key, CachedPipeline { shader_module, pipeline });
        Ok(pipeline)
    }

    /// Destroys every cached pipeline and shader module; called once at
    /// device teardown, mirroring how `DeviceShared`'s `render_passes`/
    /// `framebuffers` caches are torn down.
    pub fn destroy_all(&self, device: &ash::Device) {
        let mut cache = self.cache.lock();
        for (_, cached) in cache.drain() {
            unsafe {
                device.destroy_pipeline(cached.pipeline, None);
                device.destroy_shader_module(cached.shader_module, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoShaders;
    impl CompressedShaderSource for NoShaders {
        fn spirv_for(&self, _comp_format: vk::Format, _is_3d: bool) -> Option<Vec<u32>> {
            None
        }
    }

    #[test]
    fn pipeline_key_distinguishes_2d_from_3d() {
        let a = PipelineKey { format: vk::Format::ETC2_R8G8B8_UNORM_BLOCK, is_3d: false };
        let b = PipelineKey { format: vk::Format::ETC2_R8G8B8_UNORM_BLOCK, is_3d: true };
        assert_ne!(a, b);
    }

    #[test]
    fn missing_shader_source_is_reported_as_format_not_supported() {
        assert!(NoShaders.spirv_for(vk::Format::ETC2_R8G8B8_UNORM_BLOCK, false).is_none());
    }
}
