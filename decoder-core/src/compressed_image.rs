//! Compressed-texture emulation (§4.9).
//!
//! Field shape grounded directly on gfxstream's `CompressedImageInfo`
//! (`original_source/stream-servers/vulkan/emulated_textures/CompressedImageInfo.h`):
//! a compressed format, its decompressed and size-compatible formats, a
//! shadow "size-compatible" image per mip, and the compute-shader
//! decompression pipeline's resources.

use ash::vk;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulatedCompressedFormat {
    Etc2,
    Astc,
}

pub fn is_etc2(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::ETC2_R8G8B8_UNORM_BLOCK
            | vk::Format::ETC2_R8G8B8_SRGB_BLOCK
            | vk::Format::ETC2_R8G8B8A1_UNORM_BLOCK
            | vk::Format::ETC2_R8G8B8A1_SRGB_BLOCK
            | vk::Format::ETC2_R8G8B8A8_UNORM_BLOCK
            | vk::Format::ETC2_R8G8B8A8_SRGB_BLOCK
            | vk::Format::EAC_R11_UNORM_BLOCK
            | vk::Format::EAC_R11_SNORM_BLOCK
            | vk::Format::EAC_R11G11_UNORM_BLOCK
            | vk::Format::EAC_R11G11_SNORM_BLOCK
    )
}

pub fn is_astc(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::ASTC_4X4_UNORM_BLOCK
            | vk::Format::ASTC_4X4_SRGB_BLOCK
            | vk::Format::ASTC_5X4_UNORM_BLOCK
            | vk::Format::ASTC_5X4_SRGB_BLOCK
            | vk::Format::ASTC_5X5_UNORM_BLOCK
            | vk::Format::ASTC_5X5_SRGB_BLOCK
            | vk::Format::ASTC_6X5_UNORM_BLOCK
            | vk::Format::ASTC_6X5_SRGB_BLOCK
            | vk::Format::ASTC_6X6_UNORM_BLOCK
            | vk::Format::ASTC_6X6_SRGB_BLOCK
            | vk::Format::ASTC_8X5_UNORM_BLOCK
            | vk::Format::ASTC_8X5_SRGB_BLOCK
            | vk::Format::ASTC_8X6_UNORM_BLOCK
            | vk::Format::ASTC_8X6_SRGB_BLOCK
            | vk::Format::ASTC_8X8_UNORM_BLOCK
            | vk::Format::ASTC_8X8_SRGB_BLOCK
            | vk::Format::ASTC_10X5_UNORM_BLOCK
            | vk::Format::ASTC_10X5_SRGB_BLOCK
            | vk::Format::ASTC_10X6_UNORM_BLOCK
            | vk::Format::ASTC_10X6_SRGB_BLOCK
            | vk::Format::ASTC_10X8_UNORM_BLOCK
            | vk::Format::ASTC_10X8_SRGB_BLOCK
            | vk::Format::ASTC_10X10_UNORM_BLOCK
            | vk::Format::ASTC_10X10_SRGB_BLOCK
            | vk::Format::ASTC_12X10_UNORM_BLOCK
            | vk::Format::ASTC_12X10_SRGB_BLOCK
            | vk::Format::ASTC_12X12_UNORM_BLOCK
            | vk::Format::ASTC_12X12_SRGB_BLOCK
    )
}

pub fn needs_emulated_alpha(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::ETC2_R8G8B8A1_UNORM_BLOCK | vk::Format::ETC2_R8G8B8A1_SRGB_BLOCK
    )
}

pub fn decompressed_format(compressed: vk::Format) -> vk::Format {
    if is_astc(compressed) {
        if format_is_srgb(compressed) {
            vk::Format::R8G8B8A8_SRGB
        } else {
            vk::Format::R8G8B8A8_UNORM
        }
    } else {
        vk::Format::R8G8B8A8_UNORM
    }
}

/// The uncompressed, mutable-format "shadow" format shadow images are
/// created with — one texel per compressed block.
pub fn size_compatible_format(compressed: vk::Format) -> vk::Format {
    if is_etc2(compressed) {
        vk::Format::R16G16B16A16_UINT
    } else {
        vk::Format::R32G32B32A32_UINT
    }
}

fn format_is_srgb(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::ASTC_4X4_SRGB_BLOCK
                | vk::Format::ASTC_5X4_SRGB_BLOCK
                | vk::Format::ASTC_5X5_SRGB_BLOCK
                | vk::Format::ASTC_6X5_SRGB_BLOCK
                | vk::Format::ASTC_6X6_SRGB_BLOCK
                | vk::Format::ASTC_8X5_SRGB_BLOCK
                | vk::Format::ASTC_8X6_SRGB_BLOCK
                | vk::Format::ASTC_8X8_SRGB_BLOCK
                | vk::Format::ASTC_10X5_SRGB_BLOCK
                | vk::Format::ASTC_10X6_SRGB_BLOCK
                | vk::Format::ASTC_10X8_SRGB_BLOCK
                | vk::Format::ASTC_10X10_SRGB_BLOCK
                | vk::Format::ASTC_12X10_SRGB_BLOCK
                | vk::Format::ASTC_12X12_SRGB_BLOCK
        )
}

/// Block extent in texels for a given compressed format.
pub fn block_extent(format: vk::Format) -> (u32, u32) {
    match format {
        f if is_etc2(f) => (4, 4),
        vk::Format::ASTC_4X4_UNORM_BLOCK | vk::Format::ASTC_4X4_SRGB_BLOCK => (4, 4),
        vk::Format::ASTC_5X4_UNORM_BLOCK | vk::Format::ASTC_5X4_SRGB_BLOCK => (5, 4),
        vk::Format::ASTC_5X5_UNORM_BLOCK | vk::Format::ASTC_5X5_SRGB_BLOCK => (5, 5),
        vk::Format::ASTC_6X5_UNORM_BLOCK | vk::Format::ASTC_6X5_SRGB_BLOCK => (6, 5),
        vk::Format::ASTC_6X6_UNORM_BLOCK | vk::Format::ASTC_6X6_SRGB_BLOCK => (6, 6),
        vk::Format::ASTC_8X5_UNORM_BLOCK | vk::Format::ASTC_8X5_SRGB_BLOCK => (8, 5),
        vk::Format::ASTC_8X6_UNORM_BLOCK | vk::Format::ASTC_8X6_SRGB_BLOCK => (8, 6),
        vk::Format::ASTC_8X8_UNORM_BLOCK | vk::Format::ASTC_8X8_SRGB_BLOCK => (8, 8),
        vk::Format::ASTC_10X5_UNORM_BLOCK | vk::Format::ASTC_10X5_SRGB_BLOCK => (10, 5),
        vk::Format::ASTC_10X6_UNORM_BLOCK | vk::Format::ASTC_10X6_SRGB_BLOCK => (10, 6),
        vk::Format::ASTC_10X8_UNORM_BLOCK | vk::Format::ASTC_10X8_SRGB_BLOCK => (10, 8),
        vk::Format::ASTC_10X10_UNORM_BLOCK | vk::Format::ASTC_10X10_SRGB_BLOCK => (10, 10),
        vk::Format::ASTC_12X10_UNORM_BLOCK | vk::Format::ASTC_12X10_SRGB_BLOCK => (12, 10),
        vk::Format::ASTC_12X12_UNORM_BLOCK | vk::Format::ASTC_12X12_SRGB_BLOCK => (12, 12),
        _ => (1, 1),
    }
}

/// Per-mip shadow image plus the memory offset it's bound at within the
/// shared allocation backing the whole `CompressedImageInfo`.
pub struct SizeCompatibleMip {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub memory_offset: vk::DeviceSize,
    pub extent: vk::Extent2D,
}

/// Resources for the compute-shader decompression of one compressed
/// image, one per emulated `Image` record (§3 `CompressedImageInfo`,
/// §4.9).
pub struct CompressedImageInfo {
    pub comp_format: vk::Format,
    pub decomp_format: vk::Format,
    pub size_comp_format: vk::Format,
    pub extent: vk::Extent3D,
    pub block_width: u32,
    pub block_height: u32,
    pub layer_count: u32,
    pub mip_levels: u32,
    pub alignment: vk::DeviceSize,
    pub size_comp_images: Vec<SizeCompatibleMip>,
    pub decomp_image: vk::Image,
    pub decomp_image_views: Vec<vk::ImageView>,
    pub decomp_descriptor_set_layout: Option<vk::DescriptorSetLayout>,
    pub decomp_descriptor_pool: Option<vk::DescriptorPool>,
    pub decomp_descriptor_sets: Vec<vk::DescriptorSet>,
    pub decomp_pipeline_layout: Option<vk::PipelineLayout>,
    pub decomp_pipeline: Option<vk::Pipeline>,
}

impl CompressedImageInfo {
    pub fn new(comp_format: vk::Format, extent: vk::Extent3D, mip_levels: u32, layer_count: u32) -> Self {
        let (bw, bh) = block_extent(comp_format);
        Self {
            comp_format,
            decomp_format: decompressed_format(comp_format),
            size_comp_format: size_compatible_format(comp_format),
            extent,
            block_width: bw,
            block_height: bh,
            layer_count,
            mip_levels,
            alignment: 1,
            size_comp_images: Vec::new(),
            decomp_image: vk::Image::null(),
            decomp_image_views: Vec::new(),
            decomp_descriptor_set_layout: None,
            decomp_descriptor_pool: None,
            decomp_descriptor_sets: Vec::new(),
            decomp_pipeline_layout: None,
            decomp_pipeline: None,
        }
    }

    pub fn is_etc2(&self) -> bool {
        is_etc2(self.comp_format)
    }

    pub fn is_astc(&self) -> bool {
        is_astc(self.comp_format)
    }

    fn mip_dim(&self, dim: u32, level: u32) -> u32 {
        (dim >> level).max(1)
    }

    pub fn mipmap_width(&self, level: u32) -> u32 {
        self.mip_dim(self.extent.width, level)
    }

    pub fn mipmap_height(&self, level: u32) -> u32 {
        self.mip_dim(self.extent.height, level)
    }

    pub fn mipmap_depth(&self, level: u32) -> u32 {
        self.mip_dim(self.extent.depth, level)
    }

    /// Size-compatible (block-count) dimensions for one mip: one texel
    /// per compressed block, per gfxstream's `sizeCompMipmapWidth/Height`.
    pub fn size_comp_mipmap_width(&self, level: u32) -> u32 {
        (self.mipmap_width(level) + self.block_width - 1) / self.block_width
    }

    pub fn size_comp_mipmap_height(&self, level: u32) -> u32 {
        (self.mipmap_height(level) + self.block_height - 1) / self.block_height
    }

    /// Rewrites an origin-domain region's offset/extent into the
    /// size-compatible (block-count) domain, per §4.6's "compressed-
    /// format detour": offsets divided by block size, extents converted
    /// to size-compatible units, mip level forced to 0.
    pub fn rewrite_region_to_size_compatible(
        &self,
        offset: vk::Offset3D,
        extent: vk::Extent3D,
    ) -> (vk::Offset3D, vk::Extent3D) {
        let new_offset = vk::Offset3D {
            x: offset.x / self.block_width as i32,
            y: offset.y / self.block_height as i32,
            z: offset.z,
        };
        let new_extent = vk::Extent3D {
            width: (extent.width + self.block_width - 1) / self.block_width,
            height: (extent.height + self.block_height - 1) / self.block_height,
            depth: extent.depth,
        };
        (new_offset, new_extent)
    }

    /// Dispatch geometry for the decompression compute shader: one
    /// workgroup per compressed block, per layer (or depth slice).
    pub fn dispatch_groups(&self, level: u32) -> (u32, u32, u32) {
        let w = self.size_comp_mipmap_width(level);
        let h = self.size_comp_mipmap_height(level);
        let depth = if self.extent.depth > 1 {
            self.mipmap_depth(level)
        } else {
            self.layer_count
        };
        (w, h, depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn astc_6x5_block_extent() {
        assert_eq!(block_extent(vk::Format::ASTC_6X5_SRGB_BLOCK), (6, 5));
    }

    #[test]
    fn region_rewrite_matches_worked_example() {
        let info = CompressedImageInfo::new(
            vk::Format::ASTC_6X5_SRGB_BLOCK,
            vk::Extent3D {
                width: 120,
                height: 60,
                depth: 1,
            },
            2,
            1,
        );
        let (offset, extent) = info.rewrite_region_to_size_compatible(
            vk::Offset3D { x: 6, y: 5, z: 0 },
            vk::Extent3D {
                width: 60,
                height: 30,
                depth: 1,
            },
        );
        assert_eq!(offset, vk::Offset3D { x: 1, y: 1, z: 0 });
        assert_eq!(extent.width, 10);
        assert_eq!(extent.height, 6);
    }

    #[test]
    fn needs_emulated_alpha_only_for_punchthrough_etc2() {
        assert!(needs_emulated_alpha(vk::Format::ETC2_R8G8B8A1_SRGB_BLOCK));
        assert!(!needs_emulated_alpha(vk::Format::ETC2_R8G8B8_UNORM_BLOCK));
    }
}
