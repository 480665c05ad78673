// Images: creation, layout transitions and mip chains
//
// Every image owns its memory and its default view. Layout transitions are
// looked up in a fixed table; a pair that isn't in the table is a setup bug,
// not something to recover from.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::buffer::{self, Buffer};
use super::commands::{self, CommandPool};
use super::VulkanDevice;
use crate::error::SetupError;

/// Parameters for [`create_image`]
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub samples: vk::SampleCountFlags,
    pub format: vk::Format,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub memory_flags: vk::MemoryPropertyFlags,
    pub aspect: vk::ImageAspectFlags,
}

/// A 2D image, its memory and a view over all of its mip levels
pub struct Image {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub mip_levels: u32,
    device: Arc<VulkanDevice>,
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_image_view(self.view, None);
            self.device.device.destroy_image(self.image, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

pub fn create_image(device: &Arc<VulkanDevice>, desc: &ImageDesc) -> Result<Image> {
    let image_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .extent(vk::Extent3D {
            width: desc.width,
            height: desc.height,
            depth: 1,
        })
        .mip_levels(desc.mip_levels)
        .array_layers(1)
        .format(desc.format)
        .tiling(desc.tiling)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .usage(desc.usage)
        .samples(desc.samples)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let vk_device = &device.device;
    let image =
        unsafe { vk_device.create_image(&image_info, None) }.context("Failed to create image")?;

    let requirements = unsafe { vk_device.get_image_memory_requirements(image) };
    let memory = buffer::find_memory_type(
        &device.memory_properties,
        requirements.memory_type_bits,
        desc.memory_flags,
    )
    .map_err(anyhow::Error::from)
    .and_then(|memory_type_index| {
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        unsafe { vk_device.allocate_memory(&alloc_info, None) }
            .context("Failed to allocate image memory")
    });
    let memory = match memory {
        Ok(memory) => memory,
        Err(e) => {
            unsafe { vk_device.destroy_image(image, None) };
            return Err(e);
        }
    };

    let bound = unsafe { vk_device.bind_image_memory(image, memory, 0) }
        .context("Failed to bind image memory")
        .and_then(|_| create_image_view(device, image, desc.format, desc.aspect, desc.mip_levels));
    let view = match bound {
        Ok(view) => view,
        Err(e) => {
            unsafe {
                vk_device.destroy_image(image, None);
                vk_device.free_memory(memory, None);
            }
            return Err(e);
        }
    };

    Ok(Image {
        image,
        memory,
        view,
        format: desc.format,
        mip_levels: desc.mip_levels,
        device: device.clone(),
    })
}

pub fn create_image_view(
    device: &VulkanDevice,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
    mip_levels: u32,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: mip_levels,
            base_array_layer: 0,
            layer_count: 1,
        });

    unsafe { device.device.create_image_view(&view_info, None) }
        .context("Failed to create image view")
}

/// Access masks and stages for one layout transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTransition {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

impl LayoutTransition {
    pub fn between(old: vk::ImageLayout, new: vk::ImageLayout) -> Result<Self, SetupError> {
        use vk::ImageLayout as L;

        let (src_access, dst_access, src_stage, dst_stage) = match (old, new) {
            (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => (
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_WRITE,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
            ),
            (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => (
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::SHADER_READ,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
            ),
            (L::TRANSFER_DST_OPTIMAL, L::TRANSFER_SRC_OPTIMAL) => (
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::TRANSFER_READ,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
            ),
            (L::TRANSFER_SRC_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => (
                vk::AccessFlags::TRANSFER_READ,
                vk::AccessFlags::SHADER_READ,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
            ),
            _ => return Err(SetupError::UnsupportedLayoutTransition { old, new }),
        };

        Ok(Self {
            src_access,
            dst_access,
            src_stage,
            dst_stage,
        })
    }
}

/// Record a barrier moving `levels` mip levels starting at `base_level`.
fn record_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    base_level: u32,
    levels: u32,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
    transition: LayoutTransition,
) {
    let barrier = vk::ImageMemoryBarrier::builder()
        .src_access_mask(transition.src_access)
        .dst_access_mask(transition.dst_access)
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: base_level,
            level_count: levels,
            base_array_layer: 0,
            layer_count: 1,
        })
        .build();

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            transition.src_stage,
            transition.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

/// Move every mip level of color `image` from `old` to `new` in a one-shot
/// submit.
pub fn transition_image_layout(
    device: &VulkanDevice,
    pool: &CommandPool,
    image: &Image,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<()> {
    let transition = LayoutTransition::between(old, new)?;
    commands::one_shot(device, pool, |cmd| {
        record_barrier(
            &device.device,
            cmd,
            image.image,
            vk::ImageAspectFlags::COLOR,
            0,
            image.mip_levels,
            old,
            new,
            transition,
        );
        Ok(())
    })
}

/// Copy tightly packed pixels from `buffer` into mip level 0 of `image`,
/// which must be in TRANSFER_DST_OPTIMAL.
pub fn copy_buffer_to_image(
    device: &VulkanDevice,
    pool: &CommandPool,
    buffer: &Buffer,
    image: &Image,
    width: u32,
    height: u32,
) -> Result<()> {
    let region = vk::BufferImageCopy::builder()
        .buffer_offset(0)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        })
        .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
        .image_extent(vk::Extent3D {
            width,
            height,
            depth: 1,
        })
        .build();

    commands::one_shot(device, pool, |cmd| {
        unsafe {
            device.device.cmd_copy_buffer_to_image(
                cmd,
                buffer.buffer,
                image.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
        Ok(())
    })
}

/// Number of levels in a full mip chain down to 1x1
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    width.max(height).max(1).ilog2() + 1
}

/// One step of mip chain generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MipStep {
    Barrier {
        level: u32,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },
    Blit {
        src_level: u32,
        src_size: (i32, i32),
        dst_size: (i32, i32),
    },
}

/// The barrier/blit sequence that fills levels 1.. from level 0. Expects
/// every level in TRANSFER_DST_OPTIMAL and leaves every level in
/// SHADER_READ_ONLY_OPTIMAL.
pub fn mip_chain_plan(width: u32, height: u32, levels: u32) -> Vec<MipStep> {
    use vk::ImageLayout as L;

    let mut steps = Vec::with_capacity(levels as usize * 3);
    let mut w = width as i32;
    let mut h = height as i32;

    for level in 1..levels {
        let src_level = level - 1;
        let next = ((w / 2).max(1), (h / 2).max(1));

        steps.push(MipStep::Barrier {
            level: src_level,
            old: L::TRANSFER_DST_OPTIMAL,
            new: L::TRANSFER_SRC_OPTIMAL,
        });
        steps.push(MipStep::Blit {
            src_level,
            src_size: (w, h),
            dst_size: next,
        });
        steps.push(MipStep::Barrier {
            level: src_level,
            old: L::TRANSFER_SRC_OPTIMAL,
            new: L::SHADER_READ_ONLY_OPTIMAL,
        });

        (w, h) = next;
    }

    // The last level is only ever written to
    steps.push(MipStep::Barrier {
        level: levels.saturating_sub(1),
        old: L::TRANSFER_DST_OPTIMAL,
        new: L::SHADER_READ_ONLY_OPTIMAL,
    });

    steps
}

/// Fill every mip level of `image` by repeated linear blits from level 0.
pub fn generate_mipchain(
    device: &VulkanDevice,
    pool: &CommandPool,
    image: &Image,
    width: u32,
    height: u32,
) -> Result<()> {
    if !device.supports_linear_blit(image.format) {
        return Err(SetupError::LinearBlitUnsupported(image.format).into());
    }

    let plan = mip_chain_plan(width, height, image.mip_levels);
    // Validate the whole plan before recording anything
    let transitions = plan
        .iter()
        .map(|step| match *step {
            MipStep::Barrier { old, new, .. } => LayoutTransition::between(old, new).map(Some),
            MipStep::Blit { .. } => Ok(None),
        })
        .collect::<Result<Vec<_>, _>>()?;

    commands::one_shot(device, pool, |cmd| {
        for (step, transition) in plan.iter().zip(transitions) {
            match (*step, transition) {
                (MipStep::Barrier { level, old, new }, Some(transition)) => record_barrier(
                    &device.device,
                    cmd,
                    image.image,
                    vk::ImageAspectFlags::COLOR,
                    level,
                    1,
                    old,
                    new,
                    transition,
                ),
                (
                    MipStep::Blit {
                        src_level,
                        src_size,
                        dst_size,
                    },
                    _,
                ) => {
                    let blit = vk::ImageBlit {
                        src_subresource: vk::ImageSubresourceLayers {
                            aspect_mask: vk::ImageAspectFlags::COLOR,
                            mip_level: src_level,
                            base_array_layer: 0,
                            layer_count: 1,
                        },
                        src_offsets: [
                            vk::Offset3D { x: 0, y: 0, z: 0 },
                            vk::Offset3D {
                                x: src_size.0,
                                y: src_size.1,
                                z: 1,
                            },
                        ],
                        dst_subresource: vk::ImageSubresourceLayers {
                            aspect_mask: vk::ImageAspectFlags::COLOR,
                            mip_level: src_level + 1,
                            base_array_layer: 0,
                            layer_count: 1,
                        },
                        dst_offsets: [
                            vk::Offset3D { x: 0, y: 0, z: 0 },
                            vk::Offset3D {
                                x: dst_size.0,
                                y: dst_size.1,
                                z: 1,
                            },
                        ],
                    };
                    unsafe {
                        device.device.cmd_blit_image(
                            cmd,
                            image.image,
                            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                            image.image,
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            &[blit],
                            vk::Filter::LINEAR,
                        );
                    }
                }
                (MipStep::Barrier { .. }, None) => {}
            }
        }
        Ok(())
    })
}

/// Sampled texture: mip-mapped image plus its sampler
pub struct Texture {
    pub sampler: vk::Sampler,
    pub image: Image,
}

impl Texture {
    /// Upload RGBA8 pixels, build the full mip chain and create a sampler.
    pub fn upload(
        device: &Arc<VulkanDevice>,
        pool: &CommandPool,
        width: u32,
        height: u32,
        rgba: &[u8],
    ) -> Result<Self> {
        let format = vk::Format::R8G8B8A8_SRGB;
        let mip_levels = mip_level_count(width, height);
        log::info!("Uploading {}x{} texture with {} mip levels", width, height, mip_levels);

        let staging = buffer::create_buffer(
            device,
            rgba.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        staging.write(rgba)?;

        let image = create_image(
            device,
            &ImageDesc {
                width,
                height,
                mip_levels,
                samples: vk::SampleCountFlags::TYPE_1,
                format,
                tiling: vk::ImageTiling::OPTIMAL,
                usage: vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::SAMPLED,
                memory_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                aspect: vk::ImageAspectFlags::COLOR,
            },
        )
        .context("Failed to create texture image")?;

        transition_image_layout(
            device,
            pool,
            &image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )?;
        copy_buffer_to_image(device, pool, &staging, &image, width, height)?;
        generate_mipchain(device, pool, &image, width, height)?;
        drop(staging);

        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(true)
            .max_anisotropy(device.properties.limits.max_sampler_anisotropy)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .mip_lod_bias(0.0)
            .min_lod(0.0)
            .max_lod(mip_levels as f32);

        let sampler = unsafe { device.device.create_sampler(&sampler_info, None) }
            .context("Failed to create texture sampler")?;

        Ok(Self { sampler, image })
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        // The image drops after this, as a field
        unsafe { self.image.device.device.destroy_sampler(self.sampler, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vk::ImageLayout as L;

    #[test]
    fn mip_levels_follow_the_longest_side() {
        assert_eq!(mip_level_count(512, 256), 10);
        assert_eq!(mip_level_count(1024, 1024), 11);
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(3, 700), 10);
    }

    #[test]
    fn plan_leaves_every_level_shader_readable() {
        let levels = mip_level_count(512, 256);
        let plan = mip_chain_plan(512, 256, levels);

        let mut layouts = vec![L::TRANSFER_DST_OPTIMAL; levels as usize];
        let mut blits = 0;
        for step in &plan {
            match *step {
                MipStep::Barrier { level, old, new } => {
                    assert_eq!(layouts[level as usize], old, "barrier on level {level}");
                    assert!(LayoutTransition::between(old, new).is_ok());
                    layouts[level as usize] = new;
                }
                MipStep::Blit { src_level, .. } => {
                    assert_eq!(layouts[src_level as usize], L::TRANSFER_SRC_OPTIMAL);
                    assert_eq!(layouts[src_level as usize + 1], L::TRANSFER_DST_OPTIMAL);
                    blits += 1;
                }
            }
        }

        assert_eq!(blits, levels - 1);
        assert!(layouts.iter().all(|&l| l == L::SHADER_READ_ONLY_OPTIMAL));
    }

    #[test]
    fn blits_halve_down_to_one_pixel() {
        let plan = mip_chain_plan(512, 256, mip_level_count(512, 256));
        let sizes: Vec<_> = plan
            .iter()
            .filter_map(|step| match *step {
                MipStep::Blit { dst_size, .. } => Some(dst_size),
                _ => None,
            })
            .collect();

        assert_eq!(sizes.first(), Some(&(256, 128)));
        assert_eq!(sizes[7], (2, 1));
        assert_eq!(sizes.last(), Some(&(1, 1)));
    }

    #[test]
    fn single_level_only_transitions() {
        assert_eq!(
            mip_chain_plan(1, 1, 1),
            vec![MipStep::Barrier {
                level: 0,
                old: L::TRANSFER_DST_OPTIMAL,
                new: L::SHADER_READ_ONLY_OPTIMAL,
            }]
        );
    }

    #[test]
    fn known_transitions_pick_table_entries() {
        let upload = LayoutTransition::between(L::UNDEFINED, L::TRANSFER_DST_OPTIMAL).unwrap();
        assert_eq!(upload.src_access, vk::AccessFlags::empty());
        assert_eq!(upload.dst_stage, vk::PipelineStageFlags::TRANSFER);

        let sample =
            LayoutTransition::between(L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL)
                .unwrap();
        assert_eq!(sample.dst_access, vk::AccessFlags::SHADER_READ);
        assert_eq!(sample.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    fn unknown_transition_is_fatal() {
        let err = LayoutTransition::between(L::SHADER_READ_ONLY_OPTIMAL, L::UNDEFINED).unwrap_err();
        assert!(matches!(
            err,
            SetupError::UnsupportedLayoutTransition { old: L::SHADER_READ_ONLY_OPTIMAL, new: L::UNDEFINED }
        ));
    }

    #[test]
    fn depth_attachment_layout_is_left_to_the_render_pass() {
        // The render pass clears depth from UNDEFINED itself
        assert!(matches!(
            LayoutTransition::between(L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
            Err(SetupError::UnsupportedLayoutTransition { .. })
        ));
    }
}
