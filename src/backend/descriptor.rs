// Descriptor layout, pool and per-slot sets
//
// Binding 0 is the per-frame uniform block (vertex stage), binding 1 the
// texture sampler (fragment stage). Every frame slot gets its own set so a
// slot never rewrites a uniform buffer the GPU may still be reading.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::buffer::Buffer;
use super::image::Texture;
use super::VulkanDevice;

pub fn layout_bindings() -> [vk::DescriptorSetLayoutBinding; 2] {
    [
        vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .build(),
        vk::DescriptorSetLayoutBinding::builder()
            .binding(1)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .build(),
    ]
}

/// Pool sizes for `sets` copies of the layout
pub fn pool_sizes(sets: u32) -> [vk::DescriptorPoolSize; 2] {
    [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: sets,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: sets,
        },
    ]
}

pub struct DescriptorSetLayout {
    pub layout: vk::DescriptorSetLayout,
    device: Arc<VulkanDevice>,
}

impl DescriptorSetLayout {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        let bindings = layout_bindings();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);

        let layout = unsafe { device.device.create_descriptor_set_layout(&layout_info, None) }
            .context("Failed to create descriptor set layout")?;

        Ok(Self { layout, device })
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device
                .device
                .destroy_descriptor_set_layout(self.layout, None)
        };
    }
}

/// Pool holding one set per frame slot. Sets are freed with the pool.
pub struct DescriptorSets {
    pub sets: Vec<vk::DescriptorSet>,
    pool: vk::DescriptorPool,
    device: Arc<VulkanDevice>,
}

impl DescriptorSets {
    /// Allocate one set per uniform buffer and point each at its buffer and
    /// the shared texture.
    pub fn new(
        device: Arc<VulkanDevice>,
        layout: &DescriptorSetLayout,
        uniform_buffers: &[Buffer],
        uniform_size: vk::DeviceSize,
        texture: &Texture,
    ) -> Result<Self> {
        let count = uniform_buffers.len() as u32;
        let sizes = pool_sizes(count);
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&sizes)
            .max_sets(count);

        let pool = unsafe { device.device.create_descriptor_pool(&pool_info, None) }
            .context("Failed to create descriptor pool")?;
        let mut sets = Self {
            sets: Vec::new(),
            pool,
            device,
        };

        let layouts = vec![layout.layout; uniform_buffers.len()];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        sets.sets = unsafe { sets.device.device.allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate descriptor sets")?;

        for (&set, uniform) in sets.sets.iter().zip(uniform_buffers) {
            let buffer_info = [vk::DescriptorBufferInfo {
                buffer: uniform.buffer,
                offset: 0,
                range: uniform_size,
            }];
            let image_info = [vk::DescriptorImageInfo {
                sampler: texture.sampler,
                image_view: texture.image.view,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }];

            let writes = [
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(0)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(&buffer_info)
                    .build(),
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(1)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(&image_info)
                    .build(),
            ];
            unsafe { sets.device.device.update_descriptor_sets(&writes, &[]) };
        }

        Ok(sets)
    }
}

impl Drop for DescriptorSets {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_descriptor_pool(self.pool, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_covers_every_binding_per_set() {
        let bindings = layout_bindings();
        let sizes = pool_sizes(3);
        for binding in &bindings {
            let size = sizes
                .iter()
                .find(|s| s.ty == binding.descriptor_type)
                .expect("pool size for binding");
            assert_eq!(size.descriptor_count, 3 * binding.descriptor_count);
        }
    }

    #[test]
    fn uniforms_feed_vertices_and_texture_feeds_fragments() {
        let [ubo, sampler] = layout_bindings();
        assert_eq!((ubo.binding, ubo.stage_flags), (0, vk::ShaderStageFlags::VERTEX));
        assert_eq!(
            (sampler.binding, sampler.stage_flags),
            (1, vk::ShaderStageFlags::FRAGMENT)
        );
    }
}
