// Renderer - owns every GPU object and implements one frame's GPU work
//
// Construction is one linear sequence: surface configuration, render pass and
// pipeline, command pool, swapchain set, uploads, per-slot resources. After
// that only the swapchain set (and, on a format change, the pass and
// pipeline) is ever replaced.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use std::sync::Arc;
use std::time::Duration;

use crate::assets::{Mesh, ShaderBytecode, TexturePixels};
use crate::backend::buffer::{self, Buffer};
use crate::backend::commands::{self, CommandPool, DrawParams};
use crate::backend::descriptor::{DescriptorSetLayout, DescriptorSets};
use crate::backend::image::Texture;
use crate::backend::pipeline::{GraphicsPipeline, RenderPass};
use crate::backend::shader::ShaderModule;
use crate::backend::swapchain::{AcquireOutcome, SurfaceStatus, SwapConfig};
use crate::backend::sync::FrameSync;
use crate::backend::{SurfaceManager, VulkanDevice};
use crate::config::Config;
use crate::frame::FrameBackend;

/// Per-frame transforms, laid out as the vertex shader's uniform block
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct UniformBufferObject {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
}

impl UniformBufferObject {
    /// Model spins about +Z at 90 degrees per second; the camera looks at the
    /// origin from (2, 2, 2).
    pub fn at(elapsed: Duration, extent: vk::Extent2D) -> Self {
        let model = Mat4::from_rotation_z(elapsed.as_secs_f32() * 90f32.to_radians());
        let view = Mat4::look_at_rh(Vec3::splat(2.0), Vec3::ZERO, Vec3::Z);
        let aspect = extent.width as f32 / extent.height.max(1) as f32;
        let mut proj = Mat4::perspective_rh(45f32.to_radians(), aspect, 0.1, 10.0);
        // Vulkan clip space has Y pointing down
        proj.y_axis.y *= -1.0;

        Self { model, view, proj }
    }
}

/// Field order is drop order. Per-slot objects go first, the pass and
/// pipeline after everything that references them. The device itself goes
/// last, when the final Arc is released.
pub struct Renderer {
    frames: Vec<FrameSync>,
    command_buffers: Vec<vk::CommandBuffer>,
    descriptor_sets: DescriptorSets,
    uniform_buffers: Vec<Buffer>,
    index_buffer: Buffer,
    vertex_buffer: Buffer,
    index_count: u32,
    _texture: Texture,
    surface: SurfaceManager,
    pipeline: GraphicsPipeline,
    render_pass: RenderPass,
    descriptor_layout: DescriptorSetLayout,
    vertex_shader: ShaderModule,
    fragment_shader: ShaderModule,
    _command_pool: CommandPool,
    clear_color: [f32; 4],
    min_sample_shading: f32,
    device: Arc<VulkanDevice>,
}

impl Renderer {
    pub fn new(device: Arc<VulkanDevice>, config: &Config, window_extent: vk::Extent2D) -> Result<Self> {
        let slots = config.graphics.max_frames_in_flight;
        let assets = &config.assets;

        let mesh = Mesh::load_obj(&assets.model)?;
        mesh
            .ensure_drawable()
            .with_context(|| format!("Model {:?}", assets.model))?;
        let pixels = TexturePixels::load(&assets.texture)?;
        pixels
            .ensure_drawable()
            .with_context(|| format!("Texture {:?}", assets.texture))?;
        let vertex_code = ShaderBytecode::load(&assets.vertex_shader)?;
        let fragment_code = ShaderBytecode::load(&assets.fragment_shader)?;

        let preferred_present_mode = config.preferred_present_mode();
        let swap_config = SwapConfig::choose(
            &device.surface_support()?,
            window_extent,
            preferred_present_mode,
        )?;

        let render_pass = RenderPass::new(
            device.clone(),
            swap_config.format.format,
            device.msaa_samples,
        )?;
        let descriptor_layout = DescriptorSetLayout::new(device.clone())?;
        let vertex_shader = ShaderModule::new(device.clone(), &vertex_code.0)
            .with_context(|| format!("Vertex shader {:?}", assets.vertex_shader))?;
        let fragment_shader = ShaderModule::new(device.clone(), &fragment_code.0)
            .with_context(|| format!("Fragment shader {:?}", assets.fragment_shader))?;
        let pipeline = GraphicsPipeline::new(
            device.clone(),
            &render_pass,
            descriptor_layout.layout,
            &vertex_shader,
            &fragment_shader,
            config.graphics.min_sample_shading,
        )?;

        let command_pool = CommandPool::new(device.clone())?;

        let surface = SurfaceManager::create(
            device.clone(),
            &render_pass,
            swap_config,
            preferred_present_mode,
        )?;

        let texture = Texture::upload(
            &device,
            &command_pool,
            pixels.width,
            pixels.height,
            &pixels.rgba,
        )?;
        let vertex_buffer = buffer::upload_via_staging(
            &device,
            &command_pool,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            &mesh.vertices,
        )
        .context("Failed to upload vertex buffer")?;
        let index_buffer = buffer::upload_via_staging(
            &device,
            &command_pool,
            vk::BufferUsageFlags::INDEX_BUFFER,
            &mesh.indices,
        )
        .context("Failed to upload index buffer")?;

        let uniform_size = std::mem::size_of::<UniformBufferObject>() as vk::DeviceSize;
        let uniform_buffers = (0..slots)
            .map(|_| buffer::create_uniform_buffer(&device, uniform_size))
            .collect::<Result<Vec<_>>>()?;
        let descriptor_sets = DescriptorSets::new(
            device.clone(),
            &descriptor_layout,
            &uniform_buffers,
            uniform_size,
            &texture,
        )?;

        let command_buffers = command_pool.allocate(slots)?;
        let frames = (0..slots)
            .map(|_| FrameSync::new(device.clone()))
            .collect::<Result<Vec<_>>>()?;

        log::info!(
            "Renderer ready: {} indices, {} frames in flight, {:?}",
            mesh.indices.len(),
            slots,
            device.msaa_samples
        );

        Ok(Self {
            frames,
            command_buffers,
            descriptor_sets,
            uniform_buffers,
            index_buffer,
            vertex_buffer,
            index_count: mesh.indices.len() as u32,
            _texture: texture,
            surface,
            pipeline,
            render_pass,
            descriptor_layout,
            vertex_shader,
            fragment_shader,
            _command_pool: command_pool,
            clear_color: config.graphics.clear_color,
            min_sample_shading: config.graphics.min_sample_shading,
            device,
        })
    }
}

impl FrameBackend for Renderer {
    fn slot_count(&self) -> usize {
        self.frames.len()
    }

    fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
        self.frames[slot].wait()
    }

    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
        self.surface
            .swapchain()
            .acquire_next_image(u64::MAX, self.frames[slot].image_available)
    }

    fn update_uniforms(&mut self, slot: usize, elapsed: Duration) -> Result<()> {
        let ubo = UniformBufferObject::at(elapsed, self.surface.extent());
        self.uniform_buffers[slot].write(bytemuck::bytes_of(&ubo))
    }

    fn reset_slot_fence(&mut self, slot: usize) -> Result<()> {
        self.frames[slot].reset()
    }

    fn record_commands(&mut self, slot: usize, image_index: u32) -> Result<()> {
        let params = DrawParams {
            render_pass: self.render_pass.render_pass,
            framebuffer: self.surface.framebuffer(image_index),
            extent: self.surface.extent(),
            clear_color: self.clear_color,
            pipeline: self.pipeline.pipeline,
            pipeline_layout: self.pipeline.layout,
            vertex_buffer: self.vertex_buffer.buffer,
            index_buffer: self.index_buffer.buffer,
            index_count: self.index_count,
            descriptor_set: self.descriptor_sets.sets[slot],
        };
        commands::record_draw(&self.device.device, self.command_buffers[slot], &params)
    }

    fn submit(&mut self, slot: usize) -> Result<()> {
        let sync = &self.frames[slot];
        let wait_semaphores = [sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [self.command_buffers[slot]];
        let signal_semaphores = [sync.render_finished];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info.build()],
                sync.in_flight_fence,
            )
        }
        .context("Failed to submit draw command buffer")
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<SurfaceStatus> {
        self.surface.swapchain().present(
            self.device.present_queue,
            image_index,
            &[self.frames[slot].render_finished],
        )
    }

    fn rebuild_surface(&mut self, extent: vk::Extent2D) -> Result<()> {
        let config = self.surface.next_config(extent)?;

        if config.format.format != self.render_pass.color_format {
            log::info!(
                "Surface format changed {:?} -> {:?}, rebuilding render pass and pipeline",
                self.render_pass.color_format,
                config.format.format
            );
            let render_pass = RenderPass::new(
                self.device.clone(),
                config.format.format,
                self.render_pass.samples,
            )?;
            let pipeline = GraphicsPipeline::new(
                self.device.clone(),
                &render_pass,
                self.descriptor_layout.layout,
                &self.vertex_shader,
                &self.fragment_shader,
                self.min_sample_shading,
            )?;
            // The old framebuffers still reference the old pass; rebuild the
            // surface first so they are gone before the pass is.
            self.surface.recreate(&render_pass, config)?;
            self.pipeline = pipeline;
            self.render_pass = render_pass;
        } else {
            self.surface.recreate(&self.render_pass, config)?;
        }

        log::info!(
            "Surface rebuilt at {}x{} with {} images",
            self.surface.extent().width,
            self.surface.extent().height,
            self.surface.image_count()
        );
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.device.wait_idle()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        // Nothing below may be destroyed while the GPU still uses it
        if let Err(e) = self.device.wait_idle() {
            log::error!("Failed to wait for device idle on shutdown: {:#}", e);
        }
        log::info!("Destroying renderer resources");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn uniform_block_is_three_matrices() {
        assert_eq!(std::mem::size_of::<UniformBufferObject>(), 3 * 64);
    }

    #[test]
    fn model_starts_unrotated_and_spins_about_z() {
        let start = UniformBufferObject::at(Duration::ZERO, extent(800, 600));
        assert_eq!(start.model, Mat4::IDENTITY);

        let one_second = UniformBufferObject::at(Duration::from_secs(1), extent(800, 600));
        let x = one_second.model * Vec4::X;
        assert!((x - Vec4::Y).abs().max_element() < 1e-5);
    }

    #[test]
    fn projection_flips_y_for_vulkan() {
        let ubo = UniformBufferObject::at(Duration::ZERO, extent(800, 600));
        assert!(ubo.proj.y_axis.y < 0.0);
        assert!(ubo.proj.x_axis.x > 0.0);
    }

    #[test]
    fn view_and_projection_depend_only_on_extent() {
        let a = UniformBufferObject::at(Duration::from_millis(10), extent(1280, 720));
        let b = UniformBufferObject::at(Duration::from_secs(7), extent(1280, 720));
        assert_eq!(a.view, b.view);
        assert_eq!(a.proj, b.proj);
    }

    #[test]
    fn zero_height_does_not_divide_by_zero() {
        let ubo = UniformBufferObject::at(Duration::ZERO, extent(640, 0));
        assert!(ubo.proj.is_finite());
    }
}
