// Command pool, one-shot submits and per-frame draw recording

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;

/// Pool for the graphics queue family. Buffers from it can be reset one at a
/// time, so each frame slot re-records its own buffer.
pub struct CommandPool {
    pub pool: vk::CommandPool,
    device: Arc<VulkanDevice>,
}

impl CommandPool {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.queue_families.graphics)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        Ok(Self { pool, device })
    }

    pub fn allocate(&self, count: usize) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count as u32);

        unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        // Also frees every buffer allocated from it
        unsafe { self.device.device.destroy_command_pool(self.pool, None) };
    }
}

/// Record `record` into a throwaway buffer, submit it to the graphics queue
/// and wait for the queue to drain.
pub fn one_shot<F>(device: &VulkanDevice, pool: &CommandPool, record: F) -> Result<()>
where
    F: FnOnce(vk::CommandBuffer) -> Result<()>,
{
    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(pool.pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);

    let vk_device = &device.device;
    let cmd = unsafe { vk_device.allocate_command_buffers(&alloc_info) }
        .context("Failed to allocate one-shot command buffer")?[0];

    let result = (|| -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { vk_device.begin_command_buffer(cmd, &begin_info) }?;

        record(cmd)?;

        unsafe { vk_device.end_command_buffer(cmd) }?;

        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
        unsafe {
            vk_device.queue_submit(device.graphics_queue, &[submit_info.build()], vk::Fence::null())?;
            vk_device.queue_wait_idle(device.graphics_queue)?;
        }
        Ok(())
    })();

    unsafe { vk_device.free_command_buffers(pool.pool, &[cmd]) };
    result.context("One-shot command submission failed")
}

/// Everything one frame's draw needs to know
#[derive(Debug, Clone, Copy)]
pub struct DrawParams {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub clear_color: [f32; 4],
    pub pipeline: vk::Pipeline,
    pub pipeline_layout: vk::PipelineLayout,
    pub vertex_buffer: vk::Buffer,
    pub index_buffer: vk::Buffer,
    pub index_count: u32,
    pub descriptor_set: vk::DescriptorSet,
}

/// Clear values in attachment order: color first, then depth at 1.0. The
/// resolve attachment, if any, is never cleared.
pub fn clear_values(color: [f32; 4]) -> [vk::ClearValue; 2] {
    [
        vk::ClearValue {
            color: vk::ClearColorValue { float32: color },
        },
        vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        },
    ]
}

/// Viewport and scissor covering the whole extent
pub fn full_viewport(extent: vk::Extent2D) -> (vk::Viewport, vk::Rect2D) {
    let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };
    let scissor = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    };
    (viewport, scissor)
}

/// Reset `cmd` and record one render pass instance drawing the indexed mesh.
pub fn record_draw(device: &ash::Device, cmd: vk::CommandBuffer, params: &DrawParams) -> Result<()> {
    let clear_values = clear_values(params.clear_color);
    let (viewport, scissor) = full_viewport(params.extent);

    unsafe {
        device
            .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
            .context("Failed to reset command buffer")?;

        let begin_info = vk::CommandBufferBeginInfo::builder();
        device
            .begin_command_buffer(cmd, &begin_info)
            .context("Failed to begin command buffer")?;

        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(params.render_pass)
            .framebuffer(params.framebuffer)
            .render_area(scissor)
            .clear_values(&clear_values);

        device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, params.pipeline);
        device.cmd_set_viewport(cmd, 0, &[viewport]);
        device.cmd_set_scissor(cmd, 0, &[scissor]);
        device.cmd_bind_vertex_buffers(cmd, 0, &[params.vertex_buffer], &[0]);
        device.cmd_bind_index_buffer(cmd, params.index_buffer, 0, vk::IndexType::UINT32);
        device.cmd_bind_descriptor_sets(
            cmd,
            vk::PipelineBindPoint::GRAPHICS,
            params.pipeline_layout,
            0,
            &[params.descriptor_set],
            &[],
        );
        device.cmd_draw_indexed(cmd, params.index_count, 1, 0, 0, 0);
        device.cmd_end_render_pass(cmd);

        device
            .end_command_buffer(cmd)
            .context("Failed to record command buffer")?;
    }

    Ok(())
}
