// Graphics pipeline creation and management
//
// The render pass has one subpass with a color, a depth and (when
// multisampling) a resolve attachment. The pipeline draws the interleaved
// Vertex layout with viewport and scissor left dynamic, so it survives a
// resize as long as the surface format stays the same.

use anyhow::{Context, Result};
use ash::vk;
use std::mem::{offset_of, size_of};
use std::sync::Arc;

use super::shader::ShaderModule;
use super::VulkanDevice;
use crate::assets::Vertex;

const SHADER_ENTRY: &std::ffi::CStr = c"main";

/// Render pass plus the formats and sample count it was built for
pub struct RenderPass {
    pub render_pass: vk::RenderPass,
    pub color_format: vk::Format,
    pub samples: vk::SampleCountFlags,
    device: Arc<VulkanDevice>,
}

/// Attachment descriptions in framebuffer order: color, depth, then the
/// single-sample resolve target when `samples` is above one.
pub fn attachment_descriptions(
    color_format: vk::Format,
    depth_format: vk::Format,
    samples: vk::SampleCountFlags,
) -> Vec<vk::AttachmentDescription> {
    let multisampled = samples != vk::SampleCountFlags::TYPE_1;

    let color = vk::AttachmentDescription::builder()
        .format(color_format)
        .samples(samples)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(if multisampled {
            vk::AttachmentStoreOp::DONT_CARE
        } else {
            vk::AttachmentStoreOp::STORE
        })
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(if multisampled {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        } else {
            vk::ImageLayout::PRESENT_SRC_KHR
        })
        .build();

    let depth = vk::AttachmentDescription::builder()
        .format(depth_format)
        .samples(samples)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .build();

    let mut attachments = vec![color, depth];
    if multisampled {
        attachments.push(
            vk::AttachmentDescription::builder()
                .format(color_format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::DONT_CARE)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                .build(),
        );
    }
    attachments
}

/// External dependency into the only subpass.
///
/// The depth image and the multisampled color image are shared by every
/// frame slot, so the previous frame's attachment writes (depth stores land
/// in the late fragment tests) must be available before this frame clears
/// them.
pub fn subpass_dependency() -> vk::SubpassDependency {
    let attachment_writes =
        vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
    vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        )
        .src_access_mask(attachment_writes)
        .dst_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .dst_access_mask(attachment_writes)
        .build()
}

impl RenderPass {
    pub fn new(
        device: Arc<VulkanDevice>,
        color_format: vk::Format,
        samples: vk::SampleCountFlags,
    ) -> Result<Self> {
        let depth_format = device.depth_format;
        let attachments = attachment_descriptions(color_format, depth_format, samples);

        let color_refs = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let depth_ref = vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };
        let resolve_refs = [vk::AttachmentReference {
            attachment: 2,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)
            .depth_stencil_attachment(&depth_ref);
        if attachments.len() == 3 {
            subpass = subpass.resolve_attachments(&resolve_refs);
        }
        let subpasses = [subpass.build()];

        let dependencies = [subpass_dependency()];

        let render_pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let render_pass = unsafe { device.device.create_render_pass(&render_pass_info, None) }
            .context("Failed to create render pass")?;

        log::debug!(
            "Render pass: {:?} color, {:?} depth, {:?}",
            color_format,
            depth_format,
            samples
        );

        Ok(Self {
            render_pass,
            color_format,
            samples,
            device,
        })
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_render_pass(self.render_pass, None) };
    }
}

/// Views for one framebuffer, matching `attachment_descriptions` order
pub fn framebuffer_attachments(
    samples: vk::SampleCountFlags,
    color_view: Option<vk::ImageView>,
    depth_view: vk::ImageView,
    swap_view: vk::ImageView,
) -> Vec<vk::ImageView> {
    match color_view {
        Some(color_view) if samples != vk::SampleCountFlags::TYPE_1 => {
            vec![color_view, depth_view, swap_view]
        }
        _ => vec![swap_view, depth_view],
    }
}

/// One framebuffer per swap image
pub struct Framebuffers {
    framebuffers: Vec<vk::Framebuffer>,
    device: Arc<VulkanDevice>,
}

impl Framebuffers {
    pub fn new(
        device: Arc<VulkanDevice>,
        render_pass: &RenderPass,
        attachment_sets: &[Vec<vk::ImageView>],
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let mut framebuffers = Self {
            framebuffers: Vec::with_capacity(attachment_sets.len()),
            device,
        };

        for attachments in attachment_sets {
            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass.render_pass)
                .attachments(attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);

            let framebuffer =
                unsafe { framebuffers.device.device.create_framebuffer(&framebuffer_info, None) }
                    .context("Failed to create framebuffer")?;
            framebuffers.framebuffers.push(framebuffer);
        }

        Ok(framebuffers)
    }

    pub fn get(&self, index: usize) -> vk::Framebuffer {
        self.framebuffers[index]
    }
}

impl Drop for Framebuffers {
    fn drop(&mut self) {
        for &framebuffer in &self.framebuffers {
            unsafe { self.device.device.destroy_framebuffer(framebuffer, None) };
        }
    }
}

/// Vertex buffer binding 0, one Vertex per vertex
pub fn vertex_binding() -> vk::VertexInputBindingDescription {
    vk::VertexInputBindingDescription {
        binding: 0,
        stride: size_of::<Vertex>() as u32,
        input_rate: vk::VertexInputRate::VERTEX,
    }
}

/// Position, color and texture coordinate at locations 0, 1 and 2
pub fn vertex_attributes() -> [vk::VertexInputAttributeDescription; 3] {
    [
        vk::VertexInputAttributeDescription {
            binding: 0,
            location: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: offset_of!(Vertex, pos) as u32,
        },
        vk::VertexInputAttributeDescription {
            binding: 0,
            location: 1,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: offset_of!(Vertex, color) as u32,
        },
        vk::VertexInputAttributeDescription {
            binding: 0,
            location: 2,
            format: vk::Format::R32G32_SFLOAT,
            offset: offset_of!(Vertex, tex_coord) as u32,
        },
    ]
}

/// Pipeline and its layout
pub struct GraphicsPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    device: Arc<VulkanDevice>,
}

impl GraphicsPipeline {
    pub fn new(
        device: Arc<VulkanDevice>,
        render_pass: &RenderPass,
        descriptor_set_layout: vk::DescriptorSetLayout,
        vertex_shader: &ShaderModule,
        fragment_shader: &ShaderModule,
        min_sample_shading: f32,
    ) -> Result<Self> {
        let stages = [
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex_shader.module)
                .name(SHADER_ENTRY)
                .build(),
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment_shader.module)
                .name(SHADER_ENTRY)
                .build(),
        ];

        let bindings = [vertex_binding()];
        let attributes = vertex_attributes();
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        // Counts only; the rectangles are set per frame
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        // The projection flips Y, which turns CCW winding in model space into
        // CCW on screen.
        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(render_pass.samples)
            .sample_shading_enable(min_sample_shading > 0.0)
            .min_sample_shading(min_sample_shading);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build()];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let set_layouts = [descriptor_set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        let layout = unsafe { device.device.create_pipeline_layout(&layout_info, None) }
            .context("Failed to create pipeline layout")?;

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass.render_pass)
            .subpass(0)
            .build();

        let pipelines = unsafe {
            device
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };
        let pipeline = match pipelines {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                unsafe { device.device.destroy_pipeline_layout(layout, None) };
                return Err(e).context("Failed to create graphics pipeline");
            }
        };

        Ok(Self {
            pipeline,
            layout,
            device,
        })
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_pipeline(self.pipeline, None);
            self.device.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COLOR: vk::Format = vk::Format::B8G8R8A8_SRGB;
    const DEPTH: vk::Format = vk::Format::D32_SFLOAT;

    #[test]
    fn single_sample_pass_presents_the_color_attachment() {
        let attachments = attachment_descriptions(COLOR, DEPTH, vk::SampleCountFlags::TYPE_1);
        assert_eq!(attachments.len(), 2);
        assert_eq!(attachments[0].final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(attachments[0].store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(attachments[1].format, DEPTH);
    }

    #[test]
    fn multisampled_pass_resolves_into_a_third_attachment() {
        let attachments = attachment_descriptions(COLOR, DEPTH, vk::SampleCountFlags::TYPE_8);
        assert_eq!(attachments.len(), 3);
        assert_eq!(attachments[0].samples, vk::SampleCountFlags::TYPE_8);
        assert_eq!(attachments[0].store_op, vk::AttachmentStoreOp::DONT_CARE);
        assert_eq!(attachments[1].samples, vk::SampleCountFlags::TYPE_8);
        assert_eq!(attachments[2].samples, vk::SampleCountFlags::TYPE_1);
        assert_eq!(attachments[2].load_op, vk::AttachmentLoadOp::DONT_CARE);
        assert_eq!(attachments[2].final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn previous_frame_attachment_writes_are_waited_on() {
        let dep = subpass_dependency();
        assert_eq!(dep.src_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(dep.dst_subpass, 0);

        // Depth stores finish in the late fragment tests
        assert!(dep.src_stage_mask.contains(vk::PipelineStageFlags::LATE_FRAGMENT_TESTS));
        assert!(dep.src_stage_mask.contains(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT));
        assert!(dep
            .src_access_mask
            .contains(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE));
        assert!(dep.src_access_mask.contains(vk::AccessFlags::COLOR_ATTACHMENT_WRITE));

        // The clears happen in the early fragment tests and color output
        assert!(dep.dst_stage_mask.contains(vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS));
        assert!(dep.dst_stage_mask.contains(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT));
        assert!(dep
            .dst_access_mask
            .contains(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE));
        assert!(dep.dst_access_mask.contains(vk::AccessFlags::COLOR_ATTACHMENT_WRITE));
    }

    #[test]
    fn framebuffer_views_follow_attachment_order() {
        use ash::vk::Handle;

        let color = vk::ImageView::from_raw(1);
        let depth = vk::ImageView::from_raw(2);
        let swap = vk::ImageView::from_raw(3);

        assert_eq!(
            framebuffer_attachments(vk::SampleCountFlags::TYPE_4, Some(color), depth, swap),
            vec![color, depth, swap]
        );
        assert_eq!(
            framebuffer_attachments(vk::SampleCountFlags::TYPE_1, None, depth, swap),
            vec![swap, depth]
        );
    }

    #[test]
    fn vertex_attributes_match_the_shader_interface() {
        let binding = vertex_binding();
        assert_eq!(binding.stride, 32);

        let attributes = vertex_attributes();
        let offsets: Vec<_> = attributes.iter().map(|a| (a.location, a.offset)).collect();
        assert_eq!(offsets, vec![(0, 0), (1, 12), (2, 24)]);
        assert_eq!(attributes[2].format, vk::Format::R32G32_SFLOAT);
    }
}
