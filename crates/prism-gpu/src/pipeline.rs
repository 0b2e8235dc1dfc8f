//! Pipeline layout and rasterization pipeline creation.

use crate::context::RenderContext;
use crate::error::{RenderError, Result};
use crate::shader::Shader;
use ash::vk;
use glam::{Mat4, Vec3, Vec4};

/// Per-frame constants pushed to every pipeline.
///
/// The layout is a platform convention shared with the shaders; one
/// push-constant range of this size, visible to the vertex and fragment
/// stages, is attached to every pipeline layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct FrameConstants {
    pub mouse: Vec4,
    pub time: f32,
    pub time_delta: f32,
    pub frame_rate: f32,
    pub frame: f32,
    pub resolution: Vec3,
    pub _padding: f32,
    pub model: Mat4,
    pub model_view: Mat4,
    pub model_view_inverse: Mat4,
}

impl FrameConstants {
    /// Size of the push-constant range in bytes.
    pub const SIZE: u32 = std::mem::size_of::<Self>() as u32;
}

/// An executable pipeline and the layout it was created with.
///
/// Both handles are valid for the whole life of the value; there is no
/// partially constructed `Pipeline`.
#[derive(Debug)]
pub struct Pipeline {
    pub layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
}

fn prepend_global_layout(
    global: vk::DescriptorSetLayout,
    set_layouts: &[vk::DescriptorSetLayout],
) -> Vec<vk::DescriptorSetLayout> {
    let mut all = Vec::with_capacity(set_layouts.len() + 1);
    all.push(global);
    all.extend_from_slice(set_layouts);
    all
}

/// Create a pipeline layout from the caller's descriptor-set layouts.
///
/// The context's global descriptor-set layout always occupies set 0 ahead of
/// `set_layouts`, and the [`FrameConstants`] push-constant range is attached.
///
/// Errors: [`RenderError::ObjectCreation`].
pub fn create_pipeline_layout(
    ctx: &RenderContext,
    set_layouts: &[vk::DescriptorSetLayout],
) -> Result<vk::PipelineLayout> {
    let all_layouts = prepend_global_layout(ctx.global_descriptor_set_layout(), set_layouts);

    let push_constant_range = vk::PushConstantRange::default()
        .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
        .offset(0)
        .size(FrameConstants::SIZE);

    let layout_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(&all_layouts)
        .push_constant_ranges(std::slice::from_ref(&push_constant_range));

    unsafe {
        ctx.device()
            .create_pipeline_layout(&layout_info, None)
            .map_err(|e| {
                RenderError::ObjectCreation(format!("cannot create pipeline layout: {e}"))
            })
    }
}

/// Build the shader-stage descriptors for a pipeline; entry point is always
/// `main`.
pub fn shader_stage_infos(shaders: &[Shader]) -> Vec<vk::PipelineShaderStageCreateInfo<'_>> {
    shaders
        .iter()
        .map(|shader| {
            vk::PipelineShaderStageCreateInfo::default()
                .stage(shader.stage)
                .module(shader.module)
                .name(c"main")
        })
        .collect()
}

/// Inputs for a rasterization pipeline.
pub struct RasterizationPipelineDesc<'a> {
    /// Compiled shaders, one per stage.
    pub shaders: &'a [Shader],
    pub vertex_bindings: &'a [vk::VertexInputBindingDescription],
    pub vertex_attributes: &'a [vk::VertexInputAttributeDescription],
    pub input_assembly: vk::PipelineInputAssemblyStateCreateInfo<'a>,
    pub viewport: vk::PipelineViewportStateCreateInfo<'a>,
    pub rasterization: vk::PipelineRasterizationStateCreateInfo<'a>,
    pub multisample: vk::PipelineMultisampleStateCreateInfo<'a>,
    pub depth_stencil: vk::PipelineDepthStencilStateCreateInfo<'a>,
    pub color_blend_attachments: &'a [vk::PipelineColorBlendAttachmentState],
    pub dynamic_states: &'a [vk::DynamicState],
    /// Subpass of the context render pass this pipeline targets.
    pub subpass: u32,
    /// Caller-supplied descriptor-set layouts; set 0 is reserved for the
    /// context's global layout.
    pub set_layouts: &'a [vk::DescriptorSetLayout],
}

impl Default for RasterizationPipelineDesc<'_> {
    fn default() -> Self {
        Self {
            shaders: &[],
            vertex_bindings: &[],
            vertex_attributes: &[],
            input_assembly: vk::PipelineInputAssemblyStateCreateInfo::default()
                .topology(vk::PrimitiveTopology::TRIANGLE_LIST),
            viewport: vk::PipelineViewportStateCreateInfo::default()
                .viewport_count(1)
                .scissor_count(1),
            rasterization: vk::PipelineRasterizationStateCreateInfo::default()
                .polygon_mode(vk::PolygonMode::FILL)
                .cull_mode(vk::CullModeFlags::BACK)
                .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
                .line_width(1.0),
            multisample: vk::PipelineMultisampleStateCreateInfo::default()
                .rasterization_samples(vk::SampleCountFlags::TYPE_1),
            depth_stencil: vk::PipelineDepthStencilStateCreateInfo::default()
                .depth_test_enable(true)
                .depth_write_enable(true)
                .depth_compare_op(vk::CompareOp::LESS),
            color_blend_attachments: &[],
            dynamic_states: &[],
            subpass: 0,
            set_layouts: &[],
        }
    }
}

/// Create a rasterization pipeline against the context render pass.
///
/// The layout is created first; if the pipeline object then fails, the
/// layout is destroyed again before the error returns.
///
/// Errors: [`RenderError::ObjectCreation`].
pub fn create_rasterization_pipeline(
    ctx: &RenderContext,
    desc: &RasterizationPipelineDesc<'_>,
) -> Result<Pipeline> {
    assert!(
        ctx.render_pass() != vk::RenderPass::null(),
        "render pass must be initialized"
    );

    let layout = create_pipeline_layout(ctx, desc.set_layouts)?;

    let stages = shader_stage_infos(desc.shaders);

    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(desc.vertex_bindings)
        .vertex_attribute_descriptions(desc.vertex_attributes);

    let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
        .attachments(desc.color_blend_attachments);

    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(desc.dynamic_states);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&desc.input_assembly)
        .viewport_state(&desc.viewport)
        .rasterization_state(&desc.rasterization)
        .multisample_state(&desc.multisample)
        .depth_stencil_state(&desc.depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(ctx.render_pass())
        .subpass(desc.subpass);

    let pipelines = unsafe {
        ctx.device()
            .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    };

    let pipeline = match pipelines {
        Ok(pipelines) => pipelines[0],
        Err((_, e)) => {
            unsafe { ctx.device().destroy_pipeline_layout(layout, None) };
            return Err(RenderError::ObjectCreation(format!(
                "cannot create graphics pipeline: {e}"
            )));
        }
    };

    debug_assert!(layout != vk::PipelineLayout::null());
    debug_assert!(pipeline != vk::Pipeline::null());

    tracing::debug!(stages = desc.shaders.len(), "created rasterization pipeline");
    Ok(Pipeline { layout, pipeline })
}

/// Destroy a pipeline and its layout.
///
/// # Safety
/// The pipeline must not be in use by the GPU.
pub unsafe fn destroy_pipeline(ctx: &RenderContext, pipeline: Pipeline) {
    unsafe {
        ctx.device().destroy_pipeline(pipeline.pipeline, None);
        ctx.device().destroy_pipeline_layout(pipeline.layout, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::mem::offset_of;

    #[test]
    fn frame_constants_layout() {
        assert_eq!(FrameConstants::SIZE, 240);
        assert_eq!(offset_of!(FrameConstants, time), 16);
        assert_eq!(offset_of!(FrameConstants, resolution), 32);
        assert_eq!(offset_of!(FrameConstants, model), 48);
        assert_eq!(offset_of!(FrameConstants, model_view_inverse), 176);
    }

    #[test]
    fn global_layout_occupies_set_zero() {
        let global = vk::DescriptorSetLayout::from_raw(1);
        let extra = [
            vk::DescriptorSetLayout::from_raw(2),
            vk::DescriptorSetLayout::from_raw(3),
        ];

        let all = prepend_global_layout(global, &extra);
        assert_eq!(all.len(), extra.len() + 1);
        assert_eq!(all[0], global);
        assert_eq!(&all[1..], &extra);
    }

    #[test]
    fn empty_caller_layouts_still_get_global_set() {
        let global = vk::DescriptorSetLayout::from_raw(7);
        let all = prepend_global_layout(global, &[]);
        assert_eq!(all, vec![global]);
    }
}
