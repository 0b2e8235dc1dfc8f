//! Ray-tracing pipeline creation.

use ash::vk;
use prism_gpu::{
    create_pipeline_layout, shader_stage_infos, Pipeline, RenderContext, RenderError, Result,
    Shader,
};

/// A shader group of a ray-tracing pipeline.
///
/// Member indices refer into the pipeline's shader list; slots a group does
/// not use hold `vk::SHADER_UNUSED_KHR`.
#[derive(Clone, Copy, Debug)]
pub struct ShaderGroup {
    pub ty: vk::RayTracingShaderGroupTypeKHR,
    pub general: u32,
    pub closest_hit: u32,
    pub any_hit: u32,
    pub intersection: u32,
}

impl ShaderGroup {
    /// A general group (ray generation, miss, or callable shader).
    pub fn general(index: u32) -> Self {
        Self {
            ty: vk::RayTracingShaderGroupTypeKHR::GENERAL,
            general: index,
            closest_hit: vk::SHADER_UNUSED_KHR,
            any_hit: vk::SHADER_UNUSED_KHR,
            intersection: vk::SHADER_UNUSED_KHR,
        }
    }

    /// A triangle hit group with a closest-hit shader.
    pub fn triangles_hit(closest_hit: u32) -> Self {
        Self {
            ty: vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP,
            general: vk::SHADER_UNUSED_KHR,
            closest_hit,
            any_hit: vk::SHADER_UNUSED_KHR,
            intersection: vk::SHADER_UNUSED_KHR,
        }
    }

    /// A procedural hit group with an intersection and closest-hit shader.
    pub fn procedural_hit(intersection: u32, closest_hit: u32) -> Self {
        Self {
            ty: vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP,
            general: vk::SHADER_UNUSED_KHR,
            closest_hit,
            any_hit: vk::SHADER_UNUSED_KHR,
            intersection,
        }
    }

    /// Attach an any-hit shader to a hit group.
    pub fn with_any_hit(mut self, any_hit: u32) -> Self {
        self.any_hit = any_hit;
        self
    }

    fn to_vk(self) -> vk::RayTracingShaderGroupCreateInfoKHR<'static> {
        vk::RayTracingShaderGroupCreateInfoKHR::default()
            .ty(self.ty)
            .general_shader(self.general)
            .closest_hit_shader(self.closest_hit)
            .any_hit_shader(self.any_hit)
            .intersection_shader(self.intersection)
    }
}

/// Create a ray-tracing pipeline from compiled shaders and their groups.
///
/// The context's global descriptor-set layout is prepended to `set_layouts`
/// and the shared per-frame push-constant range is attached, exactly as for
/// rasterization pipelines. The layout is created first; if the pipeline
/// object fails, the layout is destroyed again before the error returns.
///
/// Errors: [`RenderError::ObjectCreation`].
pub fn create_ray_tracing_pipeline(
    ctx: &RenderContext,
    shaders: &[Shader],
    groups: &[ShaderGroup],
    set_layouts: &[vk::DescriptorSetLayout],
    max_recursion_depth: u32,
) -> Result<Pipeline> {
    assert!(!shaders.is_empty(), "a ray-tracing pipeline needs shaders");
    assert!(!groups.is_empty(), "a ray-tracing pipeline needs shader groups");

    let layout = create_pipeline_layout(ctx, set_layouts)?;

    let stages = shader_stage_infos(shaders);
    let group_infos: Vec<vk::RayTracingShaderGroupCreateInfoKHR> =
        groups.iter().map(|g| g.to_vk()).collect();

    let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::default()
        .stages(&stages)
        .groups(&group_infos)
        .max_pipeline_ray_recursion_depth(max_recursion_depth)
        .layout(layout);

    let pipelines = unsafe {
        ctx.rt_loader().create_ray_tracing_pipelines(
            vk::DeferredOperationKHR::null(),
            vk::PipelineCache::null(),
            &[pipeline_info],
            None,
        )
    };

    let pipeline = match pipelines {
        Ok(pipelines) => pipelines[0],
        Err(e) => {
            unsafe { ctx.device().destroy_pipeline_layout(layout, None) };
            return Err(RenderError::ObjectCreation(format!(
                "cannot create ray-tracing pipeline: {e:?}"
            )));
        }
    };

    debug_assert!(layout != vk::PipelineLayout::null());
    debug_assert!(pipeline != vk::Pipeline::null());

    tracing::debug!(
        stages = shaders.len(),
        groups = groups.len(),
        max_recursion_depth,
        "created ray-tracing pipeline"
    );
    Ok(Pipeline { layout, pipeline })
}
