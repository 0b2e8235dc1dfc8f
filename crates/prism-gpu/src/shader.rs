//! Runtime GLSL to SPIR-V shader compilation.
//!
//! Shaders compile from inline source or a file, with ordered preprocessor
//! definitions and `#include` resolution through a directory stack seeded
//! from the content root and the including file's own directory. The
//! resulting word stream is wrapped into a `vk::ShaderModule`; a module
//! rejected by the driver is reported separately from bad source so callers
//! can tell the two apart.

use crate::context::RenderContext;
use crate::error::{RenderError, Result};
use ash::vk;
use shaderc::{IncludeType, ResolvedInclude, ShaderKind};
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};

/// Shader entry point; all pipeline stages use the conventional name.
const ENTRY_POINT: &str = "main";

/// A compiled shader module tagged with the pipeline stage it targets.
#[derive(Debug)]
pub struct Shader {
    pub module: vk::ShaderModule,
    pub stage: vk::ShaderStageFlags,
}

impl Shader {
    /// Compile inline GLSL source for `stage`.
    ///
    /// Errors: [`RenderError::ShaderCompilation`] for bad source,
    /// [`RenderError::ObjectCreation`] when the driver rejects the module.
    pub fn from_source(
        ctx: &RenderContext,
        source: &str,
        stage: vk::ShaderStageFlags,
        definitions: &[String],
    ) -> Result<Self> {
        let words = compile_glsl(source, stage, None, ctx.content_root(), definitions)?;
        let module = create_module(ctx.device(), &words)?;
        Ok(Self { module, stage })
    }

    /// Load and compile a GLSL file for `stage`.
    ///
    /// The file's directory seeds the include stack, so includes resolve
    /// relative to the shader before falling back to the content root.
    ///
    /// Errors: [`RenderError::Io`], [`RenderError::ShaderCompilation`],
    /// [`RenderError::ObjectCreation`].
    pub fn from_file(
        ctx: &RenderContext,
        path: &Path,
        stage: vk::ShaderStageFlags,
        definitions: &[String],
    ) -> Result<Self> {
        let source = fs::read_to_string(path)?;
        let words = compile_glsl(&source, stage, Some(path), ctx.content_root(), definitions)?;
        let module = create_module(ctx.device(), &words)?;
        Ok(Self { module, stage })
    }

    /// Destroy the shader module.
    ///
    /// # Safety
    /// No pipeline that references this module may still be being created.
    pub unsafe fn destroy(self, ctx: &RenderContext) {
        unsafe { ctx.device().destroy_shader_module(self.module, None) };
    }
}

fn create_module(device: &ash::Device, words: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::default().code(words);
    unsafe {
        device
            .create_shader_module(&create_info, None)
            .map_err(|e| RenderError::ObjectCreation(format!("cannot create shader module: {e}")))
    }
}

/// Map a pipeline stage flag onto the compiler's shading-stage enumeration.
///
/// An unrecognized stage is a programming error, not user input, and
/// deliberately panics.
fn shader_kind(stage: vk::ShaderStageFlags) -> ShaderKind {
    if stage.contains(vk::ShaderStageFlags::VERTEX) {
        ShaderKind::Vertex
    } else if stage.contains(vk::ShaderStageFlags::FRAGMENT) {
        ShaderKind::Fragment
    } else if stage.contains(vk::ShaderStageFlags::COMPUTE) {
        ShaderKind::Compute
    } else if stage.contains(vk::ShaderStageFlags::GEOMETRY) {
        ShaderKind::Geometry
    } else if stage.contains(vk::ShaderStageFlags::TESSELLATION_CONTROL) {
        ShaderKind::TessControl
    } else if stage.contains(vk::ShaderStageFlags::TESSELLATION_EVALUATION) {
        ShaderKind::TessEvaluation
    } else if stage.contains(vk::ShaderStageFlags::RAYGEN_KHR) {
        ShaderKind::RayGeneration
    } else if stage.contains(vk::ShaderStageFlags::ANY_HIT_KHR) {
        ShaderKind::AnyHit
    } else if stage.contains(vk::ShaderStageFlags::CLOSEST_HIT_KHR) {
        ShaderKind::ClosestHit
    } else if stage.contains(vk::ShaderStageFlags::MISS_KHR) {
        ShaderKind::Miss
    } else if stage.contains(vk::ShaderStageFlags::INTERSECTION_KHR) {
        ShaderKind::Intersection
    } else if stage.contains(vk::ShaderStageFlags::CALLABLE_KHR) {
        ShaderKind::Callable
    } else {
        panic!("unhandled shader stage: {stage:?}");
    }
}

/// Directory-stack resolver for `#include` directives.
///
/// Relative includes search most-recently-pushed directory first; each
/// resolved include pushes its own directory so nested includes resolve next
/// to their includer. Directories pushed by includes that have finished
/// processing are discarded using the inclusion depth. System (`<...>`)
/// includes are unsupported.
struct DirStackIncluder {
    stack: RefCell<Vec<PathBuf>>,
    seeded: usize,
}

impl DirStackIncluder {
    fn new(seeds: Vec<PathBuf>) -> Self {
        let seeded = seeds.len();
        Self {
            stack: RefCell::new(seeds),
            seeded,
        }
    }

    fn resolve(
        &self,
        requested: &str,
        ty: IncludeType,
        _includer: &str,
        depth: usize,
    ) -> std::result::Result<ResolvedInclude, String> {
        if ty == IncludeType::Standard {
            return Err("system includes are not supported".to_string());
        }

        let mut stack = self.stack.borrow_mut();
        // Drop directories left behind by includes that already finished.
        stack.truncate(self.seeded + depth.max(1) - 1);

        let mut found = None;
        for dir in stack.iter().rev() {
            let path = dir.join(requested);
            if let Ok(content) = fs::read_to_string(&path) {
                found = Some((path, content));
                break;
            }
        }

        match found {
            Some((path, content)) => {
                let dir = path
                    .parent()
                    .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
                stack.push(dir);
                Ok(ResolvedInclude {
                    resolved_name: path.to_string_lossy().into_owned(),
                    content,
                })
            }
            None => Err(format!("cannot open include file {requested:?}")),
        }
    }
}

/// Compile GLSL source text for `stage` into a SPIR-V word stream.
///
/// `file` names the source in diagnostics and seeds the include stack with
/// its directory; inline sources pass `None`. Each entry of `definitions` is
/// a preprocessor definition, `NAME` or `NAME=VALUE`, applied in order.
///
/// Errors: [`RenderError::ShaderCompilation`] carrying the parse/link
/// diagnostics verbatim.
pub fn compile_glsl(
    source: &str,
    stage: vk::ShaderStageFlags,
    file: Option<&Path>,
    content_root: &Path,
    definitions: &[String],
) -> Result<Vec<u32>> {
    assert!(!source.is_empty(), "shader source must be non-empty");

    let kind = shader_kind(stage);
    let input_name = file.map_or_else(
        || "<inline>".to_string(),
        |p| p.to_string_lossy().into_owned(),
    );

    let compiler = shaderc::Compiler::new().ok_or_else(|| {
        RenderError::ShaderCompilation("cannot initialize shader compiler".to_string())
    })?;

    // The includer must outlive the options that borrow it in the callback.
    let mut seeds = vec![content_root.to_path_buf()];
    if let Some(dir) = file.and_then(Path::parent) {
        seeds.push(dir.to_path_buf());
    }
    let includer = DirStackIncluder::new(seeds);

    let mut options = shaderc::CompileOptions::new().ok_or_else(|| {
        RenderError::ShaderCompilation("cannot initialize compile options".to_string())
    })?;

    options.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_3 as u32,
    );
    options.set_target_spirv(shaderc::SpirvVersion::V1_6);

    for definition in definitions {
        match definition.split_once('=') {
            Some((name, value)) => options.add_macro_definition(name, Some(value)),
            None => options.add_macro_definition(definition, None),
        }
    }

    options.set_include_callback(|requested, ty, includer_name, depth| {
        includer.resolve(requested, ty, includer_name, depth)
    });

    let artifact = compiler
        .compile_into_spirv(source, kind, &input_name, ENTRY_POINT, Some(&options))
        .map_err(|e| match e {
            shaderc::Error::CompilationError(_, diagnostics) => {
                RenderError::ShaderCompilation(diagnostics)
            }
            other => RenderError::ShaderCompilation(other.to_string()),
        })?;

    let words = artifact.as_binary().to_vec();
    debug_assert!(!words.is_empty());

    tracing::debug!(stage = ?stage, words = words.len(), source = %input_name, "compiled shader");
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    const TRIVIAL_VERTEX: &str = "#version 450\nvoid main() { gl_Position = vec4(0.0); }\n";

    fn compile(source: &str, stage: vk::ShaderStageFlags) -> Result<Vec<u32>> {
        compile_glsl(source, stage, None, Path::new("."), &[])
    }

    #[test]
    fn compiles_trivial_vertex_shader() {
        let words = compile(TRIVIAL_VERTEX, vk::ShaderStageFlags::VERTEX).unwrap();
        assert_eq!(words[0], SPIRV_MAGIC);
        assert!(words.len() > 4);
    }

    #[test]
    fn compiles_ray_generation_shader() {
        let source = "#version 460\n#extension GL_EXT_ray_tracing : require\nvoid main() {}\n";
        let words = compile(source, vk::ShaderStageFlags::RAYGEN_KHR).unwrap();
        assert_eq!(words[0], SPIRV_MAGIC);
    }

    #[test]
    fn malformed_source_reports_diagnostics() {
        let source = "#version 450\nvoid main() { gl_Position = vec4(0.0);\n";
        let err = compile(source, vk::ShaderStageFlags::VERTEX).unwrap_err();
        match err {
            RenderError::ShaderCompilation(diagnostics) => {
                assert!(!diagnostics.is_empty());
            }
            other => panic!("expected compile error, got {other}"),
        }
    }

    #[test]
    fn definitions_apply_in_order() {
        let source = "#version 450\n\
                      #ifndef LIGHT_COUNT\n\
                      #error LIGHT_COUNT not defined\n\
                      #endif\n\
                      void main() { gl_Position = vec4(float(LIGHT_COUNT)); }\n";

        assert!(compile(source, vk::ShaderStageFlags::VERTEX).is_err());

        let defs = vec!["LIGHT_COUNT=4".to_string()];
        let words =
            compile_glsl(source, vk::ShaderStageFlags::VERTEX, None, Path::new("."), &defs)
                .unwrap();
        assert_eq!(words[0], SPIRV_MAGIC);
    }

    #[test]
    #[should_panic(expected = "unhandled shader stage")]
    fn unknown_stage_is_fatal() {
        let _ = compile(TRIVIAL_VERTEX, vk::ShaderStageFlags::empty());
    }

    #[test]
    fn includes_resolve_from_source_directory_then_root() {
        let root = tempfile::tempdir().unwrap();
        let shader_dir = root.path().join("shaders");
        fs::create_dir(&shader_dir).unwrap();

        // Same header name in both directories; the shader's own directory
        // must win.
        write!(
            fs::File::create(root.path().join("color.glsl")).unwrap(),
            "const vec4 tint = vec4(0.0);\n"
        )
        .unwrap();
        write!(
            fs::File::create(shader_dir.join("color.glsl")).unwrap(),
            "const vec4 tint = vec4(1.0);\n"
        )
        .unwrap();

        let shader_path = shader_dir.join("tri.vert");
        let source = "#version 450\n\
                      #extension GL_GOOGLE_include_directive : require\n\
                      #include \"color.glsl\"\n\
                      void main() { gl_Position = tint; }\n";
        fs::write(&shader_path, source).unwrap();

        let words = compile_glsl(
            source,
            vk::ShaderStageFlags::VERTEX,
            Some(&shader_path),
            root.path(),
            &[],
        )
        .unwrap();
        assert_eq!(words[0], SPIRV_MAGIC);
    }

    #[test]
    fn nested_includes_resolve_next_to_their_includer() {
        let root = tempfile::tempdir().unwrap();
        let lib_dir = root.path().join("lib");
        fs::create_dir(&lib_dir).unwrap();

        fs::write(lib_dir.join("outer.glsl"), "#include \"inner.glsl\"\n").unwrap();
        fs::write(lib_dir.join("inner.glsl"), "const float k = 2.0;\n").unwrap();

        let source = "#version 450\n\
                      #extension GL_GOOGLE_include_directive : require\n\
                      #include \"lib/outer.glsl\"\n\
                      void main() { gl_Position = vec4(k); }\n";

        let words = compile_glsl(
            source,
            vk::ShaderStageFlags::VERTEX,
            None,
            root.path(),
            &[],
        )
        .unwrap();
        assert_eq!(words[0], SPIRV_MAGIC);
    }

    #[test]
    fn system_includes_fail_the_compile() {
        let source = "#version 450\n\
                      #extension GL_GOOGLE_include_directive : require\n\
                      #include <color.glsl>\n\
                      void main() {}\n";
        let err = compile(source, vk::ShaderStageFlags::VERTEX).unwrap_err();
        match err {
            RenderError::ShaderCompilation(diagnostics) => {
                assert!(diagnostics.contains("not supported"));
            }
            other => panic!("expected compile error, got {other}"),
        }
    }
}
