//! Error types for the Vulkan resource layer.

use thiserror::Error;

/// Errors produced by the resource and pipeline core.
///
/// Every fallible operation tears down anything it partially constructed
/// before returning one of these; an error never leaves orphaned GPU objects
/// behind. Programming errors (an unrecognized shader stage) panic instead of
/// returning a variant.
#[derive(Error, Debug)]
pub enum RenderError {
    /// Buffer or device-memory allocation failed.
    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    /// The device rejected a well-formed object-creation request
    /// (shader module, pipeline layout, pipeline, acceleration structure).
    #[error("object creation failed: {0}")]
    ObjectCreation(String),

    /// Shader source failed to compile; carries the compiler diagnostics
    /// verbatim.
    #[error("shader compilation failed: {0}")]
    ShaderCompilation(String),

    /// Mapping buffer memory for CPU access failed.
    #[error("map failed: {0}")]
    MapFailed(String),

    /// Queue submission or fence wait/reset failed.
    #[error("submission failed: {0}")]
    Submission(String),

    /// A command-queue acquire or release timed out.
    #[error("timed out: {0}")]
    Timeout(String),

    /// An operation was issued against a resource in the wrong state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Reading shader source from disk failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, RenderError>;
