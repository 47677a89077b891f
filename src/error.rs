//! Job-level error taxonomy.
//!
//! Errors below the frame level never reach this type; the render loop logs
//! them and substitutes the input frame. Everything here ends a job.

/// Convenience result type for job-level operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Fatal failure of a rendering job.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    /// The input video could not be probed or decoded.
    #[error("failed to decode input video: {0}")]
    VideoDecode(String),

    /// The output container could not be written.
    #[error("failed to encode output video: {0}")]
    Encode(String),

    /// No usable GPU adapter/device, or a GPU operation outside a frame failed.
    #[error("GPU error: {0}")]
    Gpu(String),

    /// The fragment shader could not be read, rewritten or compiled.
    #[error("shader failed to compile: {0}")]
    ShaderCompile(String),

    /// Filesystem failure outside the per-frame path (temp dirs, inputs).
    #[error("I/O error: {0}")]
    Io(String),

    /// The job was cancelled before it finished.
    #[error("job cancelled after {frames} frame(s)")]
    Cancelled { frames: usize },
}

impl PipelineError {
    /// Build a [`PipelineError::VideoDecode`] value.
    pub fn decode(msg: impl std::fmt::Display) -> Self {
        Self::VideoDecode(msg.to_string())
    }

    /// Build a [`PipelineError::Encode`] value.
    pub fn encode(msg: impl std::fmt::Display) -> Self {
        Self::Encode(msg.to_string())
    }

    /// Build a [`PipelineError::Gpu`] value.
    pub fn gpu(msg: impl std::fmt::Display) -> Self {
        Self::Gpu(msg.to_string())
    }

    /// Build a [`PipelineError::ShaderCompile`] value.
    pub fn shader(msg: impl std::fmt::Display) -> Self {
        Self::ShaderCompile(msg.to_string())
    }

    /// Build a [`PipelineError::Io`] value.
    pub fn io(msg: impl std::fmt::Display) -> Self {
        Self::Io(msg.to_string())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_the_cause() {
        let err = PipelineError::decode("ffprobe exited with status 1");
        assert_eq!(err.to_string(), "failed to decode input video: ffprobe exited with status 1");

        let err = PipelineError::Cancelled { frames: 12 };
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "job cancelled after 12 frame(s)");
    }
}
