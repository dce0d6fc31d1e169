use std::path::PathBuf;

use thiserror::Error;

/// Fatal contract violations. Everything else (malformed records, incomplete
/// windows) is skipped and logged rather than raised.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The rasterizer and the classifier disagree on the channel layout.
    /// Training and inference were configured inconsistently.
    #[error("relation map channel mismatch: expected {expected} channels, got {actual}")]
    ChannelMismatch { expected: usize, actual: usize },

    #[error("no training windows discovered across all classes")]
    NoWindows,

    #[error("unsupported checkpoint format: {}", path.display())]
    UnsupportedCheckpoint { path: PathBuf },

    /// Inference cannot proceed without the ordered class list: the index of
    /// each name is the label contract the model was trained against.
    #[error("class names not found in checkpoint metadata or class list file")]
    MissingClassNames,
}
