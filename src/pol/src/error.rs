use std::path::PathBuf;

/// Errors raised by verification and attack runs.
///
/// Threshold violations and hash mismatches are verification outcomes and
/// never show up here.
#[derive(Debug, thiserror::Error)]
pub enum PolError {
    #[error("{kind} not found: {}", path.display())]
    MissingResource { kind: &'static str, path: PathBuf },

    #[error("parameter shape mismatch: expected {expected}, found {found}")]
    ShapeMismatch { expected: String, found: String },

    #[error("unknown architecture: {0}")]
    UnknownArchitecture(String),

    #[error("unknown dataset: {0}")]
    UnknownDataset(String),

    #[error("unknown distance metric: {0} (expected one of 1, 2, inf, cos)")]
    UnknownMetric(String),

    #[error("sample index {index} out of range for a dataset of {len} samples")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid layer rule: {0}")]
    InvalidRule(String),

    #[error("malformed file {}: {detail}", path.display())]
    Format { path: PathBuf, detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

impl PolError {
    pub fn missing(kind: &'static str, path: impl Into<PathBuf>) -> Self {
        PolError::MissingResource { kind, path: path.into() }
    }

    pub fn shape_mismatch(expected: impl ToString, found: impl ToString) -> Self {
        PolError::ShapeMismatch {
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    pub fn format(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        PolError::Format { path: path.into(), detail: detail.into() }
    }
}

pub type Result<T> = std::result::Result<T, PolError>;
