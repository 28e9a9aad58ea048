//! Error taxonomy for adapter construction, injection and persistence

/// Errors raised while building, injecting, saving or loading adapters
#[derive(Debug, thiserror::Error)]
pub enum LoraError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Required dependency missing: {0}")]
    DependencyMissing(String),

    #[error(
        "Can't find {filename} for '{identifier}' locally or in the hub cache. \
         Please check that {filename} is present at {identifier}."
    )]
    ArtifactNotFound { identifier: String, filename: String },

    #[error("Shape mismatch for {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: String,
        expected: String,
        actual: String,
    },

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LoraError {
    pub(crate) fn shape(
        context: impl Into<String>,
        expected: (usize, usize),
        actual: (usize, usize),
    ) -> Self {
        LoraError::ShapeMismatch {
            context: context.into(),
            expected: format!("{}x{}", expected.0, expected.1),
            actual: format!("{}x{}", actual.0, actual.1),
        }
    }
}

pub type Result<T> = std::result::Result<T, LoraError>;
