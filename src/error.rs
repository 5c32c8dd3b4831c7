use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ReconError {
    /// Tree shape or leaf labelling problem, including tree/trait mismatch.
    #[error("Topology error: {0}")]
    Topology(String),
    /// Result log or column header that does not follow the expected layout.
    #[error("Format error: {0}")]
    Format(String),
    /// Chains that cannot be combined into one chain set.
    #[error("Alignment error: {0}")]
    Alignment(String),
    #[error("Invalid control value: {0}")]
    Control(String),
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ReconError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ReconError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, ReconError>;
