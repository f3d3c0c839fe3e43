use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuminaError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Insufficient text in {id}: {chars} chars (minimum {min})")]
    InsufficientText { id: String, chars: usize, min: usize },

    #[error("XML parse error: {0}")]
    Xml(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Artifact error: {0}")]
    Artifact(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RuminaError {
    /// IO failures on reads/writes are worth a bounded retry; everything else is final.
    pub fn is_transient_io(&self) -> bool {
        match self {
            RuminaError::Io(e) => !matches!(
                e.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::InvalidData
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, RuminaError>;
