use thiserror::Error;

pub type DeliveryResult<T> = Result<T, DeliveryError>;

#[derive(Error, Debug)]
pub enum DeliveryError {
    /// The requested ad unit id does not exist in the index.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The query ran fine but nothing was eligible. Not a fault.
    #[error("No ads were found matching the target criteria - {0}")]
    NoMatch(String),

    /// Index, upstream API or counter store unreachable or erroring.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl DeliveryError {
    /// HTTP status code this error is surfaced with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::NoMatch(_) => 200,
            Self::Validation(_) => 400,
            Self::Transport(_) | Self::Config(_) | Self::Serialization(_) | Self::Internal(_) => {
                500
            }
        }
    }

    pub fn is_no_match(&self) -> bool {
        matches!(self, Self::NoMatch(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }
}
