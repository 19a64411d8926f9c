use thiserror::Error;

#[derive(Error, Debug)]
pub enum TallyError {
    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid record: {0}")]
    Validation(String),

    #[error("Payment date required to build an id for {0}")]
    MissingPaymentDate(String),

    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("No statement found for {0}")]
    UnknownStatement(String),

    #[error("Conflicting cached categories for '{0}'; run `tally category resolve`")]
    CacheInconsistency(String),

    #[error("PDF error: {0}")]
    Pdf(String),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TallyError>;

/// Failures of the AI collaborator. Kept apart from [`TallyError`] so the
/// engine can turn them into a per-transaction outcome.
#[derive(Error, Debug)]
pub enum SuggestError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("rate limited by provider")]
    RateLimited,

    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl SuggestError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::RateLimited => true,
            Self::Status { status, .. } => *status >= 500,
            Self::Malformed(_) => false,
        }
    }
}
