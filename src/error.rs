use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid folder name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("path '{path}' has depth {depth}, maximum is {max}")]
    MaxDepthExceeded { path: String, depth: usize, max: usize },

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("{what} is already {status}")]
    AlreadyTerminal { what: String, status: String },

    #[error("access token is invalid or inactive")]
    TokenInvalid,

    #[error("access token {0} has expired")]
    TokenExpired(String),

    #[error("access token {0} has reached its usage limit")]
    TokenExhausted(String),

    #[error("invitation {0} has expired")]
    InvitationExpired(String),

    #[error("token lookup collision")]
    TokenLookupCollision,

    #[error("credential error: {0}")]
    Credential(String),

    #[error("embedding provider error: {0}")]
    Provider(String),

    /// `completed` names the items that succeeded before the failing batch.
    #[error("batch {batch}/{total} failed: {cause}")]
    BatchAborted {
        batch: usize,
        total: usize,
        cause: String,
        completed: Vec<String>,
    },
}

impl Error {
    pub(crate) fn not_found(kind: &str, id: impl std::fmt::Display) -> Self {
        Error::NotFound(format!("{kind} '{id}'"))
    }

    pub(crate) fn already_exists(kind: &str, id: impl std::fmt::Display) -> Self {
        Error::AlreadyExists(format!("{kind} '{id}'"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
