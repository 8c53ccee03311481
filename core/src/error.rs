use thiserror::Error;

/// Errors produced by the domain layer.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// A lookup by id matched nothing.
    #[error("Document does not exist")]
    DocumentDoesNotExist,

    #[error("Invalid current user email")]
    InvalidCurrentUserEmail,

    #[error("Invalid email address: {0}")]
    InvalidEmail(String),

    #[error("An account already exists for {0}")]
    EmailAlreadyExists(String),

    #[error("At least one other member is required")]
    NoMembers,

    #[error("No account found for: {}", .0.join(", "))]
    UnknownMembers(Vec<String>),

    #[error("A conversation with these members already exists")]
    DuplicateConversation,

    #[error("A message needs text or media")]
    EmptyMessage,

    /// Stored rows are missing a required relation or value.
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    /// The caller may not touch a record owned by another account.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Missing resource: {0}")]
    MissingResource(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CoreError>;
