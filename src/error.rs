//! Error type shared by the domain modules.
//!
//! Command handlers turn these into plain strings for the front end, so the
//! `Display` text of every variant is what the operator sees in the alert.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    /// Input rejected before touching the database.
    #[error("{0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The row exists but is in a state that forbids the operation.
    #[error("{0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),

    #[error("export failed: {0}")]
    Export(#[from] zip::result::ZipError),

    #[error("database connection lock poisoned")]
    Lock,

    #[error("could not open {target}: {reason}")]
    Browser { target: String, reason: String },
}

pub type AppResult<T> = Result<T, AppError>;

/// Command handlers return `Result<Value, String>`.
impl From<AppError> for String {
    fn from(err: AppError) -> Self {
        err.to_string()
    }
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }
}
