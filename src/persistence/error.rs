use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("A transaction is already active on this unit of work")]
    TransactionAlreadyActive,

    #[error("No active transaction")]
    NoActiveTransaction,

    #[error("{kind} with key {key} already exists")]
    Conflict { kind: String, key: String },

    #[error("{kind} with key {key} not found")]
    NotFound { kind: String, key: String },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Entity serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store unavailable after {attempts} attempt(s): {reason}")]
    Unavailable { attempts: u32, reason: String },

    #[error("Invalid store configuration: {0}")]
    Configuration(String),

    #[error("Blocking store task failed: {0}")]
    Blocking(String),

    #[error("Persistence lock poisoned during {0}")]
    LockPoisoned(&'static str),
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

impl PersistenceError {
    pub(crate) fn conflict(kind: &str, key: &str) -> Self {
        PersistenceError::Conflict {
            kind: kind.to_string(),
            key: key.to_string(),
        }
    }

    pub(crate) fn not_found(kind: &str, key: &str) -> Self {
        PersistenceError::NotFound {
            kind: kind.to_string(),
            key: key.to_string(),
        }
    }
}
