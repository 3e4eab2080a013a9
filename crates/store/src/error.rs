use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sea_orm::DbErr),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("duplicate record: {0}")]
    Duplicate(String),

    #[error("conflicting update: {0}")]
    Conflict(String),

    #[error("insufficient balance: have {available}, need {needed}")]
    InsufficientBalance { available: i64, needed: i64 },

    #[error("unknown status value: {0}")]
    UnknownStatus(String),

    #[error("invalid record: {0}")]
    Invalid(String),
}

impl StoreError {
    /// True when the underlying driver reported a uniqueness violation.
    /// Used to turn duplicate inserts into idempotent lookups.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            StoreError::Duplicate(_) => true,
            StoreError::Db(err) => {
                let text = err.to_string();
                text.contains("UNIQUE") || text.contains("Duplicate entry") || text.contains("1062")
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
