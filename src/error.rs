use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetentionError {
    // 行不存在或属于其他用户；对外不区分这两种情况
    #[error("Subscription or cancellation case not found")]
    NotFoundOrUnauthorized,

    #[error("Invalid subscription status transition")]
    InvalidTransition,

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Immutable field cannot be changed: {0}")]
    ImmutableField(&'static str),

    #[error("Cancellation case is already finalized")]
    CaseFinalized,

    #[error("Concurrent case creation conflict")]
    ConflictRetryable,

    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("Postgres error: {0}")]
    Pg(#[from] tokio_postgres::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Time parse error: {0}")]
    TimeParse(String),

    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, RetentionError>;
