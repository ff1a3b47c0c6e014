use thiserror::Error;

/// Error kinds produced by the delta-update engine.
///
/// Variants and the process exit codes in [`GsError::exit_code`] mirror the
/// error-handling design: most kinds are either suppressed at the point of
/// use (`DecodeError`, `MissingExchangeRate`) or fatal and abort the batch
/// with no partial writes (`AssertionFailure`, `SinkError`).
#[derive(Error, Debug)]
pub enum GsError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("missing exchange rate for block {0}")]
    MissingExchangeRate(u64),

    #[error("decode error: {0}")]
    DecodeError(String),

    #[error("assertion failure: {0}")]
    AssertionFailure(String),

    #[error("sink error: {0}")]
    Sink(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("delta updates disabled by configuration")]
    DeltaUpdatesDisabled,

    #[error("lock contention on {0}")]
    LockContention(String),

    #[error("exchange rate gap at block {0} (validate mode)")]
    ExchangeRateGap(u64),

    #[error("already in recovery mode, hint file: {0}")]
    AlreadyInRecoveryMode(String),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GsError {
    /// Process exit code for this error, per the external-interfaces contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            GsError::Config(_) => 10,
            GsError::DeltaUpdatesDisabled => 125,
            GsError::LockContention(_) => 911,
            GsError::ExchangeRateGap(_) => 92,
            _ => 1,
        }
    }
}

pub type GsResult<T> = Result<T, GsError>;
