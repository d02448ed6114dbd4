use thiserror::Error;

pub type Result<T> = std::result::Result<T, EtlError>;

#[derive(Debug, Error)]
pub enum EtlError {
    /// A funnel event (or group of events) could not be turned into a journey.
    #[error("malformed funnel event: {0}")]
    MalformedEvent(String),

    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    #[error("empty batch for staging table {0}")]
    EmptyBatch(String),

    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("invalid merge target: {0}")]
    InvalidTarget(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// Adapter-level failure that is not a driver error (missing table, armed fail-point).
    #[error("warehouse error: {0}")]
    Warehouse(String),

    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EtlError {
    /// Data-shape problems a batch job may skip; everything else aborts the run.
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedEvent(_) | Self::InvalidBatch(_) | Self::EmptyBatch(_)
        )
    }
}
