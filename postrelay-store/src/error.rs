use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The per-call deadline elapsed before the database answered.
    #[error("store call exceeded its {0:?} deadline")]
    Deadline(std::time::Duration),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A persisted value could not be decoded into its domain type.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Deadline and connectivity failures are worth retrying; corrupt
    /// records are not.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Deadline(_) | Self::Database(_))
    }
}
