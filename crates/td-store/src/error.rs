/// Errors produced by the entity store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection: {0}")]
    Connection(String),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for tokio_rusqlite::Error {
    fn from(e: StoreError) -> Self {
        tokio_rusqlite::Error::Other(Box::new(e))
    }
}

/// Unwrap a `tokio_rusqlite` call error back into a [`StoreError`].
///
/// Closures run on the connection thread return `tokio_rusqlite::Error`;
/// domain errors cross the boundary boxed inside `Error::Other`.
pub(crate) fn from_call(e: tokio_rusqlite::Error) -> StoreError {
    match e {
        tokio_rusqlite::Error::Rusqlite(e) => StoreError::Sqlite(e),
        tokio_rusqlite::Error::Other(boxed) => match boxed.downcast::<StoreError>() {
            Ok(domain) => *domain,
            Err(other) => StoreError::Connection(other.to_string()),
        },
        other => StoreError::Connection(other.to_string()),
    }
}
