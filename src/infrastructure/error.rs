use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("Remote error: {0}")]
    Remote(String),
    #[error("Remote call timed out after {0}ms")]
    Timeout(u64),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

impl InfraError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_) | Self::Timeout(_))
    }
}
