/// Result type alias for model operations.
pub type Result<T> = std::result::Result<T, ModelError>;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Missing Required Attribute {0}")]
    MissingAttribute(String),

    #[error("Attribute {attr} is malformed: {reason}")]
    InvalidAttribute { attr: String, reason: String },

    #[error("Refresh already active for source {0}")]
    RefreshActive(i64),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ModelError {
    pub(crate) fn invalid(attr: &str, reason: impl Into<String>) -> Self {
        Self::InvalidAttribute {
            attr: attr.to_string(),
            reason: reason.into(),
        }
    }
}
