use towersync_models::ModelError;

/// Result type alias for ingest operations.
pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Download failed, HTTP status code {0}")]
    DownloadStatus(reqwest::StatusCode),

    #[error("Error fetching snapshot: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Error reading snapshot archive: {0}")]
    Archive(#[from] std::io::Error),

    #[error("Error decoding page {name}: {source}")]
    PageDecode {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Page {0} is not a JSON object")]
    PageShape(String),

    #[error("Could not determine object type from page name {0}")]
    UnknownPageKind(String),

    #[error("Invalid object type found {0}")]
    InvalidObjectType(String),

    #[error("No type provided for object in page {0}")]
    MissingObjectType(String),

    #[error("Object of type {0} has no id")]
    MissingObjectId(String),

    #[error("Error finding {entity} {source_ref} while resolving {step} links")]
    MissingReferent {
        step: &'static str,
        entity: &'static str,
        source_ref: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Model(#[from] ModelError),
}
