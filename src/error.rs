use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("database open error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("index error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid settings file: {0}")]
    Settings(#[from] toml::de::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("collection {name} not found")]
    CollectionNotFound { name: String },

    #[error("unknown {kind} backend: {name}")]
    UnknownBackend { kind: &'static str, name: String },

    #[error("malformed response from {backend}: {payload}")]
    MalformedResponse {
        backend: &'static str,
        payload: String,
    },

    #[error("{backend} returned HTTP {status}: {message}")]
    Upstream {
        backend: &'static str,
        status: u16,
        message: String,
    },

    #[error("not inside a git repository: {0}")]
    NotInRepository(PathBuf),

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),
}

impl Error {
    pub fn collection_not_found(name: impl Into<String>) -> Self {
        Self::CollectionNotFound { name: name.into() }
    }

    pub fn malformed(backend: &'static str, payload: impl Into<String>) -> Self {
        Self::MalformedResponse {
            backend,
            payload: payload.into(),
        }
    }

    /// Error for a non-success HTTP response, keeping what the server said.
    pub fn upstream(
        backend: &'static str,
        response: reqwest::blocking::Response,
    ) -> Self {
        let status = response.status().as_u16();
        let body = response.text().unwrap_or_default();
        Self::Upstream {
            backend,
            status,
            message: upstream_message(&body),
        }
    }
}

/// Pull the human-readable message out of an error body.
///
/// Ollama answers `{"error": ...}` and Marqo `{"message": ...}`; anything
/// else is passed through as sent.
fn upstream_message(body: &str) -> String {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    parsed
        .as_ref()
        .and_then(|v| v.get("error").or_else(|| v.get("message")))
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.trim().to_string())
}
