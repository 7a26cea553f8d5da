//! Section stores: where chunked documents are persisted and queried.
//!
//! Backends implement [`VectorStore`] and are resolved once by name through
//! [`open_store`].

use std::path::Path;

use crate::{
    data_dir::DataDir,
    embedding::ColbertEmbedder,
    error::{Error, Result},
    model_manager::SharedModel,
    settings::Settings,
};

pub mod local;
pub mod marqo;

pub use local::LocalStore;
pub use marqo::MarqoStore;

/// Hits of a query: one list per query text, ids and documents aligned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub ids: Vec<Vec<String>>,
    pub documents: Vec<Vec<String>>,
}

impl QueryResult {
    /// Result of a single query text.
    pub fn single(ids: Vec<String>, documents: Vec<String>) -> Self {
        Self {
            ids: vec![ids],
            documents: vec![documents],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.documents.iter().all(Vec::is_empty)
    }
}

/// Persistence capability consumed by the indexer and the retriever.
pub trait VectorStore {
    /// Create an empty collection. Creating an existing one is a no-op.
    fn create_collection(&self, name: &str) -> Result<()>;

    /// Drop a collection and everything in it. Missing collections are
    /// ignored.
    fn delete_collection(&self, name: &str) -> Result<()>;

    fn has_collection(&self, name: &str) -> Result<bool>;

    /// Insert or replace documents keyed by id. `ids` and `documents` are
    /// parallel.
    fn upsert(
        &self,
        collection: &str,
        ids: &[String],
        documents: &[String],
    ) -> Result<()>;

    /// Return up to `k` documents most similar to `text`.
    fn query(&self, collection: &str, text: &str, k: usize) -> Result<QueryResult>;
}

/// Name of the collection holding the sections of the repository at `root`.
pub fn collection_name(root: &Path) -> String {
    let base = root
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("docs-{base}")
}

macro_rules! delegate_store {
    ($self:expr, |$s:ident| $expr:expr) => {
        match $self {
            AnyStore::Local($s) => $expr,
            AnyStore::Marqo($s) => $expr,
        }
    };
}

/// A store backend selected at startup.
#[derive(Debug)]
pub enum AnyStore {
    Local(LocalStore),
    Marqo(MarqoStore),
}

impl VectorStore for AnyStore {
    fn create_collection(&self, name: &str) -> Result<()> {
        delegate_store!(self, |s| s.create_collection(name))
    }

    fn delete_collection(&self, name: &str) -> Result<()> {
        delegate_store!(self, |s| s.delete_collection(name))
    }

    fn has_collection(&self, name: &str) -> Result<bool> {
        delegate_store!(self, |s| s.has_collection(name))
    }

    fn upsert(
        &self,
        collection: &str,
        ids: &[String],
        documents: &[String],
    ) -> Result<()> {
        delegate_store!(self, |s| s.upsert(collection, ids, documents))
    }

    fn query(&self, collection: &str, text: &str, k: usize) -> Result<QueryResult> {
        delegate_store!(self, |s| s.query(collection, text, k))
    }
}

/// Resolve the store backend named in `settings.store`.
///
/// The local store embeds with `model` when `settings.semantic_recall` is
/// set; the model is only loaded once something is embedded.
pub fn open_store(
    settings: &Settings,
    data_dir: &DataDir,
    model: &SharedModel,
) -> Result<AnyStore> {
    match settings.store.as_str() {
        "local" => {
            let store = LocalStore::open(&data_dir.store_dir()?)?;
            Ok(AnyStore::Local(if settings.semantic_recall {
                store.with_embedder(ColbertEmbedder::new(model.clone()))
            } else {
                store
            }))
        }
        "marqo" => Ok(AnyStore::Marqo(MarqoStore::new(
            &settings.marqo_url,
            &settings.marqo_model,
        )?)),
        other => Err(Error::UnknownBackend {
            kind: "store",
            name: other.to_string(),
        }),
    }
}
