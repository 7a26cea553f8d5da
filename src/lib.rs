//! ask-the-code - question answering over the Markdown docs of a repository.
//!
//! Documents are split into heading-scoped sections, stored in a collection
//! per repository, recalled with a first-stage query (keywords fused with
//! embedding similarity), reranked with
//! [ColBERT](https://github.com/stanford-futuredata/ColBERT) MaxSim and
//! finally handed to a language model that streams a grounded answer.
//!
//! # Quick start
//!
//! ```no_run
//! use std::path::Path;
//!
//! use ask_the_code::{DataDir, Settings};
//! use ask_the_code::index::Indexer;
//! use ask_the_code::model_manager::ModelManager;
//! use ask_the_code::reranker::ColbertReranker;
//! use ask_the_code::search::Retriever;
//! use ask_the_code::store::{self, open_store};
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let settings = Settings::load(&data_dir.settings_file()).unwrap();
//! let model = ModelManager::shared(&settings.reranker_model);
//! let store = open_store(&settings, &data_dir, &model).unwrap();
//! let root = Path::new("/path/to/repo");
//!
//! for file in Indexer::new(&store, root, &settings.glob).create().unwrap() {
//!     println!("indexed {}", file.unwrap().path);
//! }
//!
//! let reranker = ColbertReranker::shared(model.clone());
//! let retriever = Retriever::new(&store, &reranker, store::collection_name(root));
//! for source in retriever.search("how do I install it?", 0.0).unwrap() {
//!     println!("{} (score: {:.3})", source.source, source.score);
//! }
//! ```

pub mod chunking;
pub mod data_dir;
pub mod embedding;
pub mod error;
pub mod index;
pub mod llm;
pub mod model_manager;
pub mod reranker;
pub mod search;
pub mod settings;
pub mod store;
pub mod walker;

pub use data_dir::DataDir;
pub use error::{Error, Result};
pub use model_manager::ModelManager;
pub use settings::Settings;
