//! Embedded store: a redb collection registry plus a tantivy section index.
//!
//! First-stage recall is BM25 over the section text and the section
//! identifier, so heading words participate in matching. With an
//! [`Embedder`] attached, every section's token embeddings are kept in redb
//! as well and the BM25 ranking is fused with a MaxSim ranking, so
//! paraphrased questions still recall their sections. Relevance proper is
//! decided later by the reranker.

use std::{
    collections::HashMap,
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tantivy::{
    Index,
    IndexReader,
    IndexWriter,
    Searcher,
    TantivyDocument,
    Term,
    collector::TopDocs,
    doc,
    query::{BooleanQuery, Occur, QueryParser, TermQuery},
    schema::*,
    tokenizer::{
        Language,
        LowerCaser,
        RemoveLongFilter,
        SimpleTokenizer,
        Stemmer,
        TextAnalyzer,
    },
};

use super::{QueryResult, VectorStore};
use crate::{
    embedding::{Embedder, EmbeddingMatrix},
    error::{Error, Result},
};

/// Collection name -> creation time (seconds since the Unix epoch).
const COLLECTIONS: TableDefinition<&str, u64> =
    TableDefinition::new("collections");

/// Section key -> serialized [`EmbeddingMatrix`].
const EMBEDDINGS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("embeddings");

/// Rank offset of reciprocal rank fusion.
const RRF_K: f32 = 60.0;

const WRITER_MEMORY_BUDGET: usize = 15_000_000;

/// Field names used in the schema.
pub mod fields {
    pub const KEY: &str = "key";
    pub const COLLECTION: &str = "collection";
    pub const SOURCE: &str = "source";
    pub const TEXT: &str = "text";
}

/// Resolved field handles for the schema.
#[derive(Clone, Copy)]
struct SchemaFields {
    key: Field,
    collection: Field,
    source: Field,
    text: Field,
}

fn build_schema() -> (Schema, SchemaFields) {
    let mut builder = Schema::builder();

    let key = builder.add_text_field(fields::KEY, STRING);
    let collection = builder.add_text_field(fields::COLLECTION, STRING);

    let stemmed = TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer("en_stem")
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        )
        .set_stored();
    let source = builder.add_text_field(fields::SOURCE, stemmed.clone());
    let text = builder.add_text_field(fields::TEXT, stemmed);

    (
        builder.build(),
        SchemaFields {
            key,
            collection,
            source,
            text,
        },
    )
}

fn register_tokenizers(index: &Index) {
    let en_stem = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .filter(Stemmer::new(Language::English))
        .build();
    index.tokenizers().register("en_stem", en_stem);
}

/// Unique key of a section across collections.
fn section_key(collection: &str, id: &str) -> String {
    format!("{collection}\u{1f}{id}")
}

/// Half-open key range holding every section key of `collection`.
fn collection_range(collection: &str) -> (String, String) {
    (format!("{collection}\u{1f}"), format!("{collection}\u{20}"))
}

/// Reciprocal rank fusion of several rankings, best first.
///
/// Ties keep the order in which ids were first seen.
fn reciprocal_rank_fusion(rankings: &[&[String]], k: f32) -> Vec<String> {
    let mut scores: HashMap<&str, f32> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();

    for ranking in rankings {
        for (rank, id) in ranking.iter().enumerate() {
            let score = scores.entry(id.as_str()).or_insert_with(|| {
                order.push(id.as_str());
                0.0
            });
            *score += 1.0 / (k + rank as f32 + 1.0);
        }
    }

    order.sort_by(|a, b| scores[b].total_cmp(&scores[a]));
    order.into_iter().map(str::to_string).collect()
}

pub struct LocalStore {
    db: Database,
    index: Index,
    reader: IndexReader,
    fields: SchemaFields,
    embedder: Option<Box<dyn Embedder>>,
}

impl LocalStore {
    /// Open or create the store under `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db = Database::create(dir.join("collections.redb"))?;

        let txn = db.begin_write()?;
        txn.open_table(COLLECTIONS)?;
        txn.open_table(EMBEDDINGS)?;
        txn.commit()?;

        let index_dir = dir.join("index");
        std::fs::create_dir_all(&index_dir)?;
        let (schema, fields) = build_schema();

        let mmap_dir = tantivy::directory::MmapDirectory::open(&index_dir)
            .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()))?;
        let index = if Index::exists(&mmap_dir)
            .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()))?
        {
            Index::open(mmap_dir)?
        } else {
            Index::create(mmap_dir, schema, tantivy::IndexSettings::default())?
        };

        register_tokenizers(&index);
        let reader = index.reader()?;

        Ok(Self {
            db,
            index,
            reader,
            fields,
            embedder: None,
        })
    }

    /// Embed sections on upsert and fuse semantic recall into queries.
    pub fn with_embedder(mut self, embedder: impl Embedder + 'static) -> Self {
        self.embedder = Some(Box::new(embedder));
        self
    }

    fn writer(&self) -> Result<IndexWriter> {
        Ok(self.index.writer(WRITER_MEMORY_BUDGET)?)
    }

    fn require_collection(&self, name: &str) -> Result<()> {
        if self.has_collection(name)? {
            Ok(())
        } else {
            Err(Error::collection_not_found(name))
        }
    }

    /// Number of sections stored in `collection`.
    pub fn count(&self, collection: &str) -> Result<usize> {
        self.reader.reload()?;
        let searcher = self.reader.searcher();
        let query = TermQuery::new(
            Term::from_field_text(self.fields.collection, collection),
            IndexRecordOption::Basic,
        );
        Ok(searcher.search(&query, &tantivy::collector::Count)?)
    }

    /// BM25 ranking of `(id, text)` pairs within `collection`.
    fn lexical_ranking(
        &self,
        searcher: &Searcher,
        collection: &str,
        text: &str,
        k: usize,
    ) -> Result<Vec<(String, String)>> {
        let f = self.fields;

        let mut parser = QueryParser::for_index(&self.index, vec![f.source, f.text]);
        parser.set_field_boost(f.source, 2.0);
        let (user_query, _errors) = parser.parse_query_lenient(text);

        let collection_query = TermQuery::new(
            Term::from_field_text(f.collection, collection),
            IndexRecordOption::Basic,
        );
        let combined = BooleanQuery::new(vec![
            (Occur::Must, user_query),
            (Occur::Must, Box::new(collection_query)),
        ]);

        let top_docs = searcher.search(&combined, &TopDocs::with_limit(k))?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (_score, address) in top_docs {
            let doc: TantivyDocument = searcher.doc(address)?;
            hits.push((extract_text(&doc, f.source), extract_text(&doc, f.text)));
        }
        Ok(hits)
    }

    /// MaxSim ranking of section ids within `collection`.
    ///
    /// The query is only embedded when the collection holds embeddings.
    fn semantic_ranking(
        &self,
        embedder: &dyn Embedder,
        collection: &str,
        text: &str,
        k: usize,
    ) -> Result<Vec<String>> {
        let (start, end) = collection_range(collection);
        let txn = self.db.begin_read()?;
        let table = txn.open_table(EMBEDDINGS)?;

        let mut entries = table.range(start.as_str()..end.as_str())?.peekable();
        if entries.peek().is_none() {
            return Ok(Vec::new());
        }
        let query = embedder.embed_query(text)?;

        let mut scored = Vec::new();
        for entry in entries {
            let (key, value) = entry?;
            let Some(matrix) = EmbeddingMatrix::from_bytes(value.value()) else {
                tracing::warn!(key = key.value(), "skipping unreadable embedding");
                continue;
            };
            let id = key.value().strip_prefix(start.as_str()).unwrap_or_default();
            scored.push((id.to_string(), matrix.maxsim(&query)));
        }

        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);
        Ok(scored.into_iter().map(|(id, _)| id).collect())
    }

    /// Stored text of one section, if present.
    fn section_text(
        &self,
        searcher: &Searcher,
        collection: &str,
        id: &str,
    ) -> Result<Option<String>> {
        let key = Term::from_field_text(self.fields.key, &section_key(collection, id));
        let query = TermQuery::new(key, IndexRecordOption::Basic);
        let hits = searcher.search(&query, &TopDocs::with_limit(1))?;

        match hits.first() {
            Some((_score, address)) => {
                let doc: TantivyDocument = searcher.doc(*address)?;
                Ok(Some(extract_text(&doc, self.fields.text)))
            }
            None => Ok(None),
        }
    }
}

impl VectorStore for LocalStore {
    fn create_collection(&self, name: &str) -> Result<()> {
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(COLLECTIONS)?;
            if table.get(name)?.is_none() {
                table.insert(name, created)?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    fn delete_collection(&self, name: &str) -> Result<()> {
        let mut writer = self.writer()?;
        writer.delete_term(Term::from_field_text(self.fields.collection, name));
        writer.commit()?;

        let (start, end) = collection_range(name);
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(COLLECTIONS)?;
            table.remove(name)?;

            let mut embeddings = txn.open_table(EMBEDDINGS)?;
            let keys = embeddings
                .range(start.as_str()..end.as_str())?
                .map(|entry| entry.map(|(key, _)| key.value().to_string()))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            for key in &keys {
                embeddings.remove(key.as_str())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    fn has_collection(&self, name: &str) -> Result<bool> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(COLLECTIONS)?;
        Ok(table.get(name)?.is_some())
    }

    fn upsert(
        &self,
        collection: &str,
        ids: &[String],
        documents: &[String],
    ) -> Result<()> {
        self.require_collection(collection)?;

        // Encode before touching either index so a model failure writes
        // nothing.
        let embeddings = match &self.embedder {
            Some(embedder) => {
                let matrices = embedder.embed_documents(documents)?;
                if matrices.len() != documents.len() {
                    return Err(Error::Model(format!(
                        "embedded {} of {} sections",
                        matrices.len(),
                        documents.len()
                    )));
                }
                Some(matrices)
            }
            None => None,
        };

        let f = self.fields;
        let mut writer = self.writer()?;
        for (id, text) in ids.iter().zip(documents) {
            let key = section_key(collection, id);
            // Replace any earlier version of this section.
            writer.delete_term(Term::from_field_text(f.key, &key));
            writer.add_document(doc!(
                f.key => key,
                f.collection => collection,
                f.source => id.as_str(),
                f.text => text.as_str(),
            ))?;
        }
        writer.commit()?;

        if let Some(matrices) = embeddings {
            let txn = self.db.begin_write()?;
            {
                let mut table = txn.open_table(EMBEDDINGS)?;
                for (id, matrix) in ids.iter().zip(&matrices) {
                    let key = section_key(collection, id);
                    table.insert(key.as_str(), matrix.to_bytes().as_slice())?;
                }
            }
            txn.commit()?;
        }

        tracing::trace!(collection, count = ids.len(), "committed batch");
        Ok(())
    }

    fn query(&self, collection: &str, text: &str, k: usize) -> Result<QueryResult> {
        self.require_collection(collection)?;

        self.reader.reload()?;
        let searcher = self.reader.searcher();
        let lexical = self.lexical_ranking(&searcher, collection, text, k)?;

        let Some(embedder) = self.embedder.as_deref() else {
            let (ids, documents) = lexical.into_iter().unzip();
            return Ok(QueryResult::single(ids, documents));
        };

        let semantic = self.semantic_ranking(embedder, collection, text, k)?;
        let lexical_ids: Vec<String> =
            lexical.iter().map(|(id, _)| id.clone()).collect();
        let fused = reciprocal_rank_fusion(&[&lexical_ids[..], &semantic[..]], RRF_K);

        let mut texts: HashMap<String, String> = lexical.into_iter().collect();
        let mut ids = Vec::with_capacity(k);
        let mut documents = Vec::with_capacity(k);
        for id in fused.into_iter().take(k) {
            let text = match texts.remove(&id) {
                Some(text) => text,
                None => match self.section_text(&searcher, collection, &id)? {
                    Some(text) => text,
                    None => continue,
                },
            };
            ids.push(id);
            documents.push(text);
        }

        Ok(QueryResult::single(ids, documents))
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("semantic_recall", &self.embedder.is_some())
            .finish_non_exhaustive()
    }
}

fn extract_text(doc: &TantivyDocument, field: Field) -> String {
    doc.get_first(field)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn open_with(collection: &str) -> (tempfile::TempDir, LocalStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalStore::open(tmp.path()).unwrap();
        store.create_collection(collection).unwrap();
        (tmp, store)
    }

    #[test]
    fn create_and_delete_collection() {
        let (_tmp, store) = open_with("docs-repo");
        assert!(store.has_collection("docs-repo").unwrap());

        store.delete_collection("docs-repo").unwrap();
        assert!(!store.has_collection("docs-repo").unwrap());

        // Deleting again is a no-op.
        store.delete_collection("docs-repo").unwrap();
    }

    #[test]
    fn upsert_is_idempotent_per_id() {
        let (_tmp, store) = open_with("docs-repo");
        let ids = strings(&["README.md#setup"]);

        store.upsert("docs-repo", &ids, &strings(&["Run install."])).unwrap();
        store
            .upsert("docs-repo", &ids, &strings(&["Run install again."]))
            .unwrap();

        assert_eq!(store.count("docs-repo").unwrap(), 1);
        let hits = store.query("docs-repo", "install", 10).unwrap();
        assert_eq!(hits.documents, vec![strings(&["Run install again."])]);
    }

    #[test]
    fn heading_text_finds_its_section() {
        let (_tmp, store) = open_with("docs-repo");
        store
            .upsert(
                "docs-repo",
                &strings(&["README.md#setup", "README.md#usage"]),
                &strings(&["Run install.", "Call the binary."]),
            )
            .unwrap();

        let hits = store.query("docs-repo", "Setup", 10).unwrap();
        assert_eq!(hits.ids[0][0], "README.md#setup");
        assert_eq!(hits.documents[0][0], "Run install.");
    }

    #[test]
    fn query_is_scoped_to_collection() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalStore::open(tmp.path()).unwrap();
        store.create_collection("docs-a").unwrap();
        store.create_collection("docs-b").unwrap();
        store
            .upsert("docs-a", &strings(&["a.md"]), &strings(&["shared words"]))
            .unwrap();
        store
            .upsert("docs-b", &strings(&["b.md"]), &strings(&["shared words"]))
            .unwrap();

        let hits = store.query("docs-a", "shared", 10).unwrap();
        assert_eq!(hits.ids, vec![strings(&["a.md"])]);
    }

    #[test]
    fn delete_collection_drops_its_sections() {
        let (_tmp, store) = open_with("docs-repo");
        store
            .upsert("docs-repo", &strings(&["a.md"]), &strings(&["hello"]))
            .unwrap();

        store.delete_collection("docs-repo").unwrap();
        store.create_collection("docs-repo").unwrap();

        assert_eq!(store.count("docs-repo").unwrap(), 0);
        assert!(store.query("docs-repo", "hello", 10).unwrap().is_empty());
    }

    #[test]
    fn missing_collection_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalStore::open(tmp.path()).unwrap();

        let err = store.query("docs-missing", "anything", 10).unwrap_err();
        assert!(matches!(
            err,
            Error::CollectionNotFound { ref name } if name == "docs-missing"
        ));
        assert!(
            store
                .upsert("docs-missing", &strings(&["a"]), &strings(&["b"]))
                .is_err()
        );
    }

    #[test]
    fn stemming_works() {
        let (_tmp, store) = open_with("docs-repo");
        store
            .upsert(
                "docs-repo",
                &strings(&["guide.md#running"]),
                &strings(&["the runners were running quickly"]),
            )
            .unwrap();

        let hits = store.query("docs-repo", "run", 10).unwrap();
        assert!(!hits.is_empty());
    }

    #[test]
    fn repeated_id_in_one_batch_keeps_the_later_text() {
        let (_tmp, store) = open_with("docs-repo");
        store
            .upsert(
                "docs-repo",
                &strings(&["a.md#faq", "a.md#faq"]),
                &strings(&["one", "two"]),
            )
            .unwrap();

        assert_eq!(store.count("docs-repo").unwrap(), 1);
        let hits = store.query("docs-repo", "faq", 10).unwrap();
        assert_eq!(hits.ids, vec![strings(&["a.md#faq"])]);
        assert_eq!(hits.documents, vec![strings(&["two"])]);
    }

    /// One token per text; each dimension counts words of one topic.
    struct TopicEmbedder {
        queries: Rc<Cell<usize>>,
    }

    const TOPICS: [&[&str]; 2] = [
        &["install", "setup", "started"],
        &["call", "binary", "usage"],
    ];

    fn topic_matrix(text: &str) -> EmbeddingMatrix {
        let lower = text.to_lowercase();
        let row = TOPICS
            .iter()
            .map(|words| words.iter().filter(|w| lower.contains(*w)).count() as f32)
            .collect();
        EmbeddingMatrix::from_rows(2, row).unwrap()
    }

    impl Embedder for TopicEmbedder {
        fn embed_documents(&self, texts: &[String]) -> Result<Vec<EmbeddingMatrix>> {
            Ok(texts.iter().map(|t| topic_matrix(t)).collect())
        }

        fn embed_query(&self, text: &str) -> Result<EmbeddingMatrix> {
            self.queries.set(self.queries.get() + 1);
            Ok(topic_matrix(text))
        }
    }

    fn open_semantic(
        collection: &str,
    ) -> (tempfile::TempDir, LocalStore, Rc<Cell<usize>>) {
        let tmp = tempfile::tempdir().unwrap();
        let queries = Rc::new(Cell::new(0));
        let store = LocalStore::open(tmp.path())
            .unwrap()
            .with_embedder(TopicEmbedder {
                queries: queries.clone(),
            });
        store.create_collection(collection).unwrap();
        (tmp, store, queries)
    }

    fn setup_and_usage() -> (Vec<String>, Vec<String>) {
        (
            strings(&["a.md#setup", "a.md#usage"]),
            strings(&["Run install.", "Call the binary."]),
        )
    }

    #[test]
    fn paraphrase_without_shared_terms_is_recalled() {
        let (ids, documents) = setup_and_usage();

        let (_tmp, lexical) = open_with("docs-repo");
        lexical.upsert("docs-repo", &ids, &documents).unwrap();
        assert!(
            lexical
                .query("docs-repo", "how do I get started", 10)
                .unwrap()
                .is_empty()
        );

        let (_tmp, store, _queries) = open_semantic("docs-repo");
        store.upsert("docs-repo", &ids, &documents).unwrap();
        let hits = store.query("docs-repo", "how do I get started", 10).unwrap();

        assert_eq!(hits.ids[0][0], "a.md#setup");
        assert_eq!(hits.documents[0][0], "Run install.");
        assert_eq!(hits.ids[0].len(), hits.documents[0].len());
    }

    #[test]
    fn fused_results_respect_k() {
        let (ids, documents) = setup_and_usage();
        let (_tmp, store, _queries) = open_semantic("docs-repo");
        store.upsert("docs-repo", &ids, &documents).unwrap();

        let hits = store.query("docs-repo", "install the binary", 1).unwrap();
        assert_eq!(hits.ids[0].len(), 1);
    }

    #[test]
    fn semantic_recall_is_scoped_to_collection() {
        let (_tmp, store, _queries) = open_semantic("docs-a");
        store.create_collection("docs-ab").unwrap();
        store
            .upsert("docs-a", &strings(&["a.md#setup"]), &strings(&["Run install."]))
            .unwrap();
        store
            .upsert("docs-ab", &strings(&["b.md#setup"]), &strings(&["Run install."]))
            .unwrap();

        let hits = store.query("docs-a", "get started", 10).unwrap();
        assert_eq!(hits.ids, vec![strings(&["a.md#setup"])]);
    }

    #[test]
    fn repeated_id_keeps_one_embedding() {
        let (_tmp, store, _queries) = open_semantic("docs-repo");
        store
            .upsert(
                "docs-repo",
                &strings(&["a.md#faq", "a.md#faq"]),
                &strings(&["setup one", "setup two"]),
            )
            .unwrap();

        let hits = store.query("docs-repo", "started", 10).unwrap();
        assert_eq!(hits.ids, vec![strings(&["a.md#faq"])]);
        assert_eq!(hits.documents, vec![strings(&["setup two"])]);
    }

    #[test]
    fn delete_collection_drops_embeddings() {
        let (ids, documents) = setup_and_usage();
        let (_tmp, store, queries) = open_semantic("docs-repo");
        store.upsert("docs-repo", &ids, &documents).unwrap();

        store.delete_collection("docs-repo").unwrap();
        store.create_collection("docs-repo").unwrap();

        assert!(store.query("docs-repo", "get started", 10).unwrap().is_empty());
        // Nothing to compare against, so the query is never embedded.
        assert_eq!(queries.get(), 0);
    }

    #[test]
    fn rank_fusion_rewards_agreement() {
        let lexical = strings(&["a", "b", "c"]);
        let semantic = strings(&["c", "d"]);

        let fused = reciprocal_rank_fusion(&[&lexical[..], &semantic[..]], RRF_K);
        assert_eq!(fused, strings(&["c", "a", "b", "d"]));
    }

    #[test]
    fn disk_persistence() {
        let tmp = tempfile::tempdir().unwrap();

        {
            let store = LocalStore::open(tmp.path()).unwrap();
            store.create_collection("docs-repo").unwrap();
            store
                .upsert("docs-repo", &strings(&["a.md"]), &strings(&["persistent data"]))
                .unwrap();
        }

        {
            let store = LocalStore::open(tmp.path()).unwrap();
            assert!(store.has_collection("docs-repo").unwrap());
            let hits = store.query("docs-repo", "persistent", 10).unwrap();
            assert_eq!(hits.ids, vec![strings(&["a.md"])]);
        }
    }
}
