use serde::Serialize;

use crate::{
    error::{Error, Result},
    reranker::Reranker,
    store::VectorStore,
};

/// Number of candidates fetched from the store before reranking.
pub const TOP_K: usize = 10;

/// A retrieved section with its reranker score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocSource {
    pub source: String,
    pub text: String,
    pub score: f32,
}

/// Two-stage retrieval over one collection.
#[derive(Debug)]
pub struct Retriever<'a, S: VectorStore, R: Reranker> {
    store: &'a S,
    reranker: &'a R,
    collection: String,
}

impl<'a, S: VectorStore, R: Reranker> Retriever<'a, S, R> {
    pub fn new(store: &'a S, reranker: &'a R, collection: impl Into<String>) -> Self {
        Self {
            store,
            reranker,
            collection: collection.into(),
        }
    }

    /// Execute the full search pipeline.
    ///
    /// 1. Top-K similarity query against the store
    /// 2. Rerank every hit against the query
    /// 3. Drop results scoring at or below `min_score`
    /// 4. Sort by score, highest first
    pub fn search(&self, query: &str, min_score: f32) -> Result<Vec<DocSource>> {
        if !self.store.has_collection(&self.collection)? {
            return Err(Error::collection_not_found(&self.collection));
        }

        let hits = self.store.query(&self.collection, query, TOP_K)?;
        if hits.is_empty() {
            tracing::debug!(collection = %self.collection, "no candidates");
            return Ok(vec![]);
        }

        let ids: Vec<String> = hits.ids.into_iter().flatten().collect();
        let documents: Vec<String> = hits.documents.into_iter().flatten().collect();
        if ids.len() != documents.len() {
            return Err(Error::malformed(
                "store",
                format!(
                    "{} ids for {} documents in query result",
                    ids.len(),
                    documents.len()
                ),
            ));
        }

        let scores = self.reranker.compute_score(query, &documents)?;
        if scores.len() != documents.len() {
            return Err(Error::Model(format!(
                "reranker returned {} scores for {} candidates",
                scores.len(),
                documents.len()
            )));
        }

        let mut results: Vec<DocSource> = ids
            .into_iter()
            .zip(documents)
            .zip(scores)
            .filter(|&(_, score)| score > min_score)
            .map(|((source, text), score)| DocSource { source, text, score })
            .collect();

        // Stable: equal scores keep store order.
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        tracing::debug!(
            collection = %self.collection,
            kept = results.len(),
            min_score,
            "reranked candidates"
        );
        Ok(results)
    }
}

/// Format results for terminal output.
pub fn format_human(results: &[DocSource]) -> String {
    if results.is_empty() {
        return "No results found.\n".to_string();
    }

    let mut out = String::new();
    for (i, r) in results.iter().enumerate() {
        out.push_str(&format!("{:>3}. [{:.3}] {}\n", i + 1, r.score, r.source));
        for line in r.text.lines() {
            out.push_str("     ");
            out.push_str(line);
            out.push('\n');
        }
    }
    out.push_str(&format!("\n{} result(s)\n", results.len()));
    out
}

#[derive(Serialize)]
struct JsonOutput<'a> {
    query: &'a str,
    result_count: usize,
    results: &'a [DocSource],
}

/// Format results as a JSON document.
pub fn format_json(results: &[DocSource], query: &str) -> Result<String> {
    Ok(serde_json::to_string_pretty(&JsonOutput {
        query,
        result_count: results.len(),
        results,
    })?)
}
