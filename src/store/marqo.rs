//! Marqo-backed store, talking to a Marqo server over HTTP.

use std::time::Duration;

use reqwest::{StatusCode, blocking::Client};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{QueryResult, VectorStore};
use crate::error::{Error, Result};

const BACKEND: &str = "marqo";

#[derive(Debug, Clone)]
pub struct MarqoStore {
    client: Client,
    base_url: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(default)]
    text: String,
}

impl MarqoStore {
    pub fn new(base_url: &str, model: &str) -> Result<Self> {
        let client = Client::builder().timeout(None::<Duration>).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Fail on error statuses, mapping 404 to a missing collection.
    fn check(
        collection: &str,
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response> {
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::collection_not_found(collection));
        }
        success(response)
    }
}

/// Pass through 2xx responses; anything else becomes an error with the body.
fn success(
    response: reqwest::blocking::Response,
) -> Result<reqwest::blocking::Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(Error::upstream(BACKEND, response))
    }
}

/// Extract aligned ids and texts from a search response body.
fn parse_hits(body: &Value) -> Result<(Vec<String>, Vec<String>)> {
    let hits = body
        .get("hits")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::malformed(BACKEND, body.to_string()))?;

    let mut ids = Vec::with_capacity(hits.len());
    let mut documents = Vec::with_capacity(hits.len());
    for hit in hits {
        let hit = Hit::deserialize(hit)
            .map_err(|_| Error::malformed(BACKEND, hit.to_string()))?;
        ids.push(hit.id);
        documents.push(hit.text);
    }
    Ok((ids, documents))
}

fn parse_index_names(body: &Value) -> Result<Vec<String>> {
    let results = body
        .get("results")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::malformed(BACKEND, body.to_string()))?;

    Ok(results
        .iter()
        .filter_map(|r| r.get("indexName").and_then(Value::as_str))
        .map(str::to_string)
        .collect())
}

impl VectorStore for MarqoStore {
    fn create_collection(&self, name: &str) -> Result<()> {
        if self.has_collection(name)? {
            return Ok(());
        }

        let response = self
            .client
            .post(self.url(&format!("indexes/{name}")))
            .json(&json!({ "model": self.model }))
            .send()?;
        success(response)?;
        tracing::info!(index = name, model = %self.model, "created marqo index");
        Ok(())
    }

    fn delete_collection(&self, name: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("indexes/{name}")))
            .send()?;
        if response.status() == StatusCode::NOT_FOUND {
            tracing::debug!(index = name, "marqo index already absent");
            return Ok(());
        }
        success(response)?;
        Ok(())
    }

    fn has_collection(&self, name: &str) -> Result<bool> {
        let response = self.client.get(self.url("indexes")).send()?;
        let body: Value = success(response)?.json()?;
        Ok(parse_index_names(&body)?.iter().any(|n| n == name))
    }

    fn upsert(
        &self,
        collection: &str,
        ids: &[String],
        documents: &[String],
    ) -> Result<()> {
        let docs: Vec<Value> = ids
            .iter()
            .zip(documents)
            .map(|(id, text)| json!({ "_id": id, "text": text }))
            .collect();

        let response = self
            .client
            .post(self.url(&format!("indexes/{collection}/documents")))
            .json(&json!({ "documents": docs, "tensorFields": ["text"] }))
            .send()?;
        let body: Value = Self::check(collection, response)?.json()?;

        if body.get("errors").and_then(Value::as_bool) == Some(true) {
            return Err(Error::malformed(BACKEND, body.to_string()));
        }
        Ok(())
    }

    fn query(&self, collection: &str, text: &str, k: usize) -> Result<QueryResult> {
        let response = self
            .client
            .post(self.url(&format!("indexes/{collection}/search")))
            .json(&json!({ "q": text, "limit": k, "showHighlights": false }))
            .send()?;
        let body: Value = Self::check(collection, response)?.json()?;

        let (ids, documents) = parse_hits(&body)?;
        Ok(QueryResult::single(ids, documents))
    }
}
