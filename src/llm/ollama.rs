//! Ollama generation backend (`/api/generate`, streamed NDJSON).

use std::{
    io::{BufRead, BufReader},
    time::Duration,
};

use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::json;

use super::{Fragments, Generator};
use crate::error::{Error, Result};

const BACKEND: &str = "ollama";

#[derive(Debug, Clone)]
pub struct OllamaGenerator {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaGenerator {
    pub fn new(base_url: &str, model: &str) -> Result<Self> {
        Ok(Self {
            // No overall deadline; completions stream for as long as needed.
            client: Client::builder().timeout(None::<Duration>).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }
}

impl Generator for OllamaGenerator {
    fn generate(&self, prompt: &str) -> Result<Fragments<'_>> {
        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&json!({
                "model": self.model,
                "prompt": prompt,
                "stream": true,
            }))
            .send()?;
        if !response.status().is_success() {
            return Err(Error::upstream(BACKEND, response));
        }

        tracing::debug!(model = %self.model, "streaming completion");
        Ok(Box::new(NdjsonFragments::new(BufReader::new(response))))
    }
}

#[derive(Debug, Deserialize)]
struct Chunk {
    response: Option<String>,
    error: Option<String>,
    #[serde(default)]
    done: bool,
}

/// Reads one JSON object per line and yields its `response` text.
///
/// Ends after the object with `done: true` or at end of input. Fragments
/// are yielded as sent, empty ones included; anything unparsable ends the
/// stream with an error carrying the offending line.
#[derive(Debug)]
pub struct NdjsonFragments<R> {
    reader: R,
    line: String,
    finished: bool,
}

impl<R: BufRead> NdjsonFragments<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            finished: false,
        }
    }

    fn fail(&mut self, err: Error) -> Option<Result<String>> {
        self.finished = true;
        Some(Err(err))
    }
}

impl<R: BufRead> Iterator for NdjsonFragments<R> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Ok(0) => self.finished = true,
                Ok(_) => {}
                Err(e) => return self.fail(e.into()),
            }
            if self.finished {
                break;
            }

            let line = self.line.trim();
            if line.is_empty() {
                continue;
            }

            let chunk: Chunk = match serde_json::from_str(line) {
                Ok(chunk) => chunk,
                Err(_) => {
                    let payload = line.to_string();
                    return self.fail(Error::malformed(BACKEND, payload));
                }
            };

            if chunk.error.is_some() {
                let payload = line.to_string();
                return self.fail(Error::malformed(BACKEND, payload));
            }

            self.finished = chunk.done;
            match chunk.response {
                Some(text) => return Some(Ok(text)),
                None if chunk.done => {}
                None => {
                    let payload = line.to_string();
                    return self.fail(Error::malformed(BACKEND, payload));
                }
            }
        }
        None
    }
}
