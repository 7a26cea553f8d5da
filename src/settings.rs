//! Runtime settings: defaults, then `settings.toml`, then `ASK_*` variables.

use std::{collections::BTreeMap, path::Path};

use serde::Deserialize;

use crate::{
    error::{Error, Result},
    model_manager::DEFAULT_MODEL_ID,
};

const ENV_PREFIX: &str = "ASK_";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Generation backend name.
    pub llm: String,
    /// Store backend name.
    pub store: String,

    pub ollama_url: String,
    pub ollama_model: String,

    pub marqo_url: String,
    pub marqo_model: String,

    /// Late-interaction model used to rerank retrieved sections. The local
    /// store also embeds with it for semantic recall.
    pub reranker_model: String,
    /// Fuse embedding similarity into the local store's first stage.
    pub semantic_recall: bool,

    /// Files indexed by `ask create`, relative to the repository root.
    pub glob: String,
    /// Results scoring at or below this value are dropped.
    pub min_score: f32,

    // Keys this version does not know; reported when loading and ignored.
    #[serde(flatten)]
    unknown: BTreeMap<String, toml::Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            llm: "ollama".to_string(),
            store: "local".to_string(),
            ollama_url: "http://localhost:11434".to_string(),
            ollama_model: "llama3.1".to_string(),
            marqo_url: "http://localhost:8882".to_string(),
            marqo_model: "hf/all_datasets_v4_MiniLM-L6".to_string(),
            reranker_model: DEFAULT_MODEL_ID.to_string(),
            semantic_recall: true,
            glob: "**/*.md".to_string(),
            min_score: 0.0,
            unknown: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Load settings from `path` (if it exists) and the process environment.
    pub fn load(path: &Path) -> Result<Self> {
        let mut settings = Self::from_file(path)?;
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// Parse a settings file, falling back to defaults when it is missing.
    pub fn from_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_toml(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let settings: Self = toml::from_str(contents)?;
        for key in settings.unknown_keys() {
            tracing::warn!(key, "ignoring unknown settings key");
        }
        Ok(settings)
    }

    /// Keys present in the settings file that no field consumed.
    pub fn unknown_keys(&self) -> impl Iterator<Item = &str> {
        self.unknown.keys().map(String::as_str)
    }

    /// Override fields from `ASK_<FIELD>` variables resolved via `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        let strings = [
            ("LLM", &mut self.llm),
            ("STORE", &mut self.store),
            ("OLLAMA_URL", &mut self.ollama_url),
            ("OLLAMA_MODEL", &mut self.ollama_model),
            ("MARQO_URL", &mut self.marqo_url),
            ("MARQO_MODEL", &mut self.marqo_model),
            ("RERANKER_MODEL", &mut self.reranker_model),
            ("GLOB", &mut self.glob),
        ];
        for (name, field) in strings {
            if let Some(value) = var(name) {
                *field = value;
            }
        }

        if let Some(value) = var("MIN_SCORE") {
            self.min_score = value.trim().parse().map_err(|_| {
                Error::Config(format!(
                    "{ENV_PREFIX}MIN_SCORE is not a number: {value}"
                ))
            })?;
        }

        if let Some(value) = var("SEMANTIC_RECALL") {
            self.semantic_recall = parse_flag(&value).ok_or_else(|| {
                Error::Config(format!(
                    "{ENV_PREFIX}SEMANTIC_RECALL is not a boolean: {value}"
                ))
            })?;
        }

        Ok(())
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
