//! Answer generation grounded in retrieved sections.

use crate::{
    error::{Error, Result},
    search::DocSource,
    settings::Settings,
};

pub mod ollama;

pub use ollama::OllamaGenerator;

/// Lazily produced answer text, one fragment per item.
pub type Fragments<'a> = Box<dyn Iterator<Item = Result<String>> + 'a>;

/// Text-generation capability.
pub trait Generator {
    /// Start generating a completion for `prompt`.
    fn generate(&self, prompt: &str) -> Result<Fragments<'_>>;
}

/// Build the grounding prompt for `question` from `sources`.
pub fn build_prompt(sources: &[DocSource], question: &str) -> String {
    let sources = sources
        .iter()
        .map(|s| format!("{}:\n {}", s.source, s.text))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Given the following extracted parts of a long document (\"SOURCES\") \
         and a question (\"QUESTION\"). Create a final answer one paragraph \
         long. Answer the question and cite the sources in the answer. Don't \
         try to make up an answer and use the text in the SOURCES only for \
         the answer. If you don't know the answer, just say that you don't \
         know.\n\
         QUESTION: {question}\n\
         =========\n\
         SOURCES:\n\
         {sources}"
    )
}

/// Stream an answer to `question` grounded in `sources`.
///
/// Fragments are passed through exactly as the generator yields them.
pub fn answer<'g, G: Generator + ?Sized>(
    generator: &'g G,
    sources: &[DocSource],
    question: &str,
) -> Result<Fragments<'g>> {
    let prompt = build_prompt(sources, question);
    tracing::debug!(sources = sources.len(), chars = prompt.len(), "prompting");
    generator.generate(&prompt)
}

macro_rules! delegate_generator {
    ($self:expr, |$g:ident| $expr:expr) => {
        match $self {
            AnyGenerator::Ollama($g) => $expr,
        }
    };
}

/// A generation backend selected at startup.
#[derive(Debug)]
pub enum AnyGenerator {
    Ollama(OllamaGenerator),
}

impl Generator for AnyGenerator {
    fn generate(&self, prompt: &str) -> Result<Fragments<'_>> {
        delegate_generator!(self, |g| g.generate(prompt))
    }
}

/// Resolve the generation backend named in `settings.llm`.
pub fn open_generator(settings: &Settings) -> Result<AnyGenerator> {
    match settings.llm.as_str() {
        "ollama" => Ok(AnyGenerator::Ollama(OllamaGenerator::new(
            &settings.ollama_url,
            &settings.ollama_model,
        )?)),
        other => Err(Error::UnknownBackend {
            kind: "llm",
            name: other.to_string(),
        }),
    }
}
