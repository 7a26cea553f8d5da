//! ColBERT token embeddings used for first-stage semantic recall.
//!
//! Sections are encoded once at upsert time and persisted as raw matrices;
//! queries are encoded on demand and compared with MaxSim, so a question
//! that shares no words with a section can still recall it.

use candle_core::Tensor;

use crate::{
    error::{Error, Result},
    model_manager::SharedModel,
};

/// Header size: 4 bytes token count + 4 bytes dimension.
const HEADER_SIZE: usize = 8;

/// A per-token embedding matrix.
///
/// Serialized as:
/// - 4 bytes: token count T (u32 LE)
/// - 4 bytes: embedding dimension D (u32 LE)
/// - T * D * 4 bytes: f32 values in row-major order
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingMatrix {
    pub num_tokens: u32,
    pub dimension: u32,
    /// Flat row-major values: `data[token_idx * dimension + dim_idx]`.
    pub data: Vec<f32>,
}

impl EmbeddingMatrix {
    /// Build a matrix from flat row-major values.
    ///
    /// Returns `None` when `data` is not a whole number of rows.
    pub fn from_rows(dimension: u32, data: Vec<f32>) -> Option<Self> {
        let dim = dimension as usize;
        if dim == 0 || data.len() % dim != 0 {
            return None;
        }
        Some(Self {
            num_tokens: u32::try_from(data.len() / dim).ok()?,
            dimension,
            data,
        })
    }

    /// Get the embedding vector for a specific token.
    pub fn token_embedding(&self, token_idx: u32) -> &[f32] {
        let start = (token_idx * self.dimension) as usize;
        let end = start + self.dimension as usize;
        &self.data[start..end]
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes =
            Vec::with_capacity(HEADER_SIZE + std::mem::size_of_val(self.data.as_slice()));
        bytes.extend_from_slice(&self.num_tokens.to_le_bytes());
        bytes.extend_from_slice(&self.dimension.to_le_bytes());
        bytes.extend_from_slice(bytemuck::cast_slice(&self.data));
        bytes
    }

    /// Decode a stored matrix; truncated or inconsistent entries yield `None`.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let header = bytes.get(..HEADER_SIZE)?;
        let num_tokens = u32::from_le_bytes(header[0..4].try_into().ok()?);
        let dimension = u32::from_le_bytes(header[4..8].try_into().ok()?);

        let values = &bytes[HEADER_SIZE..];
        if values.len() != (num_tokens as usize) * (dimension as usize) * 4 {
            return None;
        }

        // Stored values carry no alignment guarantee.
        let data = values
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned::<f32>)
            .collect();

        Some(Self {
            num_tokens,
            dimension,
            data,
        })
    }

    /// MaxSim late interaction: for every query token, the best dot product
    /// against any token of `self`, summed.
    pub fn maxsim(&self, query: &EmbeddingMatrix) -> f32 {
        if self.dimension != query.dimension || self.num_tokens == 0 {
            return 0.0;
        }

        (0..query.num_tokens)
            .map(|q| {
                let q = query.token_embedding(q);
                (0..self.num_tokens)
                    .map(|t| dot(q, self.token_embedding(t)))
                    .fold(f32::NEG_INFINITY, f32::max)
            })
            .sum()
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Turns text into token embedding matrices.
pub trait Embedder {
    /// Encode each document; matrices come back in input order.
    fn embed_documents(&self, texts: &[String]) -> Result<Vec<EmbeddingMatrix>>;

    fn embed_query(&self, text: &str) -> Result<EmbeddingMatrix>;
}

/// Embeds with the ColBERT model behind a [`SharedModel`].
#[derive(Debug, Clone)]
pub struct ColbertEmbedder {
    model: SharedModel,
}

impl ColbertEmbedder {
    pub fn new(model: SharedModel) -> Self {
        Self { model }
    }
}

impl Embedder for ColbertEmbedder {
    fn embed_documents(&self, texts: &[String]) -> Result<Vec<EmbeddingMatrix>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        // [batch_size, num_tokens, dimension]
        let embeddings = self.model.borrow_mut().encode_documents(texts)?;
        let (batch_size, _num_tokens, _dimension) =
            embeddings.dims3().map_err(|e| {
                Error::Model(format!("unexpected embedding tensor shape: {e}"))
            })?;
        if batch_size != texts.len() {
            return Err(Error::Model(format!(
                "encoded {batch_size} embeddings for {} documents",
                texts.len()
            )));
        }

        (0..batch_size)
            .map(|i| {
                let doc = embeddings.get(i).map_err(|e| {
                    Error::Model(format!(
                        "failed to extract embedding for doc index {i}: {e}"
                    ))
                })?;
                tensor_to_matrix(&doc)
            })
            .collect()
    }

    fn embed_query(&self, text: &str) -> Result<EmbeddingMatrix> {
        let embedding = self.model.borrow_mut().encode_query(text)?;
        tensor_to_matrix(&embedding)
    }
}

/// Convert a 2D tensor `[tokens, dimension]` into a matrix.
fn tensor_to_matrix(tensor: &Tensor) -> Result<EmbeddingMatrix> {
    let (_tokens, dimension) = tensor.dims2().map_err(|e| {
        Error::Model(format!("unexpected embedding tensor shape: {e}"))
    })?;
    let flat = tensor
        .flatten_all()
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(|e| {
            Error::Model(format!("failed to convert tensor to f32: {e}"))
        })?;

    let dimension = u32::try_from(dimension)
        .map_err(|_| Error::Model(format!("embedding dimension {dimension} too large")))?;
    EmbeddingMatrix::from_rows(dimension, flat)
        .ok_or_else(|| Error::Model("embedding is not a whole number of rows".to_string()))
}
