use std::{cell::RefCell, rc::Rc};

use candle_core::Tensor;

use crate::{
    error::Result,
    model_manager::{ModelManager, SharedModel},
};

/// Second-stage relevance scoring of retrieved candidates.
pub trait Reranker {
    /// Score each candidate against `query`; scores come back in input order.
    fn compute_score(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>>;
}

/// Reranks with a ColBERT model using MaxSim late interaction.
#[derive(Debug)]
pub struct ColbertReranker {
    model: SharedModel,
}

impl ColbertReranker {
    pub fn new(model: ModelManager) -> Self {
        Self::shared(Rc::new(RefCell::new(model)))
    }

    /// Rerank with a model that may also serve first-stage recall.
    pub fn shared(model: SharedModel) -> Self {
        Self { model }
    }
}

impl Reranker for ColbertReranker {
    fn compute_score(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let mut model = self.model.borrow_mut();
        let query_embedding = model.encode_query(query)?;
        let doc_embeddings = model.encode_documents(candidates)?;

        (0..candidates.len())
            .map(|i| {
                let doc = doc_embeddings.get(i).map_err(map_candle_err)?;
                maxsim(&query_embedding, &doc)
            })
            .collect()
    }
}

/// Compute the MaxSim score between a query embedding and a document embedding.
///
/// query_embedding: [Q, D] where Q = query tokens, D = embedding dimension
/// doc_embedding: [T, D] where T = document tokens, D = embedding dimension
///
/// MaxSim = sum over query tokens of max(query_token . doc_token for all doc tokens)
fn maxsim(query_embedding: &Tensor, doc_embedding: &Tensor) -> Result<f32> {
    // [Q, T] = query_emb @ doc_emb^T
    let sim_matrix = query_embedding
        .matmul(&doc_embedding.t().map_err(map_candle_err)?)
        .map_err(map_candle_err)?;

    // Best document token per query token.
    let row_maxes = sim_matrix.max(1).map_err(map_candle_err)?;

    let score = row_maxes
        .sum_all()
        .map_err(map_candle_err)?
        .to_scalar::<f32>()
        .map_err(map_candle_err)?;

    Ok(score)
}

fn map_candle_err(e: candle_core::Error) -> crate::error::Error {
    crate::error::Error::Model(format!("tensor computation error: {e}"))
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    fn make_tensor(data: &[f32], shape: (usize, usize)) -> Tensor {
        Tensor::from_vec(data.to_vec(), shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn maxsim_identical_vectors() {
        let q = make_tensor(&[1.0, 0.0, 0.0], (1, 3));
        let d = make_tensor(&[1.0, 0.0, 0.0], (1, 3));
        let score = maxsim(&q, &d).unwrap();
        assert!((score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn maxsim_orthogonal_vectors() {
        let q = make_tensor(&[1.0, 0.0, 0.0], (1, 3));
        let d = make_tensor(&[0.0, 1.0, 0.0], (1, 3));
        let score = maxsim(&q, &d).unwrap();
        assert!(score.abs() < 1e-6);
    }

    #[test]
    fn maxsim_multiple_query_tokens() {
        // Each query token finds an exact match among the doc tokens, so the
        // row maxes are [1.0, 1.0].
        let q = make_tensor(&[1.0, 0.0, 0.0, 1.0], (2, 2));
        let d = make_tensor(&[1.0, 0.0, 0.0, 1.0, 0.5, 0.5], (3, 2));
        let score = maxsim(&q, &d).unwrap();
        assert!((score - 2.0).abs() < 1e-6);
    }

    #[test]
    fn maxsim_prefers_closer_document() {
        let q = make_tensor(&[1.0, 0.0], (1, 2));
        let near = make_tensor(&[0.9, 0.1, 0.0, 1.0], (2, 2));
        let far = make_tensor(&[0.1, 0.9], (1, 2));

        assert!(maxsim(&q, &near).unwrap() > maxsim(&q, &far).unwrap());
    }

    #[test]
    fn no_candidates_skips_model_load() {
        let reranker = ColbertReranker::new(ModelManager::new("unused/model"));
        let scores = reranker.compute_score("anything", &[]).unwrap();

        assert!(scores.is_empty());
        assert!(!reranker.model.borrow().is_loaded());
    }
}
