//! Vector index: one embedding per document, brute-force cosine top-k.
//!
//! The embedding model is injected; this module only stores vectors and
//! ranks them. A build either embeds every document or fails as a whole.

use std::sync::Arc;
use std::time::Duration;

use crate::embedding::{cosine_similarity, Embedder};
use crate::error::{with_timeout, Result, Text2SqlError};
use crate::models::{Document, RankedResult};

struct StoredVector {
    document: Arc<Document>,
    vector: Vec<f32>,
}

pub struct SemanticIndex {
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
    call_timeout: Duration,
    min_similarity: f64,
    vectors: Option<Vec<StoredVector>>,
}

impl SemanticIndex {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            batch_size: 64,
            call_timeout: Duration::from_secs(30),
            min_similarity: 0.0,
            vectors: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Hits with similarity at or below this value are dropped.
    pub fn with_min_similarity(mut self, min_similarity: f64) -> Self {
        self.min_similarity = min_similarity;
        self
    }

    pub fn model_name(&self) -> &str {
        self.embedder.model_name()
    }

    pub fn is_built(&self) -> bool {
        self.vectors.is_some()
    }

    /// Embed every document. Any failed batch fails the whole build and
    /// leaves the index unbuilt.
    pub async fn build(&mut self, documents: &[Arc<Document>]) -> Result<()> {
        if documents.is_empty() {
            return Err(Text2SqlError::Configuration(
                "cannot build semantic index over an empty corpus".to_string(),
            ));
        }

        let mut stored = Vec::with_capacity(documents.len());
        for batch in documents.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|d| d.content.clone()).collect();
            let vectors = with_timeout(
                "document embedding",
                self.call_timeout,
                self.embedder.embed(&texts),
            )
            .await
            .map_err(|e| {
                Text2SqlError::Configuration(format!("semantic index build failed: {}", e))
            })?;

            if vectors.len() != batch.len() {
                return Err(Text2SqlError::Configuration(format!(
                    "embedder returned {} vectors for {} documents",
                    vectors.len(),
                    batch.len()
                )));
            }
            for (document, vector) in batch.iter().zip(vectors) {
                stored.push(StoredVector {
                    document: document.clone(),
                    vector,
                });
            }
        }

        tracing::info!(
            documents = stored.len(),
            model = self.embedder.model_name(),
            "semantic index built"
        );
        self.vectors = Some(stored);
        Ok(())
    }

    /// Embed `text` and return the `top_k` most similar documents.
    ///
    /// Ties keep corpus order. Embedding failure surfaces as
    /// [`Text2SqlError::Retrieval`] so the caller can fall back to lexical.
    pub async fn query(&self, text: &str, top_k: usize) -> Result<Vec<RankedResult>> {
        let vectors = self.vectors.as_ref().ok_or(Text2SqlError::NotReady("semantic"))?;
        if text.trim().is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let query_vec = with_timeout(
            "query embedding",
            self.call_timeout,
            self.embedder.embed(&[text.to_string()]),
        )
        .await
        .map_err(|e| Text2SqlError::Retrieval(format!("semantic: {}", e)))?
        .into_iter()
        .next()
        .ok_or_else(|| Text2SqlError::Retrieval("semantic: empty embedding response".into()))?;

        let mut scored: Vec<(usize, f64)> = vectors
            .iter()
            .enumerate()
            .map(|(pos, sv)| (pos, cosine_similarity(&query_vec, &sv.vector) as f64))
            .filter(|(_, sim)| *sim > self.min_similarity)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .map(|(pos, sim)| RankedResult::semantic(vectors[pos].document.clone(), sim))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::freeze;
    use crate::embedding::HashEmbedder;
    use async_trait::async_trait;

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        fn model_name(&self) -> &str {
            "failing"
        }
        fn dims(&self) -> usize {
            4
        }
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Err(Text2SqlError::Model("boom".into()))
        }
    }

    fn docs() -> Arc<[Arc<Document>]> {
        freeze(vec![
            Document::new("t", "status", "operational status of the plant"),
            Document::new("t", "geo", "latitude and longitude of sites"),
            Document::new("t", "status_copy", "operational status of the plant"),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn test_query_before_build_is_not_ready() {
        let index = SemanticIndex::new(Arc::new(HashEmbedder::new(64)));
        assert!(matches!(
            index.query("x", 1).await,
            Err(Text2SqlError::NotReady("semantic"))
        ));
    }

    #[tokio::test]
    async fn test_ranks_by_similarity_with_stable_ties() {
        let mut index = SemanticIndex::new(Arc::new(HashEmbedder::new(128))).with_batch_size(2);
        index.build(&docs()).await.unwrap();
        let results = index.query("operational status", 3).await.unwrap();
        assert_eq!(results[0].id(), "t/status");
        assert_eq!(results[1].id(), "t/status_copy");
        assert!((results[0].score - results[1].score).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_build_failure_leaves_index_unbuilt() {
        let mut index = SemanticIndex::new(Arc::new(FailingEmbedder));
        assert!(index.build(&docs()).await.is_err());
        assert!(!index.is_built());
    }

    #[tokio::test]
    async fn test_min_similarity_filters_unrelated() {
        let mut index = SemanticIndex::new(Arc::new(HashEmbedder::new(512)));
        index.build(&docs()).await.unwrap();
        let results = index.query("zzqx", 3).await.unwrap();
        assert!(results.iter().all(|r| r.score > 0.0));
    }
}
