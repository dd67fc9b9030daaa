//! Hybrid retrieval: lexical and semantic rankings fused into one list.
//!
//! # Fusion Algorithm
//!
//! 1. Fetch `candidate_multiplier × top_k` candidates from each index.
//! 2. Score each candidate by its rank position: in a list of length `n`,
//!    position `i` (0-based) scores `(n - i) / n`, so every list maps onto
//!    `(0, 1]` regardless of the raw score scale.
//! 3. Merge by document id. A document in both lists sums its two rank
//!    scores and is tagged `both`; otherwise it keeps its single rank score
//!    and source tag.
//! 4. Stable sort by fused score (desc). Ties keep lexical order first,
//!    then semantic-only documents in semantic order.
//! 5. Truncate to `top_k`.
//!
//! If the semantic index is missing or fails at query time the retriever
//! degrades to lexical-only results with `semantic_count = 0`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{EmbeddingConfig, RetrievalConfig};
use crate::embedding::Embedder;
use crate::error::{Result, Text2SqlError};
use crate::lexical::{Bm25Params, LexicalIndex};
use crate::models::{Document, RankedResult, RetrievalSource, RetrievalStats};
use crate::semantic::SemanticIndex;

pub struct HybridRetriever {
    documents: Arc<[Arc<Document>]>,
    lexical: LexicalIndex,
    semantic: Option<SemanticIndex>,
    candidate_multiplier: usize,
}

impl HybridRetriever {
    /// Assemble a retriever from already-built indices.
    pub fn new(
        documents: Arc<[Arc<Document>]>,
        lexical: LexicalIndex,
        semantic: Option<SemanticIndex>,
        candidate_multiplier: usize,
    ) -> Self {
        Self {
            documents,
            lexical,
            semantic,
            candidate_multiplier: candidate_multiplier.max(1),
        }
    }

    /// Build both indices over `documents`.
    ///
    /// A lexical build failure is fatal. A semantic build failure is logged
    /// and leaves the retriever in lexical-only mode.
    pub async fn build(
        documents: Arc<[Arc<Document>]>,
        retrieval: &RetrievalConfig,
        embedding: &EmbeddingConfig,
        embedder: Option<Arc<dyn Embedder>>,
        call_timeout: Duration,
    ) -> Result<Self> {
        let mut lexical = LexicalIndex::new(Bm25Params {
            k1: retrieval.bm25_k1,
            b: retrieval.bm25_b,
            ..Bm25Params::default()
        });
        lexical.build(&documents)?;

        let semantic = match embedder {
            Some(embedder) => {
                let mut index = SemanticIndex::new(embedder)
                    .with_batch_size(embedding.batch_size)
                    .with_call_timeout(call_timeout)
                    .with_min_similarity(retrieval.min_similarity);
                match index.build(&documents).await {
                    Ok(()) => Some(index),
                    Err(e) => {
                        tracing::warn!(error = %e, "semantic index unavailable, using lexical retrieval only");
                        None
                    }
                }
            }
            None => None,
        };

        Ok(Self::new(
            documents,
            lexical,
            semantic,
            retrieval.candidate_multiplier,
        ))
    }

    pub fn documents(&self) -> &[Arc<Document>] {
        &self.documents
    }

    pub fn semantic_enabled(&self) -> bool {
        self.semantic.as_ref().map(|s| s.is_built()).unwrap_or(false)
    }

    /// Retrieve the `top_k` most relevant documents for `query`.
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<(Vec<RankedResult>, RetrievalStats)> {
        if query.trim().is_empty() || top_k == 0 {
            return Ok((Vec::new(), RetrievalStats::default()));
        }
        let candidate_k = top_k * self.candidate_multiplier;

        let lexical = self.lexical.query(query, candidate_k);

        let semantic = match &self.semantic {
            Some(index) => index.query(query, candidate_k).await,
            None => Ok(Vec::new()),
        };

        let (lexical, semantic) = match (lexical, semantic) {
            (Ok(l), Ok(s)) => (l, s),
            (Ok(l), Err(e)) => {
                tracing::warn!(error = %e, "semantic retrieval failed, degrading to lexical");
                (l, Vec::new())
            }
            (Err(e), Ok(s)) if self.semantic.is_some() => {
                tracing::warn!(error = %e, "lexical retrieval failed, degrading to semantic");
                (Vec::new(), s)
            }
            (Err(l), Ok(_)) => return Err(l),
            (Err(l), Err(s)) => {
                return Err(Text2SqlError::Retrieval(format!(
                    "both indices failed: lexical: {}; {}",
                    l, s
                )))
            }
        };

        let merged = fuse(&lexical, &semantic, top_k);
        let stats = RetrievalStats {
            lexical_count: lexical.len(),
            semantic_count: semantic.len(),
            merged_count: merged.len(),
        };

        tracing::debug!(
            query,
            lexical = stats.lexical_count,
            semantic = stats.semantic_count,
            merged = stats.merged_count,
            "hybrid retrieval"
        );

        Ok((merged, stats))
    }
}

/// Rank-normalized score for position `pos` in a list of `len` items.
fn rank_score(pos: usize, len: usize) -> f64 {
    (len - pos) as f64 / len as f64
}

/// Merge two ranked lists by document id. See the module docs.
pub fn fuse(lexical: &[RankedResult], semantic: &[RankedResult], top_k: usize) -> Vec<RankedResult> {
    let mut merged: Vec<RankedResult> = Vec::with_capacity(lexical.len() + semantic.len());
    let mut by_id: HashMap<String, usize> = HashMap::new();

    for (pos, r) in lexical.iter().enumerate() {
        if by_id.contains_key(r.id()) {
            continue;
        }
        by_id.insert(r.id().to_string(), merged.len());
        merged.push(RankedResult {
            document: r.document.clone(),
            score: rank_score(pos, lexical.len()),
            source: RetrievalSource::Lexical,
            lexical_score: Some(r.score),
            semantic_score: None,
        });
    }

    let mut seen_semantic: HashMap<&str, ()> = HashMap::new();
    for (pos, r) in semantic.iter().enumerate() {
        if seen_semantic.insert(r.id(), ()).is_some() {
            continue;
        }
        let contribution = rank_score(pos, semantic.len());
        match by_id.get(r.id()) {
            Some(&slot) => {
                let entry = &mut merged[slot];
                entry.score += contribution;
                entry.source = RetrievalSource::Both;
                entry.semantic_score = Some(r.score);
            }
            None => {
                by_id.insert(r.id().to_string(), merged.len());
                merged.push(RankedResult {
                    document: r.document.clone(),
                    score: contribution,
                    source: RetrievalSource::Semantic,
                    lexical_score: None,
                    semantic_score: Some(r.score),
                });
            }
        }
    }

    // Stable: equal scores keep insertion order (lexical first, then semantic).
    merged.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    merged.truncate(top_k);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::{builtin_documents, freeze};
    use crate::embedding::HashEmbedder;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn doc(id: &str) -> Arc<Document> {
        Arc::new(Document::new("t", id, id))
    }

    fn lex(ids: &[&str]) -> Vec<RankedResult> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| RankedResult::lexical(doc(id), 10.0 - i as f64))
            .collect()
    }

    fn sem(ids: &[&str]) -> Vec<RankedResult> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| RankedResult::semantic(doc(id), 0.9 - 0.1 * i as f64))
            .collect()
    }

    fn ids(results: &[RankedResult]) -> Vec<String> {
        results.iter().map(|r| r.id().to_string()).collect()
    }

    #[test]
    fn test_rank_score_bounds() {
        assert_eq!(rank_score(0, 1), 1.0);
        assert_eq!(rank_score(0, 4), 1.0);
        assert_eq!(rank_score(3, 4), 0.25);
    }

    #[test]
    fn test_document_in_both_lists_is_boosted() {
        let merged = fuse(&lex(&["a", "b", "c"]), &sem(&["c", "d"]), 10);
        assert_eq!(merged[0].id(), "t/c");
        assert_eq!(merged[0].source, RetrievalSource::Both);
        assert!(merged[0].lexical_score.is_some() && merged[0].semantic_score.is_some());
    }

    #[test]
    fn test_ties_prefer_lexical_order() {
        // a and x both score 1.0 (top of their own list)
        let merged = fuse(&lex(&["a", "b"]), &sem(&["x", "y"]), 4);
        assert_eq!(ids(&merged), vec!["t/a", "t/x", "t/b", "t/y"]);
    }

    #[test]
    fn test_no_duplicates_and_truncated() {
        let merged = fuse(&lex(&["a", "b", "a", "c"]), &sem(&["b", "b", "d"]), 3);
        let unique: HashSet<_> = ids(&merged).into_iter().collect();
        assert_eq!(unique.len(), merged.len());
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn test_fused_scores_non_increasing() {
        let merged = fuse(&lex(&["a", "b", "c", "d"]), &sem(&["d", "e", "a"]), 10);
        for pair in merged.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    async fn retriever(semantic: bool) -> HybridRetriever {
        let docs = freeze(builtin_documents()).unwrap();
        let embedder: Option<Arc<dyn Embedder>> = if semantic {
            Some(Arc::new(HashEmbedder::new(256)))
        } else {
            None
        };
        HybridRetriever::build(
            docs,
            &RetrievalConfig::default(),
            &EmbeddingConfig::default(),
            embedder,
            Duration::from_secs(5),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_repeated_calls_are_identical() {
        let r = retriever(true).await;
        let (a, sa) = r.retrieve("total capacity by country", 5).await.unwrap();
        let (b, sb) = r.retrieve("total capacity by country", 5).await.unwrap();
        assert_eq!(ids(&a), ids(&b));
        assert_eq!(sa, sb);
    }

    #[tokio::test]
    async fn test_lexical_only_matches_lexical_top_k() {
        let r = retriever(false).await;
        assert!(!r.semantic_enabled());
        let (merged, stats) = r.retrieve("reactor capacity status", 3).await.unwrap();
        let lexical_top = r.lexical.query("reactor capacity status", 3).unwrap();
        assert_eq!(ids(&merged), ids(&lexical_top));
        assert_eq!(stats.semantic_count, 0);
        assert_eq!(stats.merged_count, merged.len());
    }

    #[tokio::test]
    async fn test_operational_rule_in_top_three() {
        let r = retriever(true).await;
        let (merged, stats) = r
            .retrieve("How many operational nuclear power plants are there?", 3)
            .await
            .unwrap();
        assert!(ids(&merged)
            .iter()
            .any(|id| id == "nuclear_power_plant_status_types/operational_definition"));
        assert!(stats.lexical_count > 0 && stats.semantic_count > 0);
    }

    #[tokio::test]
    async fn test_nonsense_query_is_empty_not_error() {
        let r = retriever(false).await;
        let (merged, stats) = r.retrieve("zzqx flurble", 5).await.unwrap();
        assert!(merged.is_empty());
        assert_eq!(stats.merged_count, 0);
    }

    /// Hash embeddings for the first `working_calls` calls, errors after.
    struct FlakyEmbedder {
        inner: HashEmbedder,
        working_calls: usize,
        calls: AtomicUsize,
    }

    impl FlakyEmbedder {
        fn new(working_calls: usize) -> Self {
            Self {
                inner: HashEmbedder::new(256),
                working_calls,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        fn model_name(&self) -> &str {
            "flaky"
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) >= self.working_calls {
                return Err(Text2SqlError::Model("embedding endpoint down".into()));
            }
            self.inner.embed(texts).await
        }
    }

    async fn built_semantic(embedder: Arc<dyn Embedder>) -> SemanticIndex {
        let docs = freeze(builtin_documents()).unwrap();
        let mut index = SemanticIndex::new(embedder).with_call_timeout(Duration::from_secs(5));
        index.build(&docs).await.unwrap();
        index
    }

    #[tokio::test]
    async fn test_semantic_query_failure_degrades_to_lexical() {
        // one batch covers the corpus, so only the build call succeeds
        let embedder = Arc::new(FlakyEmbedder::new(1));
        let r = HybridRetriever::build(
            freeze(builtin_documents()).unwrap(),
            &RetrievalConfig::default(),
            &EmbeddingConfig::default(),
            Some(embedder),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(r.semantic_enabled());

        let (merged, stats) = r.retrieve("total capacity by country", 4).await.unwrap();
        let lexical_top = r.lexical.query("total capacity by country", 4).unwrap();
        assert!(!merged.is_empty());
        assert_eq!(ids(&merged), ids(&lexical_top));
        assert_eq!(stats.semantic_count, 0);
        assert!(merged.iter().all(|m| m.source == RetrievalSource::Lexical));
    }

    #[tokio::test]
    async fn test_lexical_failure_degrades_to_semantic() {
        let docs = freeze(builtin_documents()).unwrap();
        let semantic = built_semantic(Arc::new(HashEmbedder::new(256))).await;
        let r = HybridRetriever::new(docs, LexicalIndex::default(), Some(semantic), 2);

        let (merged, stats) = r.retrieve("total capacity by country", 4).await.unwrap();
        assert!(!merged.is_empty());
        assert_eq!(stats.lexical_count, 0);
        assert!(stats.semantic_count > 0);
        assert_eq!(stats.merged_count, merged.len());
        assert!(merged.iter().all(|m| m.source == RetrievalSource::Semantic));
    }

    #[tokio::test]
    async fn test_both_indices_failing_is_retrieval_error() {
        let docs = freeze(builtin_documents()).unwrap();
        let semantic = built_semantic(Arc::new(FlakyEmbedder::new(1))).await;
        let r = HybridRetriever::new(docs, LexicalIndex::default(), Some(semantic), 2);

        let err = r.retrieve("total capacity by country", 4).await.unwrap_err();
        assert!(matches!(err, Text2SqlError::Retrieval(_)));
    }
}
