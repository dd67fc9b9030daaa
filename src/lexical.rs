//! BM25 (Okapi) keyword index over the metadata corpus.
//!
//! Scoring follows the classic Okapi formulation:
//!
//! ```text
//! idf(t)      = ln((N - n_t + 0.5) / (n_t + 0.5))
//! score(d, q) = Σ_{t ∈ q} idf(t) · tf·(k1 + 1) / (tf + k1·(1 - b + b·|d|/avgdl))
//! ```
//!
//! Terms that occur in more than half of the corpus would get a negative
//! idf; those are floored at `epsilon × mean(idf)` so frequent terms still
//! contribute a little instead of pushing documents down.
//!
//! Only documents with a strictly positive score are returned.
//!
//! Very small corpora are a blind spot of this formula. A term found in
//! exactly half of the documents gets idf 0. In a one-document corpus every
//! idf is negative, so the mean and its floor are negative too. Such
//! corpora can return nothing even when the query shares tokens with a
//! document. From three documents on, a term in a single document scores.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, Text2SqlError};
use crate::models::{Document, RankedResult};

/// BM25 tuning parameters.
#[derive(Debug, Clone, Copy)]
pub struct Bm25Params {
    pub k1: f64,
    pub b: f64,
    /// Floor for negative idf, as a fraction of the mean idf.
    pub epsilon: f64,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self {
            k1: 1.5,
            b: 0.75,
            epsilon: 0.25,
        }
    }
}

/// Lowercase and split on anything that is not alphanumeric or `_`.
///
/// Applied identically to corpus and queries.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

struct IndexedDoc {
    document: Arc<Document>,
    term_freqs: HashMap<String, u32>,
    len: usize,
}

struct Built {
    docs: Vec<IndexedDoc>,
    idf: HashMap<String, f64>,
    avgdl: f64,
}

/// Keyword index. Created empty, populated once by [`LexicalIndex::build`],
/// then shared read-only.
pub struct LexicalIndex {
    params: Bm25Params,
    built: Option<Built>,
}

impl LexicalIndex {
    pub fn new(params: Bm25Params) -> Self {
        Self {
            params,
            built: None,
        }
    }

    /// Tokenize the corpus and compute document frequencies.
    ///
    /// Fails with [`Text2SqlError::Configuration`] on an empty corpus.
    pub fn build(&mut self, documents: &[Arc<Document>]) -> Result<()> {
        if documents.is_empty() {
            return Err(Text2SqlError::Configuration(
                "cannot build lexical index over an empty corpus".to_string(),
            ));
        }

        let mut docs = Vec::with_capacity(documents.len());
        let mut doc_freq: HashMap<String, usize> = HashMap::new();
        let mut total_len = 0usize;

        for document in documents {
            let tokens = tokenize(&document.content);
            let mut term_freqs: HashMap<String, u32> = HashMap::new();
            for t in &tokens {
                *term_freqs.entry(t.clone()).or_insert(0) += 1;
            }
            for term in term_freqs.keys() {
                *doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
            total_len += tokens.len();
            docs.push(IndexedDoc {
                document: document.clone(),
                term_freqs,
                len: tokens.len(),
            });
        }

        let n = docs.len() as f64;
        let mut idf: HashMap<String, f64> = doc_freq
            .iter()
            .map(|(term, &df)| {
                let df = df as f64;
                (term.clone(), ((n - df + 0.5) / (df + 0.5)).ln())
            })
            .collect();

        let mean_idf = idf.values().sum::<f64>() / idf.len().max(1) as f64;
        let floor = self.params.epsilon * mean_idf;
        for value in idf.values_mut() {
            if *value < 0.0 {
                *value = floor;
            }
        }

        let avgdl = if total_len == 0 {
            1.0
        } else {
            total_len as f64 / n
        };

        self.built = Some(Built { docs, idf, avgdl });
        Ok(())
    }

    pub fn is_built(&self) -> bool {
        self.built.is_some()
    }

    pub fn len(&self) -> usize {
        self.built.as_ref().map(|b| b.docs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Top `top_k` documents for `text`, best first.
    ///
    /// Equal scores keep corpus order. No token overlap yields an empty list.
    pub fn query(&self, text: &str, top_k: usize) -> Result<Vec<RankedResult>> {
        let built = self.built.as_ref().ok_or(Text2SqlError::NotReady("lexical"))?;
        let terms = tokenize(text);
        if terms.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let Bm25Params { k1, b, .. } = self.params;
        let mut scored: Vec<(usize, f64)> = built
            .docs
            .iter()
            .enumerate()
            .map(|(pos, doc)| {
                let norm = 1.0 - b + b * doc.len as f64 / built.avgdl;
                let score: f64 = terms
                    .iter()
                    .map(|t| {
                        let tf = doc.term_freqs.get(t).copied().unwrap_or(0) as f64;
                        if tf == 0.0 {
                            return 0.0;
                        }
                        let idf = built.idf.get(t).copied().unwrap_or(0.0);
                        idf * tf * (k1 + 1.0) / (tf + k1 * norm)
                    })
                    .sum();
                (pos, score)
            })
            .filter(|(_, score)| *score > 0.0)
            .collect();

        // sort_by is stable: ties stay in corpus order
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .map(|(pos, score)| RankedResult::lexical(built.docs[pos].document.clone(), score))
            .collect())
    }
}

impl Default for LexicalIndex {
    fn default() -> Self {
        Self::new(Bm25Params::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::{builtin_documents, freeze};

    fn built_index() -> LexicalIndex {
        let docs = freeze(builtin_documents()).unwrap();
        let mut index = LexicalIndex::default();
        index.build(&docs).unwrap();
        index
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("StatusId = 3, means Operational!"),
            vec!["statusid", "3", "means", "operational"]
        );
        assert_eq!(tokenize("nuclear_power_plants"), vec!["nuclear_power_plants"]);
        assert!(tokenize("  ?! ").is_empty());
    }

    #[test]
    fn test_query_before_build_is_not_ready() {
        let index = LexicalIndex::default();
        assert!(matches!(
            index.query("plants", 3),
            Err(Text2SqlError::NotReady("lexical"))
        ));
    }

    #[test]
    fn test_build_on_empty_corpus_fails() {
        let mut index = LexicalIndex::default();
        assert!(matches!(
            index.build(&[]),
            Err(Text2SqlError::Configuration(_))
        ));
    }

    #[test]
    fn test_operational_rule_ranks_first() {
        let index = built_index();
        let results = index
            .query("How many operational nuclear power plants are there?", 3)
            .unwrap();
        assert!(!results.is_empty());
        assert!(results
            .iter()
            .any(|r| r.id() == "nuclear_power_plant_status_types/operational_definition"));
    }

    #[test]
    fn test_scores_non_increasing() {
        let index = built_index();
        let results = index.query("capacity status construction country", 10).unwrap();
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn test_zero_overlap_is_empty() {
        let index = built_index();
        assert!(index.query("zzqx flurble wibble", 5).unwrap().is_empty());
        assert!(index.query("", 5).unwrap().is_empty());
    }

    #[test]
    fn test_top_k_larger_than_corpus_returns_all_scored() {
        let index = built_index();
        let results = index.query("capacity", 100).unwrap();
        assert!(results.len() <= index.len());
        assert!(results.iter().all(|r| r.score > 0.0));
    }

    #[test]
    fn test_deterministic() {
        let index = built_index();
        let a: Vec<String> = index
            .query("reactor types pwr", 5)
            .unwrap()
            .iter()
            .map(|r| r.id().to_string())
            .collect();
        let b: Vec<String> = index
            .query("reactor types pwr", 5)
            .unwrap()
            .iter()
            .map(|r| r.id().to_string())
            .collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_frequent_term_floor_keeps_score_positive() {
        let docs = freeze(vec![
            Document::new("t", "a", "plant alpha"),
            Document::new("t", "b", "plant beta"),
            Document::new("t", "c", "plant gamma"),
        ])
        .unwrap();
        let mut index = LexicalIndex::default();
        index.build(&docs).unwrap();
        // "plant" is in every document: its raw idf is negative and gets floored.
        let results = index.query("alpha plant", 3).unwrap();
        assert_eq!(results[0].id(), "t/a");
    }

    fn index_over(contents: &[&str]) -> LexicalIndex {
        let docs = freeze(
            contents
                .iter()
                .enumerate()
                .map(|(i, c)| Document::new("t", &format!("d{}", i), c))
                .collect(),
        )
        .unwrap();
        let mut index = LexicalIndex::default();
        index.build(&docs).unwrap();
        index
    }

    #[test]
    fn test_tiny_corpora_score_nothing() {
        // one document: every idf is negative, floor included
        let one = index_over(&["operational plants"]);
        assert!(one.query("operational", 5).unwrap().is_empty());

        // two documents: a term in one of them sits at idf 0
        let two = index_over(&["operational plants", "shutdown reactors"]);
        assert!(two.query("operational", 5).unwrap().is_empty());

        let three = index_over(&["operational plants", "shutdown reactors", "planned units"]);
        let results = three.query("operational", 5).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id(), "t/d0");
    }
}
