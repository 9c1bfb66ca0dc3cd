use std::collections::HashMap;
use std::time::Instant;

use anyhow::anyhow;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info};

use crate::embed::EmbeddingProvider;
use crate::error::{EngineError, Result};
use crate::model::QaPair;

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub qa_id: String,
    pub vector: Vec<f32>,
}

/// Immutable snapshot of the corpus and one embedding per question, in load order.
#[derive(Debug)]
pub struct IndexGeneration {
    number: u64,
    pairs: Vec<QaPair>,
    records: Vec<EmbeddingRecord>,
    by_id: HashMap<String, usize>,
    dim: Option<usize>,
}

/// Thread pool bounding the number of concurrent embedding calls in a build.
pub fn build_pool(concurrency: usize) -> Result<ThreadPool> {
    ThreadPoolBuilder::new()
        .num_threads(concurrency)
        .thread_name(|i| format!("qa-embed-{i}"))
        .build()
        .map_err(|e| EngineError::Config(format!("embedding pool: {e}")))
}

impl IndexGeneration {
    /// Embeds every question exactly once. Any failure fails the whole build.
    pub fn build<E>(
        number: u64,
        pairs: Vec<QaPair>,
        provider: &E,
        pool: &ThreadPool,
    ) -> Result<Self>
    where
        E: EmbeddingProvider + ?Sized,
    {
        let start = Instant::now();
        let vectors = pool
            .install(|| {
                pairs
                    .par_iter()
                    .map(|p| provider.embed(&p.question))
                    .collect::<anyhow::Result<Vec<_>>>()
            })
            .map_err(EngineError::Embedding)?;

        let generation = Self::assemble(number, pairs, vectors)?;
        info!(
            generation = number,
            records = generation.len(),
            dim = generation.dim.unwrap_or(0),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "built index generation"
        );
        Ok(generation)
    }

    /// Builds a successor from an edited corpus, reusing vectors whose question
    /// text is unchanged and embedding only the rest.
    pub fn rebuild<E>(
        &self,
        number: u64,
        pairs: Vec<QaPair>,
        provider: &E,
        pool: &ThreadPool,
    ) -> Result<Self>
    where
        E: EmbeddingProvider + ?Sized,
    {
        let previous: HashMap<&str, (&str, &[f32])> = self
            .entries()
            .map(|(pair, rec)| {
                (
                    pair.id.as_str(),
                    (pair.question.as_str(), rec.vector.as_slice()),
                )
            })
            .collect();

        let vectors = pool
            .install(|| {
                pairs
                    .par_iter()
                    .map(|p| match previous.get(p.id.as_str()) {
                        Some((question, vector)) if *question == p.question => Ok(vector.to_vec()),
                        _ => provider.embed(&p.question),
                    })
                    .collect::<anyhow::Result<Vec<_>>>()
            })
            .map_err(EngineError::Embedding)?;

        let generation = Self::assemble(number, pairs, vectors)?;
        debug!(generation = number, records = generation.len(), "rebuilt index generation");
        Ok(generation)
    }

    fn assemble(number: u64, pairs: Vec<QaPair>, vectors: Vec<Vec<f32>>) -> Result<Self> {
        let dim = vectors.first().map(Vec::len);
        if let Some(expected) = dim {
            for (pair, v) in pairs.iter().zip(&vectors) {
                if v.is_empty() || v.len() != expected {
                    return Err(EngineError::Embedding(anyhow!(
                        "qa {} embedded to {} dimensions, expected {}",
                        pair.id,
                        v.len(),
                        expected
                    )));
                }
            }
        }

        let records = pairs
            .iter()
            .zip(vectors)
            .map(|(pair, vector)| EmbeddingRecord {
                qa_id: pair.id.clone(),
                vector,
            })
            .collect();
        let by_id = pairs
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id.clone(), i))
            .collect();

        Ok(Self {
            number,
            pairs,
            records,
            by_id,
            dim,
        })
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// `None` for an empty generation.
    pub fn dim(&self) -> Option<usize> {
        self.dim
    }

    pub fn pairs(&self) -> &[QaPair] {
        &self.pairs
    }

    pub fn records(&self) -> &[EmbeddingRecord] {
        &self.records
    }

    pub fn pair_by_id(&self, id: &str) -> Option<&QaPair> {
        self.by_id.get(id).map(|&i| &self.pairs[i])
    }

    pub fn entries(&self) -> impl Iterator<Item = (&QaPair, &EmbeddingRecord)> {
        self.pairs.iter().zip(self.records.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Answer, Difficulty};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
        fail_on: Option<&'static str>,
    }

    impl CountingProvider {
        fn new(fail_on: Option<&'static str>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_on,
            }
        }
    }

    impl EmbeddingProvider for CountingProvider {
        fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if Some(text) == self.fail_on {
                anyhow::bail!("provider down");
            }
            Ok(vec![text.len() as f32, 1.0])
        }
    }

    fn mk_pair(id: &str, question: &str) -> QaPair {
        QaPair {
            id: id.to_string(),
            question: question.to_string(),
            answers: vec![Answer::new(format!("{id}-a"), "answer", true)],
            tags: Vec::new(),
            category: "general".to_string(),
            difficulty: Difficulty::Easy,
            last_updated: Utc::now(),
        }
    }

    fn corpus() -> Vec<QaPair> {
        (0..20)
            .map(|i| mk_pair(&format!("q{i}"), &"x".repeat(i + 1)))
            .collect()
    }

    #[test]
    fn build_embeds_each_question_once_in_corpus_order() {
        let pool = build_pool(4).unwrap();
        let provider = CountingProvider::new(None);

        let generation = IndexGeneration::build(1, corpus(), &provider, &pool).unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 20);
        assert_eq!(generation.dim(), Some(2));
        for (i, (pair, rec)) in generation.entries().enumerate() {
            assert_eq!(pair.id, format!("q{i}"));
            assert_eq!(rec.qa_id, pair.id);
            assert_eq!(rec.vector[0], (i + 1) as f32);
        }
        assert_eq!(generation.pair_by_id("q3").map(|p| p.question.len()), Some(4));
    }

    #[test]
    fn single_failure_fails_whole_build() {
        let pool = build_pool(2).unwrap();
        let provider = CountingProvider::new(Some("xxx"));

        let err = IndexGeneration::build(1, corpus(), &provider, &pool).unwrap_err();
        assert!(matches!(err, EngineError::Embedding(_)));
    }

    #[test]
    fn empty_corpus_builds_empty_generation() {
        let pool = build_pool(1).unwrap();
        let generation =
            IndexGeneration::build(1, Vec::new(), &CountingProvider::new(None), &pool).unwrap();
        assert!(generation.is_empty());
        assert_eq!(generation.dim(), None);
    }

    #[test]
    fn rebuild_only_embeds_changed_questions() {
        let pool = build_pool(2).unwrap();
        let first =
            IndexGeneration::build(1, corpus(), &CountingProvider::new(None), &pool).unwrap();

        let mut edited = corpus();
        edited[5].question = "changed question".to_string();
        edited.push(mk_pair("q_new", "brand new"));

        let provider = CountingProvider::new(None);
        let second = first.rebuild(2, edited, &provider, &pool).unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(second.number(), 2);
        assert_eq!(second.len(), 21);
        assert_eq!(second.records()[5].vector[0], "changed question".len() as f32);
        assert_eq!(first.records()[5].vector[0], 6.0);
    }

    #[test]
    fn inconsistent_dimensions_are_rejected() {
        struct Ragged;
        impl EmbeddingProvider for Ragged {
            fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
                Ok(vec![1.0; text.len()])
            }
        }

        let pool = build_pool(1).unwrap();
        let pairs = vec![mk_pair("q1", "ab"), mk_pair("q2", "abc")];
        let err = IndexGeneration::build(1, pairs, &Ragged, &pool).unwrap_err();
        assert!(err.to_string().contains("expected 2"));
    }
}
