use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::anyhow;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::embed::EmbeddingProvider;
use crate::error::{EngineError, Result};
use crate::index::{build_pool, IndexGeneration};
use crate::model::{CorpusStats, Match, MatchAll, QaPair};
use crate::retrieval::{best_match, top_k};
use crate::storage::CorpusStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadState {
    Idle,
    Reloading,
}

/// Clears the exclusive flag when the owning operation finishes, whatever the outcome.
struct ExclusiveGuard<'a>(&'a AtomicBool);

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Semantic QA matcher over an atomically swapped index generation.
///
/// Queries clone the active `Arc<IndexGeneration>` and run against it without
/// holding any lock, so a concurrent swap never affects a query in flight.
/// Operations that replace the generation (initialize, reload, edits, save)
/// are serialized; a second one arriving while another runs is rejected with
/// [`EngineError::ReloadInProgress`].
pub struct QaEngine<P> {
    provider: P,
    store: CorpusStore,
    config: EngineConfig,
    pool: ThreadPool,
    active: RwLock<Option<Arc<IndexGeneration>>>,
    exclusive: AtomicBool,
    last_generation: AtomicU64,
}

impl<P: EmbeddingProvider> QaEngine<P> {
    pub fn new(provider: P, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let pool = build_pool(config.build_concurrency)?;
        Ok(Self {
            provider,
            store: CorpusStore::from_config(&config),
            config,
            pool,
            active: RwLock::new(None),
            exclusive: AtomicBool::new(false),
            last_generation: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// First load. May also be called again to start over from disk.
    pub fn initialize(&self) -> Result<CorpusStats> {
        let _guard = self.begin_exclusive("initialize")?;
        info!(path = %self.config.data_path.display(), "initializing QA engine");
        self.load_and_swap()
    }

    /// Load, rebuild and swap. On failure the active generation is untouched
    /// and the originating error is returned.
    pub fn reload(&self) -> Result<CorpusStats> {
        let _guard = self.begin_exclusive("reload")?;
        if !self.is_ready() {
            return Err(EngineError::NotReady);
        }
        info!(path = %self.config.data_path.display(), "reloading QA data");
        self.load_and_swap().inspect_err(|err| {
            warn!(error = %err, "reload failed; keeping active generation");
        })
    }

    /// Drops the active generation. Queries already holding it finish normally.
    pub fn shutdown(&self) -> Result<()> {
        let _guard = self.begin_exclusive("shutdown")?;
        let old = self.write_active().take();
        if let Some(generation) = old {
            info!(generation = generation.number(), "QA engine shut down");
        }
        Ok(())
    }

    /// Persists the active corpus to the configured data path.
    pub fn save(&self) -> Result<()> {
        let _guard = self.begin_exclusive("save")?;
        let generation = self.snapshot()?;
        self.store.persist(generation.pairs(), &self.config.data_path)
    }

    /// Inserts `pair` or replaces the pair with the same id, then swaps in a
    /// generation that re-embeds only new or changed questions.
    pub fn upsert_pair(&self, pair: QaPair) -> Result<()> {
        let errors = pair.validate();
        if !errors.is_empty() {
            return Err(EngineError::InvalidQaPair {
                id: pair.id,
                reason: errors.join(", "),
            });
        }

        let _guard = self.begin_exclusive("upsert")?;
        let current = self.snapshot()?;
        let mut pairs = current.pairs().to_vec();
        match pairs.iter().position(|p| p.id == pair.id) {
            Some(idx) => pairs[idx] = pair,
            None => pairs.push(pair),
        }
        self.rebuild_and_swap(&current, pairs)
    }

    /// Returns `false` when no pair has `id`.
    pub fn remove_pair(&self, id: &str) -> Result<bool> {
        let _guard = self.begin_exclusive("remove")?;
        let current = self.snapshot()?;
        if current.pair_by_id(id).is_none() {
            return Ok(false);
        }
        let pairs = current
            .pairs()
            .iter()
            .filter(|p| p.id != id)
            .cloned()
            .collect();
        self.rebuild_and_swap(&current, pairs)?;
        Ok(true)
    }

    pub fn is_ready(&self) -> bool {
        self.read_active().is_some()
    }

    pub fn state(&self) -> ReloadState {
        if self.exclusive.load(Ordering::Acquire) {
            ReloadState::Reloading
        } else {
            ReloadState::Idle
        }
    }

    /// Number of the active generation, `None` before initialization.
    pub fn generation(&self) -> Option<u64> {
        self.read_active().as_ref().map(|g| g.number())
    }

    /// The active generation. Holding it pins that snapshot for as long as needed.
    pub fn snapshot(&self) -> Result<Arc<IndexGeneration>> {
        self.read_active().clone().ok_or(EngineError::NotReady)
    }

    pub fn find_best_match(&self, question: &str) -> Result<Option<Match>> {
        let generation = self.snapshot()?;
        let Some(query) = self.embed_query(&generation, question)? else {
            return Ok(None);
        };

        let found = best_match(&query, generation.records())
            .and_then(|(idx, score)| to_match(&generation.pairs()[idx], score));
        if let Some(m) = &found {
            debug!(
                qa_id = %m.qa_id,
                score = m.score,
                generation = generation.number(),
                "best match"
            );
        }
        Ok(found)
    }

    pub fn find_best_match_with_all_answers(&self, question: &str) -> Result<Option<MatchAll>> {
        let generation = self.snapshot()?;
        let Some(query) = self.embed_query(&generation, question)? else {
            return Ok(None);
        };

        Ok(best_match(&query, generation.records()).map(|(idx, score)| {
            let pair = &generation.pairs()[idx];
            MatchAll {
                qa_id: pair.id.clone(),
                question: pair.question.clone(),
                answers: pair.answers.clone(),
                score,
                category: pair.category.clone(),
                tags: pair.tags.clone(),
            }
        }))
    }

    /// Up to `k` matches by descending score, ties in load order.
    pub fn find_top_matches(&self, question: &str, k: usize) -> Result<Vec<Match>> {
        let generation = self.snapshot()?;
        let Some(query) = self.embed_query(&generation, question)? else {
            return Ok(Vec::new());
        };

        Ok(top_k(&query, generation.records(), k)
            .into_iter()
            .filter_map(|(idx, score)| to_match(&generation.pairs()[idx], score))
            .collect())
    }

    pub fn qa_pairs(&self) -> Result<Vec<QaPair>> {
        Ok(self.snapshot()?.pairs().to_vec())
    }

    pub fn qa_pair_by_id(&self, id: &str) -> Result<Option<QaPair>> {
        Ok(self.snapshot()?.pair_by_id(id).cloned())
    }

    pub fn search_by_category(&self, category: &str) -> Result<Vec<QaPair>> {
        let generation = self.snapshot()?;
        Ok(generation
            .pairs()
            .iter()
            .filter(|p| p.category == category)
            .cloned()
            .collect())
    }

    /// Pairs carrying at least one of `tags`.
    pub fn search_by_tags<S: AsRef<str>>(&self, tags: &[S]) -> Result<Vec<QaPair>> {
        let wanted: BTreeSet<&str> = tags.iter().map(AsRef::as_ref).collect();
        let generation = self.snapshot()?;
        Ok(generation
            .pairs()
            .iter()
            .filter(|p| p.tags.iter().any(|t| wanted.contains(t.as_str())))
            .cloned()
            .collect())
    }

    pub fn categories(&self) -> Result<BTreeSet<String>> {
        let generation = self.snapshot()?;
        Ok(generation
            .pairs()
            .iter()
            .map(|p| p.category.clone())
            .collect())
    }

    pub fn tags(&self) -> Result<BTreeSet<String>> {
        let generation = self.snapshot()?;
        Ok(generation
            .pairs()
            .iter()
            .flat_map(|p| p.tags.iter().cloned())
            .collect())
    }

    pub fn stats(&self) -> Result<CorpusStats> {
        Ok(CorpusStats::from_pairs(self.snapshot()?.pairs()))
    }

    fn begin_exclusive(&self, op: &'static str) -> Result<ExclusiveGuard<'_>> {
        self.exclusive
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| {
                warn!(op, "rejected: another reload is in progress");
                EngineError::ReloadInProgress
            })?;
        Ok(ExclusiveGuard(&self.exclusive))
    }

    fn load_and_swap(&self) -> Result<CorpusStats> {
        let pairs = self.store.load(&self.config.data_path)?;
        let number = self.next_generation();
        let generation = IndexGeneration::build(number, pairs, &self.provider, &self.pool)?;
        let stats = CorpusStats::from_pairs(generation.pairs());
        self.swap(generation);
        Ok(stats)
    }

    fn rebuild_and_swap(&self, current: &IndexGeneration, pairs: Vec<QaPair>) -> Result<()> {
        let number = self.next_generation();
        let generation = current.rebuild(number, pairs, &self.provider, &self.pool)?;
        self.swap(generation);
        Ok(())
    }

    fn next_generation(&self) -> u64 {
        self.last_generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn swap(&self, generation: IndexGeneration) {
        let number = generation.number();
        let records = generation.len();
        let previous = {
            let mut active = self.write_active();
            active.replace(Arc::new(generation))
        };
        info!(
            generation = number,
            records,
            previous = previous.as_ref().map(|g| g.number()),
            "activated index generation"
        );
    }

    /// `None` when the generation is empty and there is nothing to compare against.
    fn embed_query(
        &self,
        generation: &IndexGeneration,
        question: &str,
    ) -> Result<Option<Vec<f32>>> {
        let Some(dim) = generation.dim() else {
            return Ok(None);
        };
        let query = self
            .provider
            .embed(question)
            .map_err(EngineError::Embedding)?;
        if query.len() != dim {
            return Err(EngineError::Embedding(anyhow!(
                "query embedded to {} dimensions, index has {}",
                query.len(),
                dim
            )));
        }
        Ok(Some(query))
    }

    // The slot only ever holds a whole generation, so a poisoned lock is still consistent.
    fn read_active(&self) -> std::sync::RwLockReadGuard<'_, Option<Arc<IndexGeneration>>> {
        self.active.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_active(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<IndexGeneration>>> {
        self.active.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn to_match(pair: &QaPair, score: f32) -> Option<Match> {
    let answer = pair.primary_answer()?.clone();
    Some(Match {
        qa_id: pair.id.clone(),
        question: pair.question.clone(),
        answer,
        score,
        category: pair.category.clone(),
        tags: pair.tags.clone(),
        total_answers: pair.answers.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashEmbeddingProvider;
    use std::fs;
    use std::path::Path;

    const CORPUS: &str = r#"{
  "qa_pairs": [
    {"id": "q1", "question": "How do I reset my password?",
     "answers": [{"id": "a1", "answer": "Click 'Forgot password'.", "is_primary": true}],
     "tags": ["password"], "category": "account"},
    {"id": "q2", "question": "What are your support hours?",
     "answers": [{"id": "a2", "answer": "9am-5pm.", "is_primary": true},
                 {"id": "a3", "answer": "Weekends closed.", "is_primary": false}],
     "tags": ["hours"], "category": "general"}
  ],
  "metadata": {"total_answers": 3}
}"#;

    fn engine_at(path: &Path) -> QaEngine<HashEmbeddingProvider> {
        let config = EngineConfig {
            build_concurrency: 2,
            ..EngineConfig::with_data_path(path)
        };
        QaEngine::new(HashEmbeddingProvider::default(), config).unwrap()
    }

    #[test]
    fn queries_before_initialize_are_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_at(&dir.path().join("qa.json"));

        assert!(!engine.is_ready());
        assert!(matches!(engine.find_best_match("hi"), Err(EngineError::NotReady)));
        assert!(matches!(engine.stats(), Err(EngineError::NotReady)));
        assert!(matches!(engine.reload(), Err(EngineError::NotReady)));
        assert!(matches!(engine.save(), Err(EngineError::NotReady)));
    }

    #[test]
    fn generation_numbers_increase_on_each_swap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qa.json");
        fs::write(&path, CORPUS).unwrap();
        let engine = engine_at(&path);

        engine.initialize().unwrap();
        assert_eq!(engine.generation(), Some(1));
        engine.reload().unwrap();
        assert_eq!(engine.generation(), Some(2));
        assert_eq!(engine.state(), ReloadState::Idle);
    }

    #[test]
    fn exclusive_operations_are_rejected_while_one_runs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qa.json");
        fs::write(&path, CORPUS).unwrap();
        let engine = engine_at(&path);
        engine.initialize().unwrap();

        let guard = engine.begin_exclusive("test").unwrap();
        assert_eq!(engine.state(), ReloadState::Reloading);
        assert!(matches!(engine.reload(), Err(EngineError::ReloadInProgress)));
        assert!(matches!(engine.save(), Err(EngineError::ReloadInProgress)));
        // queries are unaffected
        assert!(engine.find_best_match("password").unwrap().is_some());
        drop(guard);

        assert!(engine.reload().is_ok());
    }

    #[test]
    fn reload_after_shutdown_stays_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qa.json");
        fs::write(&path, CORPUS).unwrap();
        let engine = engine_at(&path);
        engine.initialize().unwrap();

        // a shutdown holding the gate has already cleared the slot
        let guard = engine.begin_exclusive("shutdown").unwrap();
        engine.write_active().take();
        assert!(matches!(engine.reload(), Err(EngineError::ReloadInProgress)));
        drop(guard);

        assert!(matches!(engine.reload(), Err(EngineError::NotReady)));
        assert!(!engine.is_ready());
        assert_eq!(engine.state(), ReloadState::Idle);
    }

    #[test]
    fn all_answers_variant_returns_full_answer_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qa.json");
        fs::write(&path, CORPUS).unwrap();
        let engine = engine_at(&path);
        engine.initialize().unwrap();

        let single = engine.find_best_match("support hours").unwrap().unwrap();
        let all = engine
            .find_best_match_with_all_answers("support hours")
            .unwrap()
            .unwrap();

        assert_eq!(single.qa_id, "q2");
        assert_eq!(single.answer.id, "a2");
        assert_eq!(single.total_answers, 2);
        assert_eq!(all.qa_id, single.qa_id);
        assert_eq!(all.score, single.score);
        assert_eq!(all.answers.len(), 2);
    }

    #[test]
    fn upsert_and_remove_swap_new_generations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qa.json");
        fs::write(&path, CORPUS).unwrap();
        let engine = engine_at(&path);
        engine.initialize().unwrap();

        let pinned = engine.snapshot().unwrap();
        let refund = QaPair {
            id: "q3".to_string(),
            question: "How do I get a refund?".to_string(),
            answers: vec![crate::model::Answer::new("a4", "Open a ticket.", false)],
            tags: vec!["billing".to_string()],
            category: "billing".to_string(),
            difficulty: Default::default(),
            last_updated: chrono::Utc::now(),
        };
        engine.upsert_pair(refund).unwrap();

        assert_eq!(pinned.len(), 2);
        assert_eq!(engine.stats().unwrap().total_questions, 3);
        let m = engine.find_best_match("refund please").unwrap().unwrap();
        assert_eq!(m.qa_id, "q3");
        assert_eq!(m.answer.id, "a4");

        assert!(engine.remove_pair("q3").unwrap());
        assert!(!engine.remove_pair("q3").unwrap());
        assert_eq!(engine.qa_pairs().unwrap().len(), 2);
        assert_eq!(engine.generation(), Some(3));
    }

    #[test]
    fn invalid_upsert_is_rejected_without_swap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qa.json");
        fs::write(&path, CORPUS).unwrap();
        let engine = engine_at(&path);
        engine.initialize().unwrap();

        let mut broken = engine.qa_pair_by_id("q1").unwrap().unwrap();
        broken.answers.clear();
        let err = engine.upsert_pair(broken).unwrap_err();

        assert!(matches!(err, EngineError::InvalidQaPair { .. }));
        assert_eq!(engine.generation(), Some(1));
    }

    #[test]
    fn shutdown_returns_to_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qa.json");
        fs::write(&path, CORPUS).unwrap();
        let engine = engine_at(&path);
        engine.initialize().unwrap();

        let pinned = engine.snapshot().unwrap();
        engine.shutdown().unwrap();

        assert!(!engine.is_ready());
        assert!(matches!(engine.qa_pairs(), Err(EngineError::NotReady)));
        assert_eq!(pinned.pairs().len(), 2);
    }

    #[test]
    fn query_dimension_mismatch_is_an_embedding_error() {
        struct Shrinking(AtomicBool);
        impl EmbeddingProvider for Shrinking {
            fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
                if self.0.swap(true, Ordering::SeqCst) {
                    Ok(vec![1.0, 0.0])
                } else {
                    Ok(vec![1.0, 0.0, 0.0])
                }
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qa.json");
        fs::write(
            &path,
            r#"{"qa_pairs":[{"id":"q1","question":"q?","answers":[{"id":"a1","answer":"x"}],"category":"c"}]}"#,
        )
        .unwrap();
        let config = EngineConfig {
            build_concurrency: 1,
            ..EngineConfig::with_data_path(&path)
        };
        let engine = QaEngine::new(Shrinking(AtomicBool::new(false)), config).unwrap();
        engine.initialize().unwrap();

        let err = engine.find_best_match("anything").unwrap_err();
        assert!(matches!(err, EngineError::Embedding(_)));
    }
}
