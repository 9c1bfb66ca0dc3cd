use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::model::{CorpusMetadata, QaDocument, QaPair};

#[derive(Debug, Clone)]
struct BackupPolicy {
    dir: PathBuf,
    max_backups: usize,
}

/// Reads and atomically writes the corpus file.
#[derive(Debug, Clone, Default)]
pub struct CorpusStore {
    backup: Option<BackupPolicy>,
}

#[derive(Serialize)]
struct QaDocumentRef<'a> {
    qa_pairs: &'a [QaPair],
    metadata: CorpusMetadata,
}

impl CorpusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backups(dir: impl Into<PathBuf>, max_backups: usize) -> Self {
        Self {
            backup: Some(BackupPolicy {
                dir: dir.into(),
                max_backups: max_backups.max(1),
            }),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        match &config.backup_dir {
            Some(dir) => Self::with_backups(dir, config.max_backups),
            None => Self::new(),
        }
    }

    /// All-or-nothing: any unreadable, malformed or invalid input fails the whole load.
    pub fn load(&self, path: &Path) -> Result<Vec<QaPair>> {
        debug!(path = %path.display(), "loading QA data");
        let raw = fs::read_to_string(path)
            .map_err(|e| EngineError::load(path, format!("read: {e}")))?;
        let doc: QaDocument = serde_json::from_str(&raw)
            .map_err(|e| EngineError::load(path, format!("parse: {e}")))?;

        validate_corpus(&doc.qa_pairs).map_err(|reason| EngineError::load(path, reason))?;

        let total_answers: usize = doc.qa_pairs.iter().map(|p| p.answers.len()).sum();
        if let Some(declared) = doc.metadata.total_answers {
            if declared != total_answers {
                warn!(
                    declared,
                    counted = total_answers,
                    "metadata.total_answers disagrees with corpus"
                );
            }
        }

        info!(
            path = %path.display(),
            qa_pairs = doc.qa_pairs.len(),
            total_answers,
            "loaded QA data"
        );
        Ok(doc.qa_pairs)
    }

    /// Writes to a temp file beside `path`, then renames it into place.
    /// On failure the existing file is left untouched.
    pub fn persist(&self, pairs: &[QaPair], path: &Path) -> Result<()> {
        let doc = QaDocumentRef {
            qa_pairs: pairs,
            metadata: CorpusMetadata {
                total_answers: Some(pairs.iter().map(|p| p.answers.len()).sum()),
                total_questions: Some(pairs.len()),
                last_saved: Some(Utc::now()),
            },
        };
        let bytes =
            serde_json::to_vec_pretty(&doc).map_err(|e| EngineError::persist(path, e.into()))?;

        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| EngineError::persist(path, e))?;
        tmp.write_all(&bytes)
            .map_err(|e| EngineError::persist(path, e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| EngineError::persist(path, e))?;

        if let Some(policy) = &self.backup {
            if path.exists() {
                backup_existing(policy, path).map_err(|e| EngineError::persist(path, e))?;
            }
        }

        tmp.persist(path)
            .map_err(|e| EngineError::persist(path, e.error))?;

        info!(path = %path.display(), qa_pairs = pairs.len(), "persisted QA data");
        Ok(())
    }
}

/// Checks per-pair invariants and corpus-wide id uniqueness.
pub fn validate_corpus(pairs: &[QaPair]) -> std::result::Result<(), String> {
    let mut problems = Vec::new();
    let mut ids = HashSet::new();

    for (idx, pair) in pairs.iter().enumerate() {
        let errors = pair.validate();
        if !errors.is_empty() {
            problems.push(format!("qa pair {} ({}): {}", idx, pair.id, errors.join(", ")));
        }
        if !pair.id.trim().is_empty() && !ids.insert(pair.id.as_str()) {
            problems.push(format!("duplicate qa id '{}'", pair.id));
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems.join("; "))
    }
}

fn backup_existing(policy: &BackupPolicy, path: &Path) -> io::Result<()> {
    fs::create_dir_all(&policy.dir)?;
    let stem = backup_stem(path);
    let name = format!("{stem}-{}.json", Utc::now().format("%Y%m%dT%H%M%S%.6fZ"));
    let target = policy.dir.join(name);
    fs::copy(path, &target)?;
    debug!(backup = %target.display(), "backed up QA data");

    if let Err(err) = prune_backups(policy, &stem) {
        warn!(error = %err, dir = %policy.dir.display(), "failed to prune old backups");
    }
    Ok(())
}

fn backup_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "qa_data".to_string())
}

fn prune_backups(policy: &BackupPolicy, stem: &str) -> io::Result<()> {
    let prefix = format!("{stem}-");
    let mut backups: Vec<PathBuf> = fs::read_dir(&policy.dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".json"))
        })
        .collect();

    if backups.len() <= policy.max_backups {
        return Ok(());
    }

    // Timestamped names sort chronologically.
    backups.sort();
    let excess = backups.len() - policy.max_backups;
    for old in backups.into_iter().take(excess) {
        fs::remove_file(&old)?;
        debug!(backup = %old.display(), "removed old backup");
    }
    Ok(())
}
