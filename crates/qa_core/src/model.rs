use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub id: String,
    #[serde(rename = "answer")]
    pub text: String,
    #[serde(default)]
    pub is_primary: bool,
}

impl Answer {
    pub fn new(id: impl Into<String>, text: impl Into<String>, is_primary: bool) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            is_primary,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    #[default]
    Easy,
    Medium,
    Hard,
}

/// Partial update applied by [`QaPair::with_updated_answer`].
#[derive(Debug, Clone, Default)]
pub struct AnswerPatch {
    pub text: Option<String>,
    pub is_primary: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaPair {
    pub id: String,
    pub question: String,
    pub answers: Vec<Answer>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub category: String,
    #[serde(default)]
    pub difficulty: Difficulty,
    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
}

impl QaPair {
    /// First answer flagged primary, otherwise the first answer in list order.
    pub fn primary_answer(&self) -> Option<&Answer> {
        self.answers
            .iter()
            .find(|a| a.is_primary)
            .or_else(|| self.answers.first())
    }

    pub fn answer_by_id(&self, answer_id: &str) -> Option<&Answer> {
        self.answers.iter().find(|a| a.id == answer_id)
    }

    pub fn has_multiple_answers(&self) -> bool {
        self.answers.len() > 1
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Returns a copy with `answer` appended. A blank answer id is replaced
    /// with `ans_<qa id>_<position>`.
    pub fn with_answer(&self, mut answer: Answer) -> Self {
        let mut next = self.clone();
        if answer.id.trim().is_empty() {
            answer.id = format!("ans_{}_{}", self.id, self.answers.len() + 1);
        }
        next.answers.push(answer);
        next.last_updated = Utc::now();
        next
    }

    /// Returns `None` when no answer has `answer_id`.
    pub fn with_updated_answer(&self, answer_id: &str, patch: AnswerPatch) -> Option<Self> {
        let idx = self.answers.iter().position(|a| a.id == answer_id)?;
        let mut next = self.clone();
        let target = &mut next.answers[idx];
        if let Some(text) = patch.text {
            target.text = text;
        }
        if let Some(is_primary) = patch.is_primary {
            target.is_primary = is_primary;
        }
        next.last_updated = Utc::now();
        Some(next)
    }

    /// Returns `None` when no answer has `answer_id`.
    pub fn without_answer(&self, answer_id: &str) -> Option<Self> {
        let idx = self.answers.iter().position(|a| a.id == answer_id)?;
        let mut next = self.clone();
        next.answers.remove(idx);
        next.last_updated = Utc::now();
        Some(next)
    }

    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        let mut next = self.clone();
        if !next.has_tag(&tag) {
            next.tags.push(tag);
        }
        next
    }

    pub fn without_tag(&self, tag: &str) -> Self {
        let mut next = self.clone();
        next.tags.retain(|t| t != tag);
        next
    }

    /// Every invariant violation found on this pair. Empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.id.trim().is_empty() {
            errors.push("id is required".to_string());
        }
        if self.question.trim().is_empty() {
            errors.push("question is required".to_string());
        }
        if self.answers.is_empty() {
            errors.push("at least one answer is required".to_string());
        }
        if self.category.trim().is_empty() {
            errors.push("category is required".to_string());
        }

        let mut seen = HashSet::new();
        for (i, answer) in self.answers.iter().enumerate() {
            if answer.id.trim().is_empty() {
                errors.push(format!("answer {} id is required", i + 1));
            } else if !seen.insert(answer.id.as_str()) {
                errors.push(format!("duplicate answer id '{}'", answer.id));
            }
            if answer.text.trim().is_empty() {
                errors.push(format!("answer {} content is required", i + 1));
            }
        }

        let primaries = self.answers.iter().filter(|a| a.is_primary).count();
        if primaries > 1 {
            errors.push(format!("{primaries} answers are flagged primary"));
        }

        errors
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorpusMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_answers: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_questions: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_saved: Option<DateTime<Utc>>,
}

/// On-disk layout of the corpus file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaDocument {
    pub qa_pairs: Vec<QaPair>,
    #[serde(default)]
    pub metadata: CorpusMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub qa_id: String,
    pub question: String,
    pub answer: Answer,
    pub score: f32,
    pub category: String,
    pub tags: Vec<String>,
    pub total_answers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchAll {
    pub qa_id: String,
    pub question: String,
    pub answers: Vec<Answer>,
    pub score: f32,
    pub category: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusStats {
    pub total_questions: usize,
    pub total_answers: usize,
    pub categories: BTreeSet<String>,
    pub unique_tags: usize,
    pub average_answers_per_question: f64,
}

impl CorpusStats {
    pub fn from_pairs(pairs: &[QaPair]) -> Self {
        let total_questions = pairs.len();
        let total_answers = pairs.iter().map(|p| p.answers.len()).sum();
        let categories: BTreeSet<String> = pairs.iter().map(|p| p.category.clone()).collect();
        let unique_tags = pairs
            .iter()
            .flat_map(|p| p.tags.iter())
            .collect::<HashSet<_>>()
            .len();
        let average_answers_per_question = if total_questions == 0 {
            0.0
        } else {
            total_answers as f64 / total_questions as f64
        };

        Self {
            total_questions,
            total_answers,
            categories,
            unique_tags,
            average_answers_per_question,
        }
    }
}
