use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::embed::EmbeddingProvider;
use crate::engine::QaEngine;
use crate::error::Result;

/// A labelled query. `expected_qa_id: None` expects no match, where a match
/// scoring below `min_similarity` counts as none.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalCase {
    pub case_id: String,
    #[serde(alias = "input_question")]
    pub question: String,
    #[serde(default)]
    pub expected_qa_id: Option<String>,
    #[serde(default)]
    pub min_similarity: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalOutcome {
    pub case_id: String,
    pub passed: bool,
    pub actual_qa_id: Option<String>,
    pub actual_answer: Option<String>,
    pub score: f32,
    pub latency_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub pass_rate: f32,
    pub outcomes: Vec<EvalOutcome>,
}

pub struct CaseExpectation;

impl CaseExpectation {
    pub fn matches(
        expected_qa_id: Option<&str>,
        min_similarity: Option<f32>,
        actual_qa_id: Option<&str>,
        score: f32,
    ) -> bool {
        let effective = match (actual_qa_id, min_similarity) {
            (Some(_), Some(min_sim)) if score < min_sim => None,
            (id, _) => id,
        };
        expected_qa_id == effective
    }
}

/// Runs every case against the engine's active generation. Engine errors abort the run.
pub fn evaluate_cases<P>(engine: &QaEngine<P>, cases: &[EvalCase]) -> Result<EvalSummary>
where
    P: EmbeddingProvider,
{
    let mut outcomes = Vec::with_capacity(cases.len());

    for case in cases {
        let start = Instant::now();
        let result = engine.find_best_match(&case.question)?;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        let (actual_qa_id, actual_answer, score) = match result {
            Some(m) => (Some(m.qa_id), Some(m.answer.text), m.score),
            None => (None, None, 0.0),
        };

        let passed = CaseExpectation::matches(
            case.expected_qa_id.as_deref(),
            case.min_similarity,
            actual_qa_id.as_deref(),
            score,
        );

        outcomes.push(EvalOutcome {
            case_id: case.case_id.clone(),
            passed,
            actual_qa_id,
            actual_answer,
            score,
            latency_ms,
        });
    }

    let total = outcomes.len();
    let passed = outcomes.iter().filter(|o| o.passed).count();
    let failed = total.saturating_sub(passed);
    let pass_rate = if total == 0 {
        0.0
    } else {
        passed as f32 / total as f32
    };

    Ok(EvalSummary {
        total,
        passed,
        failed,
        pass_rate,
        outcomes,
    })
}
