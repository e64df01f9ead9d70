//! Atomicity Detector: decides whether a task is small enough to hand
//! directly to an execution agent, or whether it needs another pass
//! through the decomposition engine.
//!
//! `analyze` asks the configured `LlmAdapter` for a provisional
//! classification first, then runs eight hard rules on top of it. Rules 1-4
//! are authoritative: any violation forces the task non-atomic with
//! confidence zero, regardless of what the LLM said. Rules 5-7 only demote
//! confidence. Rule 8 is a fallback path taken when the LLM call fails or
//! its response can't be parsed, bypassing rules 1-7 entirely. The overall
//! shape follows `DecomposerAgent::analyze_objective_complexity` in the
//! teacher codebase, generalized into independent rules rather than one
//! complexity classifier.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::adapters::{LlmAdapter, LlmCompletionRequest};
use crate::types::{AtomicityAnalysis, ComplexityLevel, Priority, ProjectContext, Task};

/// Words that signal a task still spans broad, unbounded scope.
const COMPLEX_ACTION_WORDS: &[&str] = &[
    "implement",
    "comprehensive",
    "complete",
    "full",
    "entire",
    "whole",
    "build",
    "create",
    "develop",
    "design",
    "architect",
    "engineer",
    "establish",
    "setup",
    "configure",
];

/// Vague terms that indicate the task boundary hasn't been pinned down
/// yet. Matched as whole words, case-insensitive.
static VAGUE_TERM_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(various|several|multiple|many|some|necessary|required|appropriate)\b")
        .expect("vague term pattern is a valid regex")
});

static CONJUNCTION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\band\b").expect("conjunction pattern is a valid regex"));

/// Hard thresholds the detector's rules consult. Distinct from `RddConfig`,
/// which owns the acceptance cutoff (`min_confidence`) applied by the
/// decomposition engine after `analyze` returns.
#[derive(Debug, Clone, Copy)]
pub struct AtomicityThresholds {
    pub max_estimated_minutes: u32,
    pub max_affected_files: usize,
}

impl Default for AtomicityThresholds {
    fn default() -> Self {
        Self {
            max_estimated_minutes: 20,
            max_affected_files: 3,
        }
    }
}

/// The LLM's own call on a task, before the eight hard rules are applied
/// as demotions on top of it.
struct Provisional {
    is_atomic: bool,
    confidence: f64,
    reasoning: String,
    estimated_hours: Option<f64>,
    complexity_factors: Vec<String>,
    recommendations: Vec<String>,
}

pub struct AtomicityDetector {
    thresholds: AtomicityThresholds,
    llm: Arc<dyn LlmAdapter>,
}

impl AtomicityDetector {
    pub fn new(thresholds: AtomicityThresholds, llm: Arc<dyn LlmAdapter>) -> Self {
        Self { thresholds, llm }
    }

    /// Classifies `task` against `context`. See the module doc for the
    /// rule-precedence contract.
    pub async fn analyze(&self, task: &Task, context: &ProjectContext) -> AtomicityAnalysis {
        let provisional = match self.classify_with_llm(task, context).await {
            Some(p) => p,
            None => return Self::fallback_analysis(task),
        };

        let mut is_atomic = provisional.is_atomic;
        let mut confidence = provisional.confidence;
        let mut complexity_factors = provisional.complexity_factors;
        let mut recommendations = provisional.recommendations;

        // Rule 1: duration threshold. Authoritative.
        if let Some(minutes) = task.estimated_minutes {
            if minutes > self.thresholds.max_estimated_minutes {
                is_atomic = false;
                confidence = 0.0;
                recommendations.push(format!(
                    "Task exceeds {}-minute validation threshold",
                    self.thresholds.max_estimated_minutes
                ));
            }
        }

        // Rule 2: too many files touched in one step. Authoritative.
        if task.affected_files.len() >= self.thresholds.max_affected_files {
            is_atomic = false;
            confidence = 0.0;
            complexity_factors
                .push("Multiple file modifications indicate non-atomic task".to_string());
        }

        // Rule 3: exactly one acceptance criterion expected. Authoritative.
        if task.acceptance_criteria.len() != 1 {
            is_atomic = false;
            confidence = 0.0;
            complexity_factors.push(format!(
                "Has {} acceptance criteria, expected exactly 1",
                task.acceptance_criteria.len()
            ));
        }

        // Rule 4: conjunction / multi-part phrasing. Authoritative.
        let text = format!("{} {}", task.title, task.description);
        if CONJUNCTION_PATTERN.is_match(&text) {
            is_atomic = false;
            confidence = 0.0;
            complexity_factors.push("Title or description joins multiple clauses".to_string());
        }

        // Rule 5: complex action verbs imply broad, unbounded scope. Soft cap.
        let lower = text.to_lowercase();
        if COMPLEX_ACTION_WORDS.iter().any(|w| lower.contains(w)) {
            confidence = confidence.min(0.5);
            complexity_factors.push("Contains a complex/broad-scope action verb".to_string());
        }

        // Rule 6: vague terms indicate the boundary isn't pinned down. Soft cap.
        if VAGUE_TERM_PATTERN.is_match(&text) {
            confidence = confidence.min(0.55);
            complexity_factors.push("Contains vague/unbounded language".to_string());
        }

        // Rule 7: critical priority in a high-complexity project is treated
        // conservatively even when the text reads clean. Soft cap.
        if task.priority == Priority::Critical && context.complexity == ComplexityLevel::High {
            confidence = confidence.min(0.8);
            recommendations.push(
                "Manual review recommended for critical task in high-complexity project"
                    .to_string(),
            );
        }

        AtomicityAnalysis {
            task_id: task.id.clone(),
            is_atomic,
            confidence,
            reasoning: provisional.reasoning,
            estimated_hours: provisional.estimated_hours,
            complexity_factors,
            recommendations,
            analyzed_at: chrono::Utc::now(),
        }
    }

    /// Rule 8: the LLM call failed, or its response couldn't be parsed as a
    /// classification. Returns directly instead of evaluating rules 1-7
    /// against an absent provisional result.
    fn fallback_analysis(task: &Task) -> AtomicityAnalysis {
        AtomicityAnalysis {
            task_id: task.id.clone(),
            is_atomic: false,
            confidence: 0.4,
            reasoning: "Fallback analysis".to_string(),
            estimated_hours: None,
            complexity_factors: vec!["LLM analysis unavailable".to_string()],
            recommendations: vec!["Manual review recommended".to_string()],
            analyzed_at: chrono::Utc::now(),
        }
    }

    async fn classify_with_llm(
        &self,
        task: &Task,
        context: &ProjectContext,
    ) -> Option<Provisional> {
        let prompt = format!(
            "Classify whether the following task is atomic (small enough to hand \
             directly to an execution agent) for project {}.\n\
             Tech stack: {:?}\nTask: {}\n{}\n\
             Respond as JSON: {{\"isAtomic\": bool, \"confidence\": number, \
             \"reasoning\": string, \"estimatedHours\": number, \
             \"complexityFactors\": [string], \"recommendations\": [string]}}",
            context.project_id, context.tech_stack, task.title, task.description
        );

        let response = self
            .llm
            .complete(LlmCompletionRequest {
                prompt,
                model: None,
                max_tokens: None,
                temperature: Some(0.1),
            })
            .await
            .ok()?;

        parse_classification(&response.text)
    }
}

/// Permissively parses the LLM's camelCase-keyed classification response.
/// A missing or non-boolean `isAtomic` is treated as unparseable — that's
/// what routes the caller to the rule-8 fallback rather than silently
/// defaulting to a classification the model never actually gave.
fn parse_classification(text: &str) -> Option<Provisional> {
    let value: Value = serde_json::from_str(text).ok()?;
    let is_atomic = value.get("isAtomic")?.as_bool()?;
    let confidence = value
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(0.5);
    let reasoning = value
        .get("reasoning")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let estimated_hours = value.get("estimatedHours").and_then(Value::as_f64);
    let complexity_factors = value
        .get("complexityFactors")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let recommendations = value
        .get("recommendations")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    Some(Provisional {
        is_atomic,
        confidence,
        reasoning,
        estimated_hours,
        complexity_factors,
        recommendations,
    })
}
