//! Failure-guided instruction rewriting

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

use crate::dataset::{Example, ExampleId, Expected};
use crate::error::StageError;
use crate::pipeline::PipelineOutput;
use crate::primitives::Generator;
use crate::retry::{CallMeter, RetryPolicy};
use crate::signature::{instruction_rewriter, Fields, CLASSIFIER, RESPONSE_GENERATOR};
use crate::stage::Stage;

pub const MISTAKES_HEADER: &str = "Common mistakes to avoid:";

/// Lessons kept in a rewritten instruction
const MAX_LESSONS: usize = 8;

/// Mistake patterns rendered into a generated-rewrite request
const MAX_PATTERNS_IN_PROMPT: usize = 6;

/// A validation example the pipeline got wrong, attributed to one stage.
///
/// Holds labels but no ticket text; lessons built from it never quote a ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureExemplar {
    pub example_id: ExampleId,
    pub stage: String,
    pub expected: Expected,
    /// Labels the pipeline produced; `None` when the run failed
    pub got_category: Option<String>,
    pub got_priority: Option<String>,
    pub got_quality: Option<f64>,
    pub got_helpful: Option<bool>,
    pub feedback: String,
}

impl FailureExemplar {
    pub fn new(example: &Example, stage: &str, feedback: impl Into<String>) -> Self {
        Self {
            example_id: example.id.clone(),
            stage: stage.to_string(),
            expected: example.expected.clone(),
            got_category: None,
            got_priority: None,
            got_quality: None,
            got_helpful: None,
            feedback: feedback.into(),
        }
    }

    pub fn with_output(mut self, output: &PipelineOutput) -> Self {
        self.got_category = Some(output.category.clone());
        self.got_priority = Some(output.priority.clone());
        self.got_quality = Some(output.quality_score);
        self.got_helpful = Some(output.is_helpful);
        self
    }

    /// Mistake patterns for this failure's stage, phrased over labels only
    pub fn patterns(&self) -> Vec<String> {
        if self.got_category.is_none() {
            return vec![format!("{} answers that could not be used", self.stage)];
        }

        let mut patterns = Vec::new();
        if self.stage == CLASSIFIER {
            if let (Some(expected), Some(got)) = (&self.expected.category, &self.got_category) {
                if expected != got {
                    patterns.push(format!("{} tickets labeled {}", expected, got));
                }
            }
            if let (Some(expected), Some(got)) = (&self.expected.priority, &self.got_priority) {
                if expected != got {
                    patterns.push(format!("{} priority tickets rated {}", expected, got));
                }
            }
        } else {
            if self.got_quality.is_some_and(|q| q < 0.5) {
                patterns.push("responses below the quality bar".to_string());
            }
            if self.expected.helpful == Some(true) && self.got_helpful == Some(false) {
                patterns.push("responses judged unhelpful".to_string());
            }
        }
        patterns
    }
}

/// Stage implicated by a scored mistake
pub fn attribute_stage(expected: &Expected, output: &PipelineOutput) -> &'static str {
    let category_wrong = expected
        .category
        .as_ref()
        .is_some_and(|c| c != &output.category);
    let priority_wrong = expected
        .priority
        .as_ref()
        .is_some_and(|p| p != &output.priority);
    if category_wrong || priority_wrong {
        CLASSIFIER
    } else {
        RESPONSE_GENERATOR
    }
}

/// Patterns with their counts, most frequent first
fn count_patterns(failures: &[FailureExemplar]) -> Vec<(String, usize)> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for pattern in failures.iter().flat_map(|f| f.patterns()) {
        *counts.entry(pattern).or_default() += 1;
    }
    let mut counted: Vec<_> = counts.into_iter().collect();
    counted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    counted
}

fn lesson_pattern(lesson: &str) -> &str {
    match lesson.rsplit_once(" (") {
        Some((pattern, count)) if count.ends_with("x)") => pattern,
        _ => lesson,
    }
}

fn split_instruction(instruction: &str) -> (&str, Vec<String>) {
    match instruction.split_once(MISTAKES_HEADER) {
        Some((base, section)) => (
            base.trim_end(),
            section
                .lines()
                .filter_map(|l| l.trim().strip_prefix("- "))
                .map(str::to_string)
                .collect(),
        ),
        None => (instruction.trim_end(), Vec::new()),
    }
}

/// Append the failures' mistake patterns to an instruction.
///
/// Patterns already listed are kept as they are; the rarest new ones are dropped
/// once the section is full. Returns the instruction unchanged when there is
/// nothing to add.
pub fn heuristic_rewrite(current: &str, failures: &[FailureExemplar]) -> String {
    let (base, mut lessons) = split_instruction(current);
    let before = lessons.len();

    for (pattern, count) in count_patterns(failures) {
        if lessons.len() >= MAX_LESSONS {
            break;
        }
        if !lessons.iter().any(|l| lesson_pattern(l) == pattern) {
            lessons.push(format!("{} ({}x)", pattern, count));
        }
    }

    if lessons.len() == before {
        return current.to_string();
    }

    let bullets = lessons
        .iter()
        .map(|l| format!("- {}", l))
        .collect::<Vec<_>>()
        .join("\n");
    format!("{}\n\n{}\n{}", base, MISTAKES_HEADER, bullets)
}

pub fn format_failures(failures: &[FailureExemplar]) -> String {
    count_patterns(failures)
        .into_iter()
        .take(MAX_PATTERNS_IN_PROMPT)
        .enumerate()
        .map(|(i, (pattern, count))| format!("{}. {} ({} examples)", i + 1, pattern, count))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Ask the generation primitive for an improved instruction
pub async fn generate_rewrite(
    generator: &dyn Generator,
    policy: &RetryPolicy,
    meter: &CallMeter,
    stage: &str,
    current: &str,
    failures: &[FailureExemplar],
) -> Result<String, StageError> {
    let rewriter = Stage::new(instruction_rewriter());
    let config = rewriter.default_config();
    let input: Fields = match json!({
        "stage": stage,
        "current_instruction": current,
        "failures": format_failures(failures),
    }) {
        serde_json::Value::Object(map) => map,
        _ => Fields::new(),
    };
    let (rewriter, config, input) = (&rewriter, &config, &input);

    let attempted = policy
        .call(rewriter.name(), meter, move || {
            rewriter.execute(config, generator, input)
        })
        .await?;

    let text = attempted
        .value
        .get("improved_instruction")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .unwrap_or_default();
    if text.is_empty() {
        return Err(StageError::SchemaMismatch {
            stage: rewriter.name().to_string(),
            detail: "empty improved_instruction".to_string(),
        });
    }
    Ok(text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{example, FnGenerator, ScriptedGenerator};
    use crate::error::GenerationError;
    use crate::signature::CATEGORIES;

    fn output(category: &str, priority: &str) -> PipelineOutput {
        PipelineOutput {
            category: category.into(),
            priority: priority.into(),
            response_type: String::new(),
            classification_reasoning: String::new(),
            solution_info: String::new(),
            escalation_needed: false,
            response: String::new(),
            response_confidence: 0.0,
            quality_score: 0.2,
            is_helpful: false,
            is_professional: true,
            improvement_suggestions: String::new(),
        }
    }

    /// A Billing/High ticket answered with `category`/`priority`
    fn failure(id: &str, category: &str, priority: &str) -> FailureExemplar {
        let example = example(id, "Billing", "High");
        let output = output(category, priority);
        let stage = attribute_stage(&example.expected, &output);
        FailureExemplar::new(&example, stage, "mismatch").with_output(&output)
    }

    #[test]
    fn test_attribute_stage() {
        let expected = example("a", "Billing", "High").expected;
        assert_eq!(attribute_stage(&expected, &output("Sales", "High")), CLASSIFIER);
        assert_eq!(attribute_stage(&expected, &output("Billing", "Low")), CLASSIFIER);
        assert_eq!(
            attribute_stage(&expected, &output("Billing", "High")),
            RESPONSE_GENERATOR
        );
    }

    #[test]
    fn test_patterns_by_stage() {
        assert_eq!(
            failure("a", "Technical", "Medium").patterns(),
            vec![
                "Billing tickets labeled Technical".to_string(),
                "High priority tickets rated Medium".to_string(),
            ]
        );
        assert_eq!(
            failure("b", "Billing", "High").patterns(),
            vec![
                "responses below the quality bar".to_string(),
                "responses judged unhelpful".to_string(),
            ]
        );
        let failed = FailureExemplar::new(&example("c", "Sales", "Low"), CLASSIFIER, "timed out");
        assert_eq!(failed.patterns(), vec!["classifier answers that could not be used".to_string()]);
    }

    #[test]
    fn test_heuristic_rewrite_counts_patterns() {
        let rewritten = heuristic_rewrite(
            "Classify tickets.",
            &[
                failure("a", "Technical", "High"),
                failure("b", "Technical", "High"),
                failure("c", "Sales", "High"),
            ],
        );
        assert_eq!(
            rewritten,
            "Classify tickets.\n\nCommon mistakes to avoid:\n\
             - Billing tickets labeled Technical (2x)\n\
             - Billing tickets labeled Sales (1x)"
        );
    }

    #[test]
    fn test_heuristic_rewrite_never_quotes_tickets() {
        let failures: Vec<_> = ["val-1", "val-2", "val-3"]
            .iter()
            .map(|id| failure(id, "Technical", "Low"))
            .collect();
        let rewritten = heuristic_rewrite("Classify tickets.", &failures);
        let prompt = format_failures(&failures);

        for text in [&rewritten, &prompt] {
            assert!(!text.contains("Refund request"));
            assert!(!text.contains("charged twice"));
            assert!(!text.contains("val-"));
        }
        assert!(prompt.contains("Billing tickets labeled Technical (3 examples)"));
    }

    #[test]
    fn test_heuristic_rewrite_is_idempotent() {
        let failures = vec![failure("a", "Billing", "Medium")];
        let once = heuristic_rewrite("Classify tickets.", &failures);
        let twice = heuristic_rewrite(&once, &failures);
        assert_eq!(once, twice);
        assert_eq!(once.matches(MISTAKES_HEADER).count(), 1);

        // a pattern already listed is not repeated with a new count
        let more = vec![failure("b", "Billing", "Medium"), failure("c", "Billing", "Medium")];
        assert_eq!(heuristic_rewrite(&once, &more), once);
    }

    #[test]
    fn test_heuristic_rewrite_without_failures() {
        assert_eq!(heuristic_rewrite("Be concise.", &[]), "Be concise.");
    }

    #[test]
    fn test_heuristic_rewrite_caps_lessons() {
        // every expected category mislabeled as every other one
        let mut failures = Vec::new();
        for (i, expected) in CATEGORIES.iter().enumerate() {
            for got in CATEGORIES.iter().filter(|c| *c != expected) {
                let example = example(&format!("f{}-{}", i, got), expected, "High");
                failures.push(
                    FailureExemplar::new(&example, CLASSIFIER, "mismatch")
                        .with_output(&output(got, "High")),
                );
            }
        }
        assert!(count_patterns(&failures).len() > MAX_LESSONS);

        let rewritten = heuristic_rewrite("Classify.", &failures);
        assert_eq!(
            rewritten.lines().filter(|l| l.starts_with("- ")).count(),
            MAX_LESSONS
        );
    }

    #[tokio::test]
    async fn test_generate_rewrite() {
        let generator = ScriptedGenerator::default();
        let text = generate_rewrite(
            &generator,
            &RetryPolicy::no_retries(),
            &CallMeter::new(),
            CLASSIFIER,
            "Classify tickets.",
            &[failure("a", "Technical", "High")],
        )
        .await
        .unwrap();
        assert!(text.starts_with("Classify tickets."));
        assert_ne!(text, "Classify tickets.");
    }

    #[tokio::test]
    async fn test_generate_rewrite_surfaces_errors() {
        let generator = FnGenerator::new(|_| Err(GenerationError::Timeout));
        let meter = CallMeter::new();
        let err = generate_rewrite(
            &generator,
            &RetryPolicy::no_retries(),
            &meter,
            CLASSIFIER,
            "Classify tickets.",
            &[],
        )
        .await
        .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(meter.count(), 1);
    }
}
