//! Objective functions grading pipeline output against ground truth

use crate::dataset::Expected;
use crate::pipeline::PipelineOutput;

/// Score with optional textual feedback
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub score: f32,
    pub feedback: Option<String>,
}

/// Deterministic, side-effect free grading of one pipeline output.
///
/// Implementations must return a value in [0, 1].
pub trait Scorer: Send + Sync {
    fn score(&self, output: &PipelineOutput, expected: &Expected) -> f32;

    /// Score plus a description of what went wrong, used for instruction search
    fn evaluate(&self, output: &PipelineOutput, expected: &Expected) -> Evaluation {
        Evaluation {
            score: self.score(output, expected),
            feedback: None,
        }
    }
}

/// Weighted category/priority/quality metric
#[derive(Debug, Clone)]
pub struct TicketScorer {
    pub category_weight: f32,
    pub priority_weight: f32,
    pub quality_weight: f32,
}

impl Default for TicketScorer {
    fn default() -> Self {
        Self {
            category_weight: 0.4,
            priority_weight: 0.3,
            quality_weight: 0.3,
        }
    }
}

impl TicketScorer {
    fn grade(&self, output: &PipelineOutput, expected: &Expected) -> (f32, Vec<String>) {
        let mut score = 0.0;
        let mut total_weight = 0.0;
        let mut mistakes = Vec::new();

        if let Some(category) = &expected.category {
            total_weight += self.category_weight;
            if &output.category == category {
                score += self.category_weight;
            } else {
                mistakes.push(format!(
                    "category: expected {}, got {}",
                    category, output.category
                ));
            }
        }

        if let Some(priority) = &expected.priority {
            total_weight += self.priority_weight;
            if &output.priority == priority {
                score += self.priority_weight;
            } else {
                mistakes.push(format!(
                    "priority: expected {}, got {}",
                    priority, output.priority
                ));
            }
        }

        let quality = output.quality_score as f32;
        let quality = if quality.is_finite() {
            quality.clamp(0.0, 1.0)
        } else {
            0.0
        };
        score += self.quality_weight * quality;
        total_weight += self.quality_weight;
        if quality < 0.5 {
            mistakes.push(format!("response quality too low ({:.2})", quality));
        }

        if let Some(helpful) = expected.helpful {
            if helpful && !output.is_helpful {
                mistakes.push("response was judged unhelpful".to_string());
            }
        }

        let normalized = if total_weight > 0.0 {
            score / total_weight
        } else {
            0.0
        };
        let normalized = if normalized.is_finite() {
            normalized.clamp(0.0, 1.0)
        } else {
            0.0
        };
        (normalized, mistakes)
    }
}

impl Scorer for TicketScorer {
    fn score(&self, output: &PipelineOutput, expected: &Expected) -> f32 {
        self.grade(output, expected).0
    }

    fn evaluate(&self, output: &PipelineOutput, expected: &Expected) -> Evaluation {
        let (score, mistakes) = self.grade(output, expected);
        Evaluation {
            score,
            feedback: if mistakes.is_empty() {
                None
            } else {
                Some(mistakes.join("; "))
            },
        }
    }
}

/// Scorer backed by a closure
pub struct FnScorer<F> {
    f: F,
}

impl<F> FnScorer<F>
where
    F: Fn(&PipelineOutput, &Expected) -> f32 + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> Scorer for FnScorer<F>
where
    F: Fn(&PipelineOutput, &Expected) -> f32 + Send + Sync,
{
    fn score(&self, output: &PipelineOutput, expected: &Expected) -> f32 {
        let score = (self.f)(output, expected);
        if score.is_finite() {
            score.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}
