//! Scoring a pipeline state over a batch of examples

use futures::stream::{self, StreamExt};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::instruction::{attribute_stage, FailureExemplar};
use super::proposal::BootstrapTrace;
use crate::dataset::Example;
use crate::error::PipelineError;
use crate::pipeline::{Pipeline, PipelineRun, PipelineState};
use crate::retry::{CallMeter, RetryPolicy};
use crate::scorer::Scorer;

/// Score recorded for an example whose pipeline run failed
pub const SENTINEL_SCORE: f32 = 0.0;

#[derive(Debug, Clone)]
pub struct BatchEvaluation {
    /// Mean score over the batch
    pub score: f32,
    pub calls: usize,
    pub wallclock: Duration,
    pub failures: Vec<FailureExemplar>,
    /// Examples whose run failed outright
    pub errors: usize,
}

/// Run every example of `batch` through `state` and average the scores.
///
/// A failed run contributes `SENTINEL_SCORE`; it never aborts the batch.
pub async fn evaluate_batch(
    pipeline: &Pipeline,
    policy: &RetryPolicy,
    state: &PipelineState,
    batch: &[&Example],
    scorer: &dyn Scorer,
) -> BatchEvaluation {
    let started = Instant::now();
    let meter = CallMeter::new();
    let mut total = 0.0f32;
    let mut failures = Vec::new();
    let mut errors = 0;

    for example in batch {
        match pipeline
            .run_with_policy(state, &example.ticket, &meter, policy)
            .await
        {
            Ok(run) => {
                let evaluation = scorer.evaluate(&run.output, &example.expected);
                total += evaluation.score;
                if let Some(feedback) = evaluation.feedback {
                    let stage = attribute_stage(&example.expected, &run.output);
                    failures.push(
                        FailureExemplar::new(example, stage, feedback).with_output(&run.output),
                    );
                }
            }
            Err(e) => {
                warn!("Example {} failed: {}", example.id, e);
                errors += 1;
                total += SENTINEL_SCORE;
                failures.push(FailureExemplar::new(
                    example,
                    &e.stage,
                    format!("stage failed: {}", e.source),
                ));
            }
        }
    }

    let score = if batch.is_empty() {
        SENTINEL_SCORE
    } else {
        total / batch.len() as f32
    };

    BatchEvaluation {
        score,
        calls: meter.count(),
        wallclock: started.elapsed(),
        failures,
        errors,
    }
}

/// Collect stage traces of training examples the state answers well enough.
///
/// Runs up to `concurrency` examples at once; results keep input order.
#[allow(clippy::too_many_arguments)]
pub async fn bootstrap_traces(
    pipeline: &Pipeline,
    policy: &RetryPolicy,
    state: &PipelineState,
    examples: &[&Example],
    scorer: &dyn Scorer,
    threshold: f32,
    concurrency: usize,
    meter: &CallMeter,
) -> Vec<BootstrapTrace> {
    let runs = stream::iter(examples.iter().copied())
        .map(|example| run_one(pipeline, policy, state, example))
        .buffered(concurrency.max(1))
        .boxed()
        .collect::<Vec<_>>()
        .await;

    let mut traces = Vec::new();
    for (example, result, calls) in runs {
        meter.add(calls);
        match result {
            Ok(run) => {
                let score = scorer.score(&run.output, &example.expected);
                if score >= threshold {
                    traces.push(BootstrapTrace {
                        example_id: example.id.clone(),
                        trace: run.trace,
                    });
                } else {
                    debug!(
                        "Skipping bootstrap trace for {} (score {:.3} < {:.3})",
                        example.id, score, threshold
                    );
                }
            }
            Err(e) => debug!("Bootstrap run for {} failed: {}", example.id, e),
        }
    }
    traces
}

async fn run_one<'a>(
    pipeline: &'a Pipeline,
    policy: &'a RetryPolicy,
    state: &'a PipelineState,
    example: &'a Example,
) -> (&'a Example, Result<PipelineRun, PipelineError>, usize) {
    let local = CallMeter::new();
    let result = pipeline
        .run_with_policy(state, &example.ticket, &local, policy)
        .await;
    (example, result, local.count())
}
