//! Automatic pipeline optimization
//!
//! The optimizer is a best-of-sampled-candidates hill climb over pipeline
//! states:
//!
//! 1. **Initializing**: draw the validation batch, score the installed state
//!    as trial 0, and bootstrap demonstrations from training examples
//! 2. **Proposing**: clone Best-So-Far into `proposal_budget` candidates with
//!    resampled demonstrations and failure-guided instruction rewrites
//! 3. **Evaluating**: score candidates concurrently on the validation batch
//! 4. **Selecting**: append trial records and update Best-So-Far, then either
//!    start another round or terminate
//!
//! On termination the best state is installed into the pipeline. All learning
//! signal flows through the trial log.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use triage_core::optimizer::{Optimizer, OptimizerConfig};
//!
//! let optimizer = Optimizer::new(pipeline, examples, scorer, OptimizerConfig::development())?;
//! let result = optimizer.run().await?;
//! println!("best score {:.3} after {} trials", result.best.score, result.trials.len());
//! ```

pub mod evaluate;
pub mod instruction;
pub mod proposal;
pub mod trial;

pub use evaluate::{evaluate_batch, BatchEvaluation, SENTINEL_SCORE};
pub use instruction::{attribute_stage, heuristic_rewrite, FailureExemplar};
pub use proposal::{DemoPool, ProposalPlan};
pub use trial::{BestPoint, BestSoFar, TieBreak, TrialCost, TrialLog, TrialRecord};

use anyhow::Context;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dataset::{Example, ExampleId, ExampleSet, Pool};
use crate::error::OptimizeError;
use crate::pipeline::{Pipeline, PipelineState};
use crate::retry::{CallMeter, RetryPolicy};
use crate::scorer::Scorer;
use crate::signature::{CLASSIFIER, KNOWLEDGE_RETRIEVER, QUALITY_EVALUATOR, RESPONSE_GENERATOR};
use evaluate::bootstrap_traces;
use instruction::generate_rewrite;
use proposal::propose;

/// How instruction search proposes new instruction text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstructionSearch {
    Off,
    /// Append lessons from failure exemplars
    #[default]
    Heuristic,
    /// Ask the generation primitive for a rewrite, falling back to the heuristic
    Generated,
}

/// Run-level budget. A run stops at the first limit reached.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Termination {
    pub max_calls: Option<usize>,
    pub max_wallclock: Option<Duration>,
}

/// Configuration for an optimization run
#[derive(Clone, Debug)]
pub struct OptimizerConfig {
    /// Candidates generated per round
    pub proposal_budget: usize,
    /// Validation examples each candidate is scored on
    pub validation_sample_size: usize,
    /// Upper bound on a single primitive call
    pub call_timeout: Duration,
    /// Retries per primitive call before it counts as unavailable
    pub max_retries: u32,
    /// Candidates evaluated at once
    pub concurrency_limit: usize,
    pub termination: Termination,
    pub max_rounds: usize,
    /// Stop as soon as Best-So-Far reaches this score
    pub target_score: f32,
    pub seed: u64,
    /// Draw a fresh validation batch every round instead of one per run
    pub resample_validation: bool,
    pub tie_break: TieBreak,
    pub demonstration_search: bool,
    pub instruction_search: InstructionSearch,
    /// Demonstrations built straight from training labels (classifier only)
    pub max_labeled_demos: usize,
    /// Demonstrations taken from successful training traces, per stage
    pub max_bootstrapped_demos: usize,
    /// Minimum score for a training trace to become a demonstration
    pub bootstrap_threshold: f32,
    /// Training examples run to collect traces
    pub bootstrap_sample_size: usize,
    /// Stages whose configuration may change
    pub target_stages: Vec<String>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            proposal_budget: 4,
            validation_sample_size: 20,
            call_timeout: Duration::from_secs(60),
            max_retries: 2,
            concurrency_limit: 4,
            termination: Termination {
                max_calls: Some(2000),
                max_wallclock: Some(Duration::from_secs(3600)),
            },
            max_rounds: 10,
            target_score: 1.0,
            seed: 42,
            resample_validation: false,
            tie_break: TieBreak::CostThenIndex,
            demonstration_search: true,
            instruction_search: InstructionSearch::Heuristic,
            max_labeled_demos: 2,
            max_bootstrapped_demos: 4,
            bootstrap_threshold: 0.8,
            bootstrap_sample_size: 16,
            target_stages: vec![
                CLASSIFIER.to_string(),
                KNOWLEDGE_RETRIEVER.to_string(),
                RESPONSE_GENERATOR.to_string(),
                QUALITY_EVALUATOR.to_string(),
            ],
        }
    }
}

impl OptimizerConfig {
    /// Quick development configuration (fast, cheap)
    pub fn development() -> Self {
        Self {
            proposal_budget: 2,
            validation_sample_size: 8,
            concurrency_limit: 2,
            max_rounds: 3,
            bootstrap_sample_size: 8,
            termination: Termination {
                max_calls: Some(300),
                max_wallclock: Some(Duration::from_secs(600)),
            },
            ..Default::default()
        }
    }

    /// Production configuration (thorough, expensive)
    pub fn production() -> Self {
        Self {
            proposal_budget: 8,
            validation_sample_size: 50,
            concurrency_limit: 8,
            max_rounds: 20,
            bootstrap_sample_size: 32,
            instruction_search: InstructionSearch::Generated,
            termination: Termination {
                max_calls: Some(10_000),
                max_wallclock: Some(Duration::from_secs(4 * 3600)),
            },
            ..Default::default()
        }
    }

    pub fn with_proposal_budget(mut self, budget: usize) -> Self {
        self.proposal_budget = budget;
        self
    }

    pub fn with_validation_sample_size(mut self, size: usize) -> Self {
        self.validation_sample_size = size;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    pub fn with_max_calls(mut self, max_calls: Option<usize>) -> Self {
        self.termination.max_calls = max_calls;
        self
    }

    pub fn with_max_wallclock(mut self, max_wallclock: Option<Duration>) -> Self {
        self.termination.max_wallclock = max_wallclock;
        self
    }

    pub fn with_max_rounds(mut self, rounds: usize) -> Self {
        self.max_rounds = rounds;
        self
    }

    pub fn with_target_score(mut self, target: f32) -> Self {
        self.target_score = target;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    pub fn with_instruction_search(mut self, mode: InstructionSearch) -> Self {
        self.instruction_search = mode;
        self
    }

    pub fn with_demonstration_search(mut self, enabled: bool) -> Self {
        self.demonstration_search = enabled;
        self
    }

    pub fn with_resample_validation(mut self, resample: bool) -> Self {
        self.resample_validation = resample;
        self
    }

    pub fn with_target_stages<S: Into<String>>(mut self, stages: impl IntoIterator<Item = S>) -> Self {
        self.target_stages = stages.into_iter().map(Into::into).collect();
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            call_timeout: self.call_timeout,
            ..RetryPolicy::default()
        }
    }

    pub fn validate(&self) -> Result<(), OptimizeError> {
        let invalid = |msg: &str| Err(OptimizeError::InvalidConfig(msg.to_string()));
        if self.proposal_budget == 0 {
            return invalid("proposal_budget must be at least 1");
        }
        if self.validation_sample_size == 0 {
            return invalid("validation_sample_size must be at least 1");
        }
        if self.concurrency_limit == 0 {
            return invalid("concurrency_limit must be at least 1");
        }
        if self.call_timeout.is_zero() {
            return invalid("call_timeout must be positive");
        }
        if !(self.target_score > 0.0 && self.target_score <= 1.0) {
            return invalid("target_score must be in (0, 1]");
        }
        if !(0.0..=1.0).contains(&self.bootstrap_threshold) {
            return invalid("bootstrap_threshold must be in [0, 1]");
        }
        if !self.demonstration_search && self.instruction_search == InstructionSearch::Off {
            return invalid("at least one proposal strategy must be enabled");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Proposing,
    Evaluating,
    Selecting,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetKind {
    Calls,
    Wallclock,
    Rounds,
}

/// Why a run stopped. All of these are normal outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    TargetReached,
    BudgetExhausted(BudgetKind),
    Cancelled,
}

/// Snapshot handed to the round observer after each Selecting phase
#[derive(Debug, Clone)]
pub struct RoundSummary {
    pub round: usize,
    pub trials: Vec<Arc<TrialRecord>>,
    pub best: Arc<TrialRecord>,
    pub total_calls: usize,
    pub elapsed: Duration,
}

pub type RoundObserver = Arc<dyn Fn(&RoundSummary) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct OptimizationResult {
    pub run_id: Uuid,
    pub best: Arc<TrialRecord>,
    pub baseline_score: f32,
    pub trials: Vec<Arc<TrialRecord>>,
    pub history: Vec<BestPoint>,
    pub rounds: usize,
    pub total_calls: usize,
    pub elapsed: Duration,
    pub reason: TerminationReason,
    /// Validation examples scored during the run
    pub validation_ids: BTreeSet<ExampleId>,
    /// Examples that appeared as demonstrations in any candidate
    pub demonstration_ids: BTreeSet<ExampleId>,
}

impl OptimizationResult {
    pub fn best_state(&self) -> &PipelineState {
        &self.best.state
    }

    pub fn improvement(&self) -> f32 {
        self.best.score - self.baseline_score
    }

    /// Write every trial record as JSON
    pub fn save_trial_log(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let entries: Vec<trial::TrialLogEntry<'_>> =
            self.trials.iter().map(|t| t.as_ref().into()).collect();
        let log = json!({
            "run_id": self.run_id.to_string(),
            "reason": format!("{:?}", self.reason),
            "baseline_score": self.baseline_score,
            "best_trial": self.best.index,
            "best_score": self.best.score,
            "total_calls": self.total_calls,
            "elapsed_ms": self.elapsed.as_millis() as u64,
            "history": self.history,
            "trials": entries,
        });
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&log)?)
            .with_context(|| format!("failed to write trial log {}", path.display()))?;
        Ok(())
    }
}

/// One optimization run over a pipeline.
///
/// Owns its trial log and Best-So-Far, so several runs can coexist in a process.
pub struct Optimizer {
    run_id: Uuid,
    pipeline: Arc<Pipeline>,
    examples: Arc<ExampleSet>,
    scorer: Arc<dyn Scorer>,
    config: OptimizerConfig,
    policy: RetryPolicy,
    log: TrialLog,
    best: BestSoFar,
    meter: CallMeter,
    phase: Mutex<Phase>,
    cancel: CancellationToken,
    started: AtomicBool,
    observer: Option<RoundObserver>,
    validation_drawn: Mutex<BTreeSet<ExampleId>>,
    demonstrations_used: Mutex<BTreeSet<ExampleId>>,
    result: Mutex<Option<OptimizationResult>>,
}

impl Optimizer {
    /// Validate the configuration and the installed state.
    ///
    /// Fails with `ValidationLeak` if the installed state already demonstrates a validation example.
    pub fn new(
        pipeline: Arc<Pipeline>,
        examples: Arc<ExampleSet>,
        scorer: Arc<dyn Scorer>,
        config: OptimizerConfig,
    ) -> Result<Self, OptimizeError> {
        config.validate()?;
        if examples.validation().is_empty() {
            return Err(OptimizeError::InvalidConfig(
                "validation pool is empty".to_string(),
            ));
        }
        for stage in &config.target_stages {
            if pipeline.stage(stage).is_none() {
                return Err(OptimizeError::InvalidConfig(format!(
                    "unknown target stage '{}'",
                    stage
                )));
            }
        }
        examples.check_state(&pipeline.state())?;
        if examples.training().is_empty() {
            warn!("Training pool is empty; demonstration search has nothing to draw from");
        }

        Ok(Self {
            run_id: Uuid::new_v4(),
            policy: config.retry_policy(),
            best: BestSoFar::new(config.tie_break),
            pipeline,
            examples,
            scorer,
            config,
            log: TrialLog::new(),
            meter: CallMeter::new(),
            phase: Mutex::new(Phase::Initializing),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            observer: None,
            validation_drawn: Mutex::default(),
            demonstrations_used: Mutex::default(),
            result: Mutex::new(None),
        })
    }

    /// Called after every completed round
    pub fn with_round_observer(mut self, observer: impl Fn(&RoundSummary) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn trial_log(&self) -> &TrialLog {
        &self.log
    }

    /// Current Best-So-Far, available as soon as the baseline is scored
    pub fn best(&self) -> Option<Arc<TrialRecord>> {
        self.best.get()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop proposing new rounds. The run still terminates with its Best-So-Far.
    pub fn cancel(&self) {
        info!("Optimization {} cancellation requested", self.run_id);
        self.cancel.cancel();
    }

    /// Final result, once the run has terminated
    pub fn result(&self) -> Option<OptimizationResult> {
        self.result
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Run on a background task
    pub fn start(self: Arc<Self>) -> JoinHandle<Result<OptimizationResult, OptimizeError>> {
        tokio::spawn(async move { self.run().await })
    }

    pub async fn run(&self) -> Result<OptimizationResult, OptimizeError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(OptimizeError::InvalidConfig(
                "optimizer has already been started".to_string(),
            ));
        }

        let started = Instant::now();
        self.set_phase(Phase::Initializing);
        info!(
            "Optimization {} starting: {} training / {} validation examples, budget {} per round",
            self.run_id,
            self.examples.training().len(),
            self.examples.validation().len(),
            self.config.proposal_budget
        );

        let (mut batch_id, mut batch) = self.draw_batch(self.config.seed);

        let baseline_state = self.pipeline.state();
        let baseline = Arc::new(
            self.evaluate_candidate(0, 0, Arc::clone(&baseline_state), &batch, &batch_id)
                .await,
        );
        self.log.append(Arc::clone(&baseline));
        self.best.offer(&baseline);
        info!("Baseline score: {:.4}", baseline.score);

        let mut round = 0;
        let mut pool = None;
        let reason = loop {
            if let Some(reason) = self.check_termination(round, started) {
                break reason;
            }
            let pool = match pool {
                Some(ref pool) => pool,
                None => {
                    let per_example = baseline.cost.calls / batch.len().max(1);
                    let built = self.build_demo_pool(&baseline_state, per_example).await?;
                    // bootstrapping spends calls of its own
                    if let Some(reason) = self.check_termination(round, started) {
                        break reason;
                    }
                    &*pool.insert(built)
                }
            };
            round += 1;

            self.set_phase(Phase::Proposing);
            let best = self.current_best()?;
            let rewrites = self.instruction_rewrites(&best, round).await;
            let plan = ProposalPlan {
                targets: &self.config.target_stages,
                budget: self.config.proposal_budget,
                demonstration_search: self.config.demonstration_search,
                max_labeled: self.config.max_labeled_demos,
                max_bootstrapped: self.config.max_bootstrapped_demos,
                rewrites: &rewrites,
            };
            let mut candidates = {
                let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(round as u64));
                propose(&best.state, pool, &plan, &mut rng)
            };
            for candidate in &candidates {
                self.examples.check_state(candidate)?;
            }
            candidates.retain(|candidate| match self.pipeline.validate_state(candidate) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Round {}: dropping candidate: {}", round, e);
                    false
                }
            });
            for candidate in &candidates {
                self.note_demonstrations(candidate);
            }
            debug!("Round {}: proposed {} candidates", round, candidates.len());

            if self.config.resample_validation {
                (batch_id, batch) = self.draw_batch(self.config.seed.wrapping_add(round as u64));
            }

            self.set_phase(Phase::Evaluating);
            let first_index = self.log.len();
            let mut records = stream::iter(candidates.into_iter().enumerate())
                .map(|(i, state)| {
                    self.evaluate_candidate(first_index + i, round, Arc::new(state), &batch, &batch_id)
                })
                .buffer_unordered(self.config.concurrency_limit)
                .collect::<Vec<_>>()
                .await;
            records.sort_by_key(|r| r.index);

            self.set_phase(Phase::Selecting);
            let mut trials = Vec::with_capacity(records.len());
            for record in records {
                let record = Arc::new(record);
                self.log.append(Arc::clone(&record));
                self.best.offer(&record);
                trials.push(record);
            }

            let summary = RoundSummary {
                round,
                trials,
                best: self.current_best()?,
                total_calls: self.meter.count(),
                elapsed: started.elapsed(),
            };
            info!(
                "Round {} complete: best {:.4} (trial {}), {} calls so far",
                round, summary.best.score, summary.best.index, summary.total_calls
            );
            if let Some(observer) = &self.observer {
                observer(&summary);
            }
        };

        self.set_phase(Phase::Terminated);
        let best = self.current_best()?;
        self.pipeline.install(best.state.as_ref().clone())?;
        info!(
            "Optimization {} terminated ({:?}): best trial {} score {:.4} (baseline {:.4})",
            self.run_id, reason, best.index, best.score, baseline.score
        );

        let result = OptimizationResult {
            run_id: self.run_id,
            best,
            baseline_score: baseline.score,
            trials: self.log.snapshot(),
            history: self.best.history(),
            rounds: round,
            total_calls: self.meter.count(),
            elapsed: started.elapsed(),
            reason,
            validation_ids: self.lock_set(&self.validation_drawn).clone(),
            demonstration_ids: self.lock_set(&self.demonstrations_used).clone(),
        };
        *self.result.lock().unwrap_or_else(|e| e.into_inner()) = Some(result.clone());
        Ok(result)
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
        debug!("Optimizer phase: {:?}", phase);
    }

    fn current_best(&self) -> Result<Arc<TrialRecord>, OptimizeError> {
        self.best
            .get()
            .ok_or_else(|| OptimizeError::Task("no trial has been recorded".to_string()))
    }

    fn lock_set<'a>(
        &self,
        set: &'a Mutex<BTreeSet<ExampleId>>,
    ) -> std::sync::MutexGuard<'a, BTreeSet<ExampleId>> {
        set.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn draw_batch(&self, seed: u64) -> (String, Vec<&Example>) {
        let batch = self
            .examples
            .sample(Pool::Validation, self.config.validation_sample_size, seed);
        let mut drawn = self.lock_set(&self.validation_drawn);
        drawn.extend(batch.iter().map(|e| e.id.clone()));
        (format!("validation:{}:{}", seed, batch.len()), batch)
    }

    fn note_demonstrations(&self, state: &PipelineState) {
        let mut used = self.lock_set(&self.demonstrations_used);
        for (_, config) in state.iter() {
            used.extend(config.demonstrations.iter().map(|d| d.example_id.clone()));
        }
    }

    fn check_termination(&self, round: usize, started: Instant) -> Option<TerminationReason> {
        if self
            .best
            .score()
            .is_some_and(|score| score >= self.config.target_score)
        {
            return Some(TerminationReason::TargetReached);
        }
        if self.cancel.is_cancelled() {
            return Some(TerminationReason::Cancelled);
        }
        if let Some(max_calls) = self.config.termination.max_calls {
            if self.meter.count() >= max_calls {
                return Some(TerminationReason::BudgetExhausted(BudgetKind::Calls));
            }
        }
        if let Some(max_wallclock) = self.config.termination.max_wallclock {
            if started.elapsed() >= max_wallclock {
                return Some(TerminationReason::BudgetExhausted(BudgetKind::Wallclock));
            }
        }
        if round >= self.config.max_rounds {
            return Some(TerminationReason::BudgetExhausted(BudgetKind::Rounds));
        }
        None
    }

    async fn evaluate_candidate(
        &self,
        index: usize,
        round: usize,
        state: Arc<PipelineState>,
        batch: &[&Example],
        batch_id: &str,
    ) -> TrialRecord {
        let eval = evaluate_batch(&self.pipeline, &self.policy, &state, batch, self.scorer.as_ref())
            .await;
        self.meter.add(eval.calls);
        debug!(
            "Trial {} (round {}): score {:.4}, {} calls, {} errors",
            index, round, eval.score, eval.calls, eval.errors
        );

        TrialRecord {
            index,
            round,
            state,
            score: eval.score,
            batch_id: batch_id.to_string(),
            cost: TrialCost {
                calls: eval.calls,
                wallclock_ms: eval.wallclock.as_millis() as u64,
            },
            recorded_at: Utc::now(),
            failures: eval.failures,
        }
    }

    /// `calls_per_example` is what one pipeline run cost during the baseline; the
    /// bootstrap sample shrinks to fit the calls left in the budget.
    async fn build_demo_pool(
        &self,
        state: &PipelineState,
        calls_per_example: usize,
    ) -> Result<DemoPool, OptimizeError> {
        if !self.config.demonstration_search {
            return Ok(DemoPool::default());
        }

        let mut sample_size = self.config.bootstrap_sample_size;
        if let Some(max_calls) = self.config.termination.max_calls {
            let left = max_calls.saturating_sub(self.meter.count());
            sample_size = sample_size.min(left / calls_per_example.max(1));
        }

        let traces = if self.config.max_bootstrapped_demos > 0 && sample_size > 0 {
            let sample = self
                .examples
                .sample(Pool::Training, sample_size, self.config.seed);
            bootstrap_traces(
                &self.pipeline,
                &self.policy,
                state,
                &sample,
                self.scorer.as_ref(),
                self.config.bootstrap_threshold,
                self.config.concurrency_limit,
                &self.meter,
            )
            .await
        } else {
            Vec::new()
        };

        let pool = DemoPool::build(&self.examples, &traces)?;
        info!(
            "Demonstration pool: {} labeled, {} bootstrapped traces",
            pool.labeled_count(),
            traces.len()
        );
        Ok(pool)
    }

    /// Rewritten instructions per target stage, seeded by the best trial's failures
    /// and those of last round's under-performing trials
    async fn instruction_rewrites(
        &self,
        best: &TrialRecord,
        round: usize,
    ) -> HashMap<String, String> {
        let mut rewrites = HashMap::new();
        if self.config.instruction_search == InstructionSearch::Off {
            return rewrites;
        }

        let previous = self.log.round(round.saturating_sub(1));
        let mut by_stage: BTreeMap<&str, Vec<FailureExemplar>> = BTreeMap::new();
        let sources = std::iter::once(best)
            .chain(previous.iter().map(|r| r.as_ref()).filter(|r| r.score < best.score));
        for record in sources {
            for failure in &record.failures {
                if let Some(stage) = self
                    .config
                    .target_stages
                    .iter()
                    .find(|s| **s == failure.stage)
                {
                    by_stage.entry(stage.as_str()).or_default().push(failure.clone());
                }
            }
        }

        for (stage, failures) in by_stage {
            let Some(current) = best.state.get(stage) else {
                continue;
            };
            let current = current.instructions.as_str();
            let rewritten = match self.config.instruction_search {
                InstructionSearch::Generated => {
                    match generate_rewrite(
                        self.pipeline.generator().as_ref(),
                        &self.policy,
                        &self.meter,
                        stage,
                        current,
                        &failures,
                    )
                    .await
                    {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Instruction rewrite for {} failed, using heuristic: {}", stage, e);
                            heuristic_rewrite(current, &failures)
                        }
                    }
                }
                _ => heuristic_rewrite(current, &failures),
            };
            if rewritten != current {
                debug!("Round {}: rewrote {} instructions", round, stage);
                rewrites.insert(stage.to_string(), rewritten);
            }
        }
        rewrites
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Dataset;
    use crate::scorer::{FnScorer, TicketScorer};
    use crate::stage::{Demonstration, StageConfig};
    use crate::testing::{example, ScriptedGenerator, SlowGenerator, StaticRetriever};
    use std::collections::HashSet;

    const CATEGORIES: [&str; 4] = ["Technical", "Billing", "Sales", "Feature_Request"];
    const PRIORITIES: [&str; 4] = ["Critical", "High", "Medium", "Low"];

    fn example_set() -> Arc<ExampleSet> {
        let dataset = Dataset {
            description: "support tickets".to_string(),
            version: "1.0".to_string(),
            examples: (0..16)
                .map(|i| example(&format!("ex-{}", i), CATEGORIES[i % 4], PRIORITIES[(i / 2) % 4]))
                .collect(),
        };
        Arc::new(ExampleSet::split(dataset, 0.5, 11).unwrap())
    }

    fn pipeline() -> Arc<Pipeline> {
        Arc::new(Pipeline::new(
            Arc::new(ScriptedGenerator::default()),
            Arc::new(StaticRetriever::default()),
        ))
    }

    fn config() -> OptimizerConfig {
        OptimizerConfig::development()
            .with_seed(7)
            .with_max_rounds(2)
            .with_proposal_budget(3)
            .with_validation_sample_size(6)
            .with_max_retries(0)
    }

    fn optimizer(config: OptimizerConfig) -> Optimizer {
        Optimizer::new(pipeline(), example_set(), Arc::new(TicketScorer::default()), config).unwrap()
    }

    #[tokio::test]
    async fn test_constant_scorer_stops_after_first_round() {
        let optimizer = Optimizer::new(
            pipeline(),
            example_set(),
            Arc::new(FnScorer::new(|_, _| 1.0)),
            config(),
        )
        .unwrap();

        let result = optimizer.run().await.unwrap();
        assert_eq!(result.reason, TerminationReason::TargetReached);
        assert_eq!(result.trials.len(), 1);
        assert_eq!(result.best.index, 0);
        assert_eq!(result.rounds, 0);
        assert_eq!(result.total_calls, result.trials[0].cost.calls);
        assert_eq!(optimizer.phase(), Phase::Terminated);
    }

    #[tokio::test]
    async fn test_best_so_far_is_monotonic_and_improves() {
        let result = optimizer(config()).run().await.unwrap();

        assert_eq!(
            result.reason,
            TerminationReason::BudgetExhausted(BudgetKind::Rounds)
        );
        assert_eq!(result.trials.len(), 1 + 2 * 3);
        for point in &result.history {
            let max_so_far = result
                .trials
                .iter()
                .filter(|t| t.index <= point.after_trial)
                .map(|t| t.score)
                .fold(f32::MIN, f32::max);
            assert!(point.best_score >= max_so_far);
        }
        assert!(result.best.score > result.baseline_score);
        assert!(result.improvement() > 0.0);
    }

    #[tokio::test]
    async fn test_demonstrations_disjoint_from_validation() {
        let result = optimizer(config().with_resample_validation(true))
            .run()
            .await
            .unwrap();

        assert!(!result.demonstration_ids.is_empty());
        assert!(!result.validation_ids.is_empty());
        assert!(result
            .demonstration_ids
            .is_disjoint(&result.validation_ids));
    }

    #[tokio::test]
    async fn test_cancel_after_first_round() {
        let optimizer = optimizer(config().with_max_rounds(5));
        let token = optimizer.cancellation_token();
        let optimizer = optimizer.with_round_observer(move |summary| {
            if summary.round == 1 {
                token.cancel();
            }
        });
        let pipeline = Arc::clone(&optimizer.pipeline);

        let result = optimizer.run().await.unwrap();
        assert_eq!(result.reason, TerminationReason::Cancelled);
        assert_eq!(result.rounds, 1);
        assert_eq!(result.trials.len(), 1 + 3);

        let best_of_round_one = result
            .trials
            .iter()
            .map(|t| t.score)
            .fold(f32::MIN, f32::max);
        assert_eq!(result.best.score, best_of_round_one);
        assert!(result.best.round <= 1);
        assert_eq!(*pipeline.state(), *result.best.state);
    }

    #[tokio::test]
    async fn test_leak_in_installed_state_is_fatal() {
        let examples = example_set();
        let leaked_id = examples.validation()[0].id.clone();
        let pipeline = pipeline();
        let mut state = PipelineState::default_support();
        state
            .set(
                CLASSIFIER,
                StageConfig::new("Classify.").with_demonstrations(vec![Demonstration::new(
                    leaked_id,
                    examples.validation()[0].ticket.to_fields(),
                    crate::testing::fields(json!({
                        "category": "Billing",
                        "priority": "High",
                        "response_type": "Account_Review"
                    })),
                )]),
            )
            .unwrap();
        pipeline.install(state).unwrap();

        let err = Optimizer::new(pipeline, examples, Arc::new(TicketScorer::default()), config())
            .err()
            .unwrap();
        assert!(matches!(err, OptimizeError::ValidationLeak(_)));
    }

    #[tokio::test]
    async fn test_call_budget_exhausted() {
        let result = optimizer(config().with_max_calls(Some(1)))
            .run()
            .await
            .unwrap();
        assert_eq!(
            result.reason,
            TerminationReason::BudgetExhausted(BudgetKind::Calls)
        );
        assert_eq!(result.trials.len(), 1);
        assert!(result.total_calls > 1);
        assert_eq!(result.total_calls, result.trials[0].cost.calls);
    }

    #[tokio::test]
    async fn test_bootstrap_stays_within_call_budget() {
        // baseline: 6 validation examples at 5 calls each
        let result = optimizer(config().with_max_calls(Some(40)))
            .run()
            .await
            .unwrap();
        assert_eq!(result.trials[0].cost.calls, 30);
        assert_eq!(
            result.reason,
            TerminationReason::BudgetExhausted(BudgetKind::Calls)
        );
        assert_eq!(result.trials.len(), 1);
        assert!(result.total_calls <= 40);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_skips_bootstrap() {
        let optimizer = optimizer(config());
        optimizer.cancel();

        let result = optimizer.run().await.unwrap();
        assert_eq!(result.reason, TerminationReason::Cancelled);
        assert_eq!(result.trials.len(), 1);
        assert_eq!(result.total_calls, result.trials[0].cost.calls);
    }

    #[tokio::test]
    async fn test_unknown_labels_do_not_lose_the_run() {
        let dataset = Dataset {
            description: "support tickets".to_string(),
            version: "1.0".to_string(),
            examples: (0..16)
                .map(|i| {
                    let mut e = example(&format!("ex-{}", i), CATEGORIES[i % 4], PRIORITIES[(i / 2) % 4]);
                    if i % 3 == 0 {
                        e.expected.priority = Some("Urgent".to_string());
                    }
                    e
                })
                .collect(),
        };
        let examples = Arc::new(ExampleSet::split(dataset, 0.5, 11).unwrap());
        let pipeline = pipeline();
        let optimizer = Optimizer::new(
            Arc::clone(&pipeline),
            examples,
            Arc::new(TicketScorer::default()),
            config(),
        )
        .unwrap();

        let result = optimizer.run().await.unwrap();
        assert!(result.trials.len() > 1);
        for trial in &result.trials {
            assert!(pipeline.validate_state(&trial.state).is_ok());
        }
        assert_eq!(*pipeline.state(), *result.best.state);
    }

    #[tokio::test]
    async fn test_instructions_never_quote_validation_tickets() {
        let examples = example_set();
        let optimizer = Optimizer::new(
            pipeline(),
            Arc::clone(&examples),
            Arc::new(TicketScorer::default()),
            config().with_demonstration_search(false),
        )
        .unwrap();
        let result = optimizer.run().await.unwrap();

        let instructions: Vec<&str> = result
            .trials
            .iter()
            .flat_map(|t| t.state.iter().map(|(_, c)| c.instructions.as_str()))
            .collect();
        assert!(instructions
            .iter()
            .any(|i| i.contains(instruction::MISTAKES_HEADER)));
        for text in instructions {
            for example in examples.validation() {
                assert!(!text.contains(example.id.as_str()), "{}", text);
                assert!(!text.contains(example.ticket.subject.as_str()), "{}", text);
            }
        }
    }

    #[tokio::test]
    async fn test_wallclock_budget_exhausted() {
        let generator = SlowGenerator::new(ScriptedGenerator::default(), Duration::from_millis(2));
        let pipeline = Arc::new(Pipeline::new(
            Arc::new(generator),
            Arc::new(StaticRetriever::default()),
        ));
        let optimizer = Optimizer::new(
            pipeline,
            example_set(),
            Arc::new(TicketScorer::default()),
            config()
                .with_max_calls(None)
                .with_max_wallclock(Some(Duration::from_millis(1))),
        )
        .unwrap();

        let result = optimizer.run().await.unwrap();
        assert_eq!(
            result.reason,
            TerminationReason::BudgetExhausted(BudgetKind::Wallclock)
        );
        assert_eq!(result.trials.len(), 1);
        assert_eq!(result.rounds, 0);
        assert!(result.elapsed >= Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_concurrency_limit_bounds_calls_in_flight() {
        let generator = Arc::new(SlowGenerator::new(
            ScriptedGenerator::default(),
            Duration::from_millis(2),
        ));
        let pipeline = Arc::new(Pipeline::new(
            Arc::clone(&generator) as Arc<dyn crate::primitives::Generator>,
            Arc::new(StaticRetriever::default()),
        ));
        let optimizer = Optimizer::new(
            pipeline,
            example_set(),
            Arc::new(TicketScorer::default()),
            config().with_concurrency_limit(2).with_max_rounds(1),
        )
        .unwrap();

        let result = optimizer.run().await.unwrap();
        assert_eq!(result.trials.len(), 1 + 3);
        assert_eq!(generator.peak(), 2);
    }

    #[tokio::test]
    async fn test_generated_instruction_search() {
        let config = config()
            .with_demonstration_search(false)
            .with_instruction_search(InstructionSearch::Generated)
            .with_max_rounds(1);
        let result = optimizer(config).run().await.unwrap();

        let instructions = &result.best_state().get(CLASSIFIER).unwrap().instructions;
        assert!(instructions.contains("Read the whole ticket"));
        assert!(result.best.score > result.baseline_score);
        assert!(result.demonstration_ids.is_empty());
    }

    #[tokio::test]
    async fn test_start_result_lifecycle() {
        let optimizer = Arc::new(optimizer(config().with_max_rounds(1)));
        assert!(optimizer.result().is_none());

        let handle = Arc::clone(&optimizer).start();
        let result = handle.await.unwrap().unwrap();

        let stored = optimizer.result().unwrap();
        assert_eq!(stored.run_id, result.run_id);
        assert!(matches!(
            optimizer.run().await,
            Err(OptimizeError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_runs_coexist() {
        let a = optimizer(config().with_seed(1));
        let b = optimizer(config().with_seed(2));
        let (ra, rb) = tokio::join!(a.run(), b.run());
        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert_ne!(ra.run_id, rb.run_id);
        assert_eq!(ra.trials.len(), rb.trials.len());
    }

    #[tokio::test]
    async fn test_trial_log_export() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs").join("trials.json");
        let result = optimizer(config().with_max_rounds(1)).run().await.unwrap();
        result.save_trial_log(&path).unwrap();

        let log: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let trials = log["trials"].as_array().unwrap();
        assert_eq!(trials.len(), result.trials.len());
        let indices: HashSet<u64> = trials.iter().map(|t| t["index"].as_u64().unwrap()).collect();
        assert_eq!(indices.len(), trials.len());
        assert_eq!(log["best_trial"].as_u64().unwrap() as usize, result.best.index);
    }

    #[test]
    fn test_config_validation() {
        assert!(OptimizerConfig::default().validate().is_ok());
        assert!(OptimizerConfig::production().validate().is_ok());
        assert!(matches!(
            OptimizerConfig::default().with_proposal_budget(0).validate(),
            Err(OptimizeError::InvalidConfig(_))
        ));
        assert!(OptimizerConfig::default()
            .with_demonstration_search(false)
            .with_instruction_search(InstructionSearch::Off)
            .validate()
            .is_err());
        let unknown = Optimizer::new(
            pipeline(),
            example_set(),
            Arc::new(TicketScorer::default()),
            config().with_target_stages(["translator"]),
        );
        assert!(matches!(unknown, Err(OptimizeError::InvalidConfig(_))));
    }
}
