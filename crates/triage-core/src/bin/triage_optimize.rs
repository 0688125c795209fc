//! Optimization CLI for the triage pipeline
//!
//! Searches stage instructions and demonstrations against a labeled dataset
//! and writes the best pipeline state where the `triage` service loads it.
//!
//! Usage:
//!   cargo run --bin triage-optimize -- --eval              (score the installed state)
//!   cargo run --bin triage-optimize -- --optimize          (run the optimizer)
//!   cargo run --bin triage-optimize -- --optimize --dev    (small budgets for a quick run)

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use triage_core::optimizer::{evaluate_batch, RoundSummary};
use triage_core::{
    Config, Dataset, Example, ExampleSet, Optimizer, OptimizerConfig, Pipeline, PipelineState,
    TicketScorer,
};

/// Share of the dataset held out for scoring candidates
const VALIDATION_FRACTION: f32 = 0.3;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "triage=info,warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    if args.iter().any(|a| a == "--optimize") {
        let preset = if args.iter().any(|a| a == "--dev") {
            OptimizerConfig::development()
        } else if args.iter().any(|a| a == "--production") {
            OptimizerConfig::production()
        } else {
            OptimizerConfig::default()
        };
        rt.block_on(run_optimization(preset))
    } else {
        rt.block_on(run_evaluation())
    }
}

// ============================================================================
// Setup shared by both modes
// ============================================================================

struct Setup {
    config: Config,
    pipeline: Arc<Pipeline>,
    examples: Arc<ExampleSet>,
}

async fn setup() -> Result<Setup> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    println!("Program LM: {} @ {}", config.llm_model, config.llm_api_url);

    let pipeline = Arc::new(config.build_pipeline().await?);

    let dataset = Dataset::load_from_file(&config.dataset_path)?;
    println!(
        "Dataset: {} ({} examples, version {})",
        config.dataset_path,
        dataset.examples.len(),
        dataset.version
    );

    let seed = config.seed.unwrap_or(OptimizerConfig::default().seed);
    let examples = ExampleSet::split(dataset, VALIDATION_FRACTION, seed)?;
    println!(
        "Training pool: {}, validation pool: {}\n",
        examples.training().len(),
        examples.validation().len()
    );

    Ok(Setup {
        config,
        pipeline,
        examples: Arc::new(examples),
    })
}

fn status(score: f32) -> &'static str {
    if score >= 0.8 {
        "✓"
    } else if score >= 0.5 {
        "~"
    } else {
        "✗"
    }
}

// ============================================================================
// Evaluation
// ============================================================================

async fn run_evaluation() -> Result<()> {
    println!("=== Triage Pipeline Evaluation ===\n");

    let Setup {
        config,
        pipeline,
        examples,
    } = setup().await?;

    if Path::new(&config.state_path).exists() {
        pipeline.install(PipelineState::load_from_file(&config.state_path)?)?;
        println!("Installed state from {}", config.state_path);
    } else {
        println!("No saved state at {}, scoring defaults", config.state_path);
    }
    examples.check_state(&pipeline.state())?;

    let scorer = TicketScorer::default();
    let policy = config
        .optimizer_config(OptimizerConfig::default())
        .retry_policy();
    let state = pipeline.state();

    let mut total = 0.0f32;
    for example in examples.validation() {
        let batch: [&Example; 1] = [example];
        let eval = evaluate_batch(&pipeline, &policy, &state, &batch, &scorer).await;
        total += eval.score;

        let subject: String = example.ticket.subject.chars().take(50).collect();
        match eval.failures.first() {
            Some(failure) if eval.errors > 0 => {
                println!("✗ [0.00] {} - {}", subject, failure.feedback)
            }
            _ => println!("{} [{:.2}] {}", status(eval.score), eval.score, subject),
        }
    }

    let n = examples.validation().len().max(1);
    println!("\n=== Results ===");
    println!("Average score: {:.3}", total / n as f32);
    println!("\nRun with --optimize to search for a better state");

    Ok(())
}

// ============================================================================
// Optimization
// ============================================================================

async fn run_optimization(preset: OptimizerConfig) -> Result<()> {
    println!("=== Triage Pipeline Optimization ===\n");

    let Setup {
        config,
        pipeline,
        examples,
    } = setup().await?;

    let optimizer_config = config.optimizer_config(preset);
    println!(
        "Proposal budget: {}, validation sample: {}, concurrency: {}",
        optimizer_config.proposal_budget,
        optimizer_config.validation_sample_size,
        optimizer_config.concurrency_limit
    );
    println!(
        "Budget: {:?} calls, {:?} wall clock, {} rounds\n",
        optimizer_config.termination.max_calls,
        optimizer_config.termination.max_wallclock,
        optimizer_config.max_rounds
    );

    let optimizer = Optimizer::new(
        pipeline,
        examples,
        Arc::new(TicketScorer::default()),
        optimizer_config,
    )?
    .with_round_observer(|summary: &RoundSummary| {
        println!("--- Round {} ---", summary.round);
        for trial in &summary.trials {
            println!(
                "  {} trial {:>3} [{:.3}] {} calls, {} demos",
                status(trial.score),
                trial.index,
                trial.score,
                trial.cost.calls,
                trial.state.demonstration_count()
            );
        }
        println!(
            "  best: trial {} [{:.3}] ({} calls, {:.1}s elapsed)",
            summary.best.index,
            summary.best.score,
            summary.total_calls,
            summary.elapsed.as_secs_f32()
        );
    });
    let optimizer = Arc::new(optimizer);
    println!("Run {}", optimizer.run_id());

    // Ctrl-C stops proposing new rounds; the best state so far is still saved
    let token = optimizer.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nCancelling after the current round...");
            token.cancel();
        }
    });

    let result = optimizer.start().await??;

    println!("\n=== Results ===");
    println!("Stopped: {:?}", result.reason);
    println!("Baseline score: {:.3}", result.baseline_score);
    println!(
        "Best score: {:.3} (trial {}, {:+.3})",
        result.best.score,
        result.best.index,
        result.improvement()
    );
    println!(
        "Trials: {}, rounds: {}, calls: {}, elapsed: {:.1}s",
        result.trials.len(),
        result.rounds,
        result.total_calls,
        result.elapsed.as_secs_f32()
    );

    result.best_state().save_to_file(&config.state_path)?;
    println!("\nSaved best state to {}", config.state_path);

    let log_path = Path::new(&config.state_path).with_extension("trials.json");
    result.save_trial_log(&log_path)?;
    println!("Saved trial log to {}", log_path.display());

    Ok(())
}
