//! The support pipeline: classifier -> knowledge retriever -> response generator -> quality evaluator
//!
//! Stage wiring is fixed. What changes between runs is the installed
//! `PipelineState`, swapped atomically by `install`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use crate::error::{OptimizeError, PipelineError, RetrievalError, StageError};
use crate::primitives::{format_passages, Generator, Passage, Retriever};
use crate::retry::{CallMeter, RetryPolicy};
use crate::signature::{
    knowledge_retriever, quality_evaluator, response_generator, ticket_classifier, Fields,
    CLASSIFIER, KNOWLEDGE_RETRIEVER, QUALITY_EVALUATOR, RESPONSE_GENERATOR,
};
use crate::stage::{Stage, StageConfig};

/// Version tag of the persisted state format
pub const STATE_FORMAT_VERSION: u32 = 1;

/// Default number of passages handed to the knowledge retriever stage
pub const DEFAULT_TOP_K: usize = 3;

/// An incoming support ticket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub subject: String,
    pub message: String,
}

impl Ticket {
    pub fn new(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            message: message.into(),
        }
    }

    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("subject".to_string(), Value::String(self.subject.clone()));
        fields.insert("message".to_string(), Value::String(self.message.clone()));
        fields
    }

    pub fn issue_description(&self) -> String {
        format!("{}\n{}", self.subject, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StateEntry {
    name: String,
    #[serde(flatten)]
    config: StageConfig,
}

/// Stage name -> configuration, in execution order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    version: u32,
    stages: Vec<StateEntry>,
}

impl PipelineState {
    pub fn new<I, S>(stages: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = (S, StageConfig)>,
        S: Into<String>,
    {
        let mut entries: Vec<StateEntry> = Vec::new();
        for (name, config) in stages {
            let name = name.into();
            if entries.iter().any(|e| e.name == name) {
                return Err(format!("duplicate stage '{}'", name));
            }
            entries.push(StateEntry { name, config });
        }
        Ok(Self {
            version: STATE_FORMAT_VERSION,
            stages: entries,
        })
    }

    /// Default instructions for every support stage, no demonstrations
    pub fn default_support() -> Self {
        Self {
            version: STATE_FORMAT_VERSION,
            stages: support_stages()
                .into_iter()
                .map(|stage| StateEntry {
                    name: stage.name().to_string(),
                    config: stage.default_config(),
                })
                .collect(),
        }
    }

    pub fn get(&self, stage: &str) -> Option<&StageConfig> {
        self.stages
            .iter()
            .find(|e| e.name == stage)
            .map(|e| &e.config)
    }

    pub fn get_mut(&mut self, stage: &str) -> Option<&mut StageConfig> {
        self.stages
            .iter_mut()
            .find(|e| e.name == stage)
            .map(|e| &mut e.config)
    }

    /// Replace the configuration of an existing stage
    pub fn set(&mut self, stage: &str, config: StageConfig) -> Result<(), String> {
        match self.stages.iter_mut().find(|e| e.name == stage) {
            Some(entry) => {
                entry.config = config;
                Ok(())
            }
            None => Err(format!("unknown stage '{}'", stage)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StageConfig)> {
        self.stages.iter().map(|e| (e.name.as_str(), &e.config))
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn demonstration_count(&self) -> usize {
        self.stages.iter().map(|e| e.config.demonstrations.len()).sum()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let state: PipelineState =
            serde_json::from_str(content).context("failed to parse pipeline state")?;
        if state.version != STATE_FORMAT_VERSION {
            anyhow::bail!(
                "unsupported pipeline state version {} (expected {})",
                state.version,
                STATE_FORMAT_VERSION
            );
        }
        Ok(state)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)
            .with_context(|| format!("failed to write pipeline state {}", path.display()))?;
        Ok(())
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read pipeline state {}", path.display()))?;
        Self::from_json(&content)
    }
}

fn support_stages() -> Vec<Stage> {
    vec![
        Stage::new(ticket_classifier()),
        Stage::new(knowledge_retriever()),
        Stage::new(response_generator()),
        Stage::new(quality_evaluator()),
    ]
}

/// One stage's input and output during a run
#[derive(Debug, Clone, PartialEq)]
pub struct StageTrace {
    pub stage: String,
    pub input: Fields,
    pub output: Fields,
}

/// Final pipeline response for a ticket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub category: String,
    pub priority: String,
    pub response_type: String,
    pub classification_reasoning: String,
    pub solution_info: String,
    pub escalation_needed: bool,
    pub response: String,
    pub response_confidence: f64,
    pub quality_score: f64,
    pub is_helpful: bool,
    pub is_professional: bool,
    pub improvement_suggestions: String,
}

/// Output plus the per-stage trace and primitive call count of one run
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub output: PipelineOutput,
    pub trace: Vec<StageTrace>,
    pub calls: usize,
}

impl PipelineRun {
    pub fn trace_for(&self, stage: &str) -> Option<&StageTrace> {
        self.trace.iter().find(|t| t.stage == stage)
    }
}

pub struct Pipeline {
    stages: Vec<Stage>,
    generator: Arc<dyn Generator>,
    retriever: Arc<dyn Retriever>,
    policy: RetryPolicy,
    top_k: usize,
    state: RwLock<Arc<PipelineState>>,
}

impl Pipeline {
    pub fn new(generator: Arc<dyn Generator>, retriever: Arc<dyn Retriever>) -> Self {
        Self {
            stages: support_stages(),
            generator,
            retriever,
            policy: RetryPolicy::default(),
            top_k: DEFAULT_TOP_K,
            state: RwLock::new(Arc::new(PipelineState::default_support())),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name() == name)
    }

    pub fn generator(&self) -> &Arc<dyn Generator> {
        &self.generator
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Snapshot of the installed state
    pub fn state(&self) -> Arc<PipelineState> {
        let guard = self.state.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Check that a state names exactly this pipeline's stages, in order, with valid demonstrations
    pub fn validate_state(&self, state: &PipelineState) -> Result<(), OptimizeError> {
        let expected: Vec<&str> = self.stages.iter().map(|s| s.name()).collect();
        let actual = state.stage_names();
        if expected != actual {
            return Err(OptimizeError::StateMismatch(format!(
                "expected stages {:?}, got {:?}",
                expected, actual
            )));
        }
        for stage in &self.stages {
            if let Some(config) = state.get(stage.name()) {
                config
                    .validate(stage.signature())
                    .map_err(|e| OptimizeError::StateMismatch(format!("{}: {}", stage.name(), e)))?;
            }
        }
        Ok(())
    }

    /// Atomically replace the installed state
    pub fn install(&self, state: PipelineState) -> Result<(), OptimizeError> {
        self.validate_state(&state)?;
        let demos = state.demonstration_count();
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(state);
        info!("Installed pipeline state ({} demonstrations)", demos);
        Ok(())
    }

    /// Run a ticket against the installed state
    pub async fn run(&self, ticket: &Ticket) -> Result<PipelineRun, PipelineError> {
        let state = self.state();
        self.run_with(&state, ticket).await
    }

    /// Run a ticket against an explicit state without installing it
    pub async fn run_with(
        &self,
        state: &PipelineState,
        ticket: &Ticket,
    ) -> Result<PipelineRun, PipelineError> {
        let meter = CallMeter::new();
        self.run_metered(state, ticket, &meter).await
    }

    /// Run a ticket, recording every primitive attempt in `meter`
    pub async fn run_metered(
        &self,
        state: &PipelineState,
        ticket: &Ticket,
        meter: &CallMeter,
    ) -> Result<PipelineRun, PipelineError> {
        self.run_with_policy(state, ticket, meter, &self.policy).await
    }

    /// Like `run_metered`, but with a caller-supplied retry policy
    pub async fn run_with_policy(
        &self,
        state: &PipelineState,
        ticket: &Ticket,
        meter: &CallMeter,
        policy: &RetryPolicy,
    ) -> Result<PipelineRun, PipelineError> {
        let start_calls = meter.count();
        let mut trace = Vec::with_capacity(self.stages.len());

        let classification = self
            .run_stage(state, CLASSIFIER, ticket.to_fields(), meter, policy, &mut trace)
            .await?;
        let category = text(&classification, "category");

        let issue_description = ticket.issue_description();
        let passages = self.retrieve(&issue_description, meter, policy).await?;

        let knowledge = self
            .run_stage(
                state,
                KNOWLEDGE_RETRIEVER,
                fields(json!({
                    "category": category,
                    "issue_description": issue_description,
                    "passages": format_passages(&passages),
                })),
                meter,
                policy,
                &mut trace,
            )
            .await?;
        let escalation_needed = boolean(&knowledge, "escalation_needed");

        let generated = self
            .run_stage(
                state,
                RESPONSE_GENERATOR,
                fields(json!({
                    "customer_message": ticket.message,
                    "issue_category": category,
                    "priority_level": text(&classification, "priority"),
                    "solution_info": text(&knowledge, "relevant_solution"),
                    "escalation_needed": escalation_needed,
                })),
                meter,
                policy,
                &mut trace,
            )
            .await?;

        let quality = self
            .run_stage(
                state,
                QUALITY_EVALUATOR,
                fields(json!({
                    "original_message": ticket.message,
                    "generated_response": text(&generated, "response"),
                })),
                meter,
                policy,
                &mut trace,
            )
            .await?;

        let output = PipelineOutput {
            category,
            priority: text(&classification, "priority"),
            response_type: text(&classification, "response_type"),
            classification_reasoning: text(&classification, "reasoning"),
            solution_info: text(&knowledge, "relevant_solution"),
            escalation_needed,
            response: text(&generated, "response"),
            response_confidence: number(&generated, "confidence"),
            quality_score: number(&quality, "quality_score"),
            is_helpful: boolean(&quality, "is_helpful"),
            is_professional: boolean(&quality, "is_professional"),
            improvement_suggestions: text(&quality, "suggestions"),
        };

        Ok(PipelineRun {
            output,
            trace,
            calls: meter.count() - start_calls,
        })
    }

    async fn run_stage(
        &self,
        state: &PipelineState,
        name: &str,
        input: Fields,
        meter: &CallMeter,
        policy: &RetryPolicy,
        trace: &mut Vec<StageTrace>,
    ) -> Result<Fields, PipelineError> {
        let stage = self.stage(name).ok_or_else(|| missing_config(name))?;
        let config = state.get(name).ok_or_else(|| missing_config(name))?;
        let generator = self.generator.as_ref();
        let input_ref = &input;

        let attempted = policy
            .call(name, meter, move || stage.execute(config, generator, input_ref))
            .await?;
        if attempted.retries() > 0 {
            debug!("Stage {} succeeded after {} retries", name, attempted.retries());
        }

        trace.push(StageTrace {
            stage: name.to_string(),
            input: input.clone(),
            output: attempted.value.clone(),
        });
        Ok(attempted.value)
    }

    async fn retrieve(
        &self,
        query: &str,
        meter: &CallMeter,
        policy: &RetryPolicy,
    ) -> Result<Vec<Passage>, PipelineError> {
        let retriever = self.retriever.as_ref();
        let k = self.top_k;

        let attempted = policy
            .call(KNOWLEDGE_RETRIEVER, meter, move || async move {
                retriever
                    .retrieve(query, k)
                    .await
                    .map_err(|e: RetrievalError| StageError::UpstreamUnavailable {
                        stage: KNOWLEDGE_RETRIEVER.to_string(),
                        attempts: 1,
                        detail: e.to_string(),
                    })
            })
            .await?;
        Ok(attempted.value)
    }
}

fn missing_config(stage: &str) -> PipelineError {
    StageError::InvalidInput {
        stage: stage.to_string(),
        detail: "no configuration for stage".to_string(),
    }
    .into()
}

fn fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        _ => Fields::new(),
    }
}

fn text(fields: &Fields, key: &str) -> String {
    match fields.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn boolean(fields: &Fields, key: &str) -> bool {
    fields.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn number(fields: &Fields, key: &str) -> f64 {
    fields.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}
