use anyhow::{Context, Result};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::lm::ChatGenerator;
use crate::optimizer::OptimizerConfig;
use crate::pipeline::Pipeline;
use crate::primitives::{KnowledgeBaseRetriever, Retriever, SearchApiRetriever};

#[derive(Debug, Clone)]
pub struct Config {
    pub llm_api_url: String,
    pub llm_api_key: Option<String>,
    pub llm_model: String,

    /// JSON file of knowledge base solutions (built-in fallback if missing)
    pub knowledge_base_path: String,
    /// If set, retrieve from this search API instead of the local knowledge base
    pub search_api_url: Option<String>,
    pub search_api_key: Option<String>,
    pub retrieval_top_k: usize,

    pub dataset_path: String,
    /// Where the optimized pipeline state is written and loaded from
    pub state_path: String,

    pub http_port: u16,

    // Optimizer overrides, applied on top of the chosen preset
    pub proposal_budget: Option<usize>,
    pub validation_sample_size: Option<usize>,
    pub call_timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub concurrency_limit: Option<usize>,
    pub max_calls: Option<usize>,
    pub max_wallclock_secs: Option<u64>,
    pub max_rounds: Option<usize>,
    pub seed: Option<u64>,
}

fn optional<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{} must be a valid number", name)),
        _ => Ok(None),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            llm_api_url: std::env::var("TRIAGE_LLM_API_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            llm_api_key: std::env::var("TRIAGE_LLM_API_KEY")
                .or_else(|_| std::env::var("OPENAI_API_KEY"))
                .ok(),
            llm_model: std::env::var("TRIAGE_LLM_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),

            knowledge_base_path: std::env::var("TRIAGE_KNOWLEDGE_BASE")
                .unwrap_or_else(|_| "data/knowledge_base.json".to_string()),
            search_api_url: std::env::var("TRIAGE_SEARCH_API_URL").ok(),
            search_api_key: std::env::var("TRIAGE_SEARCH_API_KEY").ok(),
            retrieval_top_k: optional("TRIAGE_RETRIEVAL_TOP_K")?
                .unwrap_or(crate::pipeline::DEFAULT_TOP_K),

            dataset_path: std::env::var("TRIAGE_DATASET")
                .unwrap_or_else(|_| "data/trainset.json".to_string()),
            state_path: std::env::var("TRIAGE_STATE_PATH")
                .unwrap_or_else(|_| "optimized_state/latest.json".to_string()),

            http_port: std::env::var("HTTP_PORT")
                .unwrap_or_else(|_| "8000".to_string())
                .parse()
                .context("HTTP_PORT must be a valid port number")?,

            proposal_budget: optional("TRIAGE_PROPOSAL_BUDGET")?,
            validation_sample_size: optional("TRIAGE_VALIDATION_SAMPLE_SIZE")?,
            call_timeout_secs: optional("TRIAGE_CALL_TIMEOUT_SECS")?,
            max_retries: optional("TRIAGE_MAX_RETRIES")?,
            concurrency_limit: optional("TRIAGE_CONCURRENCY_LIMIT")?,
            max_calls: optional("TRIAGE_MAX_CALLS")?,
            max_wallclock_secs: optional("TRIAGE_MAX_WALLCLOCK_SECS")?,
            max_rounds: optional("TRIAGE_MAX_ROUNDS")?,
            seed: optional("TRIAGE_SEED")?,
        })
    }

    /// Wire the chat generator and the configured retriever into a pipeline
    pub async fn build_pipeline(&self) -> Result<Pipeline> {
        let generator = ChatGenerator::new(&self.llm_api_url, self.llm_api_key.clone(), &self.llm_model);

        let retriever: Arc<dyn Retriever> = match &self.search_api_url {
            Some(url) => {
                info!("Retrieval: search API at {}", url);
                let client = triage_tools::SearchClient::new(url, self.search_api_key.clone())
                    .context("failed to create search client")?;
                Arc::new(SearchApiRetriever::new(client))
            }
            None => {
                let kb = triage_tools::KnowledgeBase::load(&self.knowledge_base_path)
                    .await
                    .with_context(|| {
                        format!("failed to load knowledge base {}", self.knowledge_base_path)
                    })?;
                info!("Retrieval: knowledge base with {} solutions", kb.len());
                Arc::new(KnowledgeBaseRetriever::new(kb))
            }
        };

        let policy = self.optimizer_config(OptimizerConfig::default()).retry_policy();
        Ok(Pipeline::new(Arc::new(generator), retriever)
            .with_top_k(self.retrieval_top_k)
            .with_retry_policy(policy))
    }

    /// Apply the environment overrides to an optimizer preset
    pub fn optimizer_config(&self, base: OptimizerConfig) -> OptimizerConfig {
        let mut config = base;
        if let Some(v) = self.proposal_budget {
            config.proposal_budget = v;
        }
        if let Some(v) = self.validation_sample_size {
            config.validation_sample_size = v;
        }
        if let Some(v) = self.call_timeout_secs {
            config.call_timeout = Duration::from_secs(v);
        }
        if let Some(v) = self.max_retries {
            config.max_retries = v;
        }
        if let Some(v) = self.concurrency_limit {
            config.concurrency_limit = v;
        }
        if let Some(v) = self.max_calls {
            config.termination.max_calls = Some(v);
        }
        if let Some(v) = self.max_wallclock_secs {
            config.termination.max_wallclock = Some(Duration::from_secs(v));
        }
        if let Some(v) = self.max_rounds {
            config.max_rounds = v;
        }
        if let Some(v) = self.seed {
            config.seed = v;
        }
        config
    }
}
