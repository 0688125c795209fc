//! Capability interfaces for the external primitives
//!
//! The pipeline only talks to text generation and knowledge retrieval through
//! these traits, so both can be swapped for deterministic implementations.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{GenerationError, RetrievalError};
use crate::signature::{Fields, Signature};
use crate::stage::Demonstration;

/// Everything the generation primitive needs for one call
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub signature: &'a Signature,
    pub instructions: &'a str,
    pub demonstrations: &'a [Demonstration],
    pub input: &'a Fields,
}

#[async_trait]
pub trait Generator: Send + Sync {
    /// Produce output fields for the request's signature
    async fn generate(&self, request: GenerationRequest<'_>) -> Result<Fields, GenerationError>;
}

/// A ranked retrieval result
#[derive(Debug, Clone, PartialEq)]
pub struct Passage {
    pub text: String,
    pub source: Option<String>,
    pub score: f32,
}

impl Passage {
    pub fn new(text: impl Into<String>, score: f32) -> Self {
        Self {
            text: text.into(),
            source: None,
            score,
        }
    }
}

#[async_trait]
pub trait Retriever: Send + Sync {
    /// Return at most `k` passages, best first
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<Passage>, RetrievalError>;
}

/// Retrieval over the local solution knowledge base
pub struct KnowledgeBaseRetriever {
    kb: Arc<triage_tools::KnowledgeBase>,
}

impl KnowledgeBaseRetriever {
    pub fn new(kb: triage_tools::KnowledgeBase) -> Self {
        Self { kb: Arc::new(kb) }
    }
}

#[async_trait]
impl Retriever for KnowledgeBaseRetriever {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<Passage>, RetrievalError> {
        Ok(self
            .kb
            .search(query, k)
            .into_iter()
            .map(|hit| {
                let escalation = if hit.solution.escalation_required {
                    " (escalation required)"
                } else {
                    ""
                };
                Passage {
                    text: format!("{}{}", hit.solution.solution, escalation),
                    source: Some(format!("{}/{}", hit.solution.category, hit.solution.topic)),
                    score: hit.score,
                }
            })
            .collect())
    }
}

/// Retrieval through the remote search API
pub struct SearchApiRetriever {
    client: triage_tools::SearchClient,
}

impl SearchApiRetriever {
    pub fn new(client: triage_tools::SearchClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Retriever for SearchApiRetriever {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<Passage>, RetrievalError> {
        let passages = self
            .client
            .search(query, k)
            .await
            .map_err(|e| RetrievalError::Backend(e.to_string()))?;

        Ok(passages
            .into_iter()
            .map(|p| Passage {
                text: p.format(),
                source: p.title,
                score: p.score.unwrap_or(0.0),
            })
            .collect())
    }
}

/// Render passages as the text handed to the retriever-consumer stage
pub fn format_passages(passages: &[Passage]) -> String {
    if passages.is_empty() {
        return "No relevant passages found.".to_string();
    }
    passages
        .iter()
        .enumerate()
        .map(|(i, p)| match &p.source {
            Some(source) => format!("[{}] ({}) {}", i + 1, source, p.text),
            None => format!("[{}] {}", i + 1, p.text),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use triage_tools::{KnowledgeBase, Solution};

    #[tokio::test]
    async fn test_knowledge_base_retriever() {
        let retriever = KnowledgeBaseRetriever::new(KnowledgeBase::new(vec![Solution {
            category: "Billing".to_string(),
            topic: "Refunds".to_string(),
            solution: "Refunds are issued within five business days.".to_string(),
            escalation_required: true,
        }]));

        let passages = retriever.retrieve("refund for billing", 3).await.unwrap();
        assert_eq!(passages.len(), 1);
        assert_eq!(passages[0].source.as_deref(), Some("Billing/Refunds"));
        assert!(passages[0].text.ends_with("(escalation required)"));
    }

    #[test]
    fn test_format_passages() {
        assert_eq!(format_passages(&[]), "No relevant passages found.");
        let text = format_passages(&[Passage::new("Restart the app", 0.4)]);
        assert_eq!(text, "[1] Restart the app");
    }
}
