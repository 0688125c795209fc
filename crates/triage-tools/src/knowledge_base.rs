//! Solution knowledge base
//!
//! Support solutions loaded from a JSON array of
//! `{category, topic, solution, escalation_required}` records and ranked by
//! lexical overlap with the query.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum KnowledgeBaseError {
    #[error("failed to read knowledge base: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse knowledge base: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A single solution entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    pub category: String,
    #[serde(default)]
    pub topic: String,
    pub solution: String,
    #[serde(default)]
    pub escalation_required: bool,
}

/// A ranked lookup result
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub solution: Solution,
    pub score: f32,
}

/// Words too common to say anything about relevance
const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "you", "your", "have", "has", "but", "not",
    "are", "was", "can", "our", "from", "please", "get", "been", "any", "all",
];

#[derive(Debug, Clone, Default)]
pub struct KnowledgeBase {
    solutions: Vec<Solution>,
}

impl KnowledgeBase {
    pub fn new(solutions: Vec<Solution>) -> Self {
        Self { solutions }
    }

    /// The single general-purpose entry used when no knowledge base file exists
    pub fn fallback() -> Self {
        Self::new(vec![Solution {
            category: "Technical".to_string(),
            topic: "General".to_string(),
            solution: "Please try restarting the application and clearing your browser cache. \
                       If the issue persists, our technical team will investigate further."
                .to_string(),
            escalation_required: false,
        }])
    }

    /// Load solutions from a JSON file, falling back to the built-in entry if it is missing
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, KnowledgeBaseError> {
        let path = path.as_ref();
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                let solutions: Vec<Solution> = serde_json::from_str(&content)?;
                debug!("Loaded {} solutions from {}", solutions.len(), path.display());
                Ok(Self::new(solutions))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "Knowledge base {} not found, using fallback entry",
                    path.display()
                );
                Ok(Self::fallback())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn len(&self) -> usize {
        self.solutions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.solutions.is_empty()
    }

    pub fn solutions(&self) -> &[Solution] {
        &self.solutions
    }

    /// Rank solutions against a query and return at most `k` hits with a positive score.
    ///
    /// Ties keep file order so results are stable across calls.
    pub fn search(&self, query: &str, k: usize) -> Vec<SearchHit> {
        let query_terms = tokenize(query);
        if query_terms.is_empty() || k == 0 {
            return Vec::new();
        }
        let query_lower = query.to_lowercase();

        let mut hits: Vec<(usize, SearchHit)> = self
            .solutions
            .iter()
            .enumerate()
            .filter_map(|(idx, solution)| {
                let doc_terms = tokenize(&format!(
                    "{} {} {}",
                    solution.category, solution.topic, solution.solution
                ));
                let overlap = query_terms.intersection(&doc_terms).count() as f32;
                let mut score = overlap / query_terms.len() as f32;
                if query_lower.contains(&solution.category.to_lowercase()) {
                    score += 0.5;
                }
                (score > 0.0).then(|| {
                    (
                        idx,
                        SearchHit {
                            solution: solution.clone(),
                            score,
                        },
                    )
                })
            })
            .collect();

        hits.sort_by(|(ia, a), (ib, b)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(ia.cmp(ib))
        });
        hits.into_iter().take(k).map(|(_, hit)| hit).collect()
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 3)
        .map(|w| w.to_lowercase())
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}
