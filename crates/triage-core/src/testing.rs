//! Deterministic primitives and fixtures shared by unit tests

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::dataset::{Example, ExampleId, Expected};
use crate::error::{GenerationError, RetrievalError};
use crate::pipeline::Ticket;
use crate::primitives::{GenerationRequest, Generator, Passage, Retriever};
use crate::signature::{
    Fields, CLASSIFIER, KNOWLEDGE_RETRIEVER, PRIORITIES, QUALITY_EVALUATOR, RESPONSE_GENERATOR,
};

pub fn fields(value: Value) -> Fields {
    value.as_object().cloned().expect("fields fixture must be a JSON object")
}

fn response_type_for(category: &str) -> &'static str {
    match category {
        "Billing" => "Account_Review",
        "Sales" => "Information",
        "Feature_Request" => "Product_Feedback",
        _ => "Troubleshooting",
    }
}

/// A labeled example whose text carries enough keywords for `ScriptedGenerator` to classify it
pub fn example(id: &str, category: &str, priority: &str) -> Example {
    let (subject, body) = match category {
        "Billing" => ("Refund request", "I was charged twice, please refund the invoice."),
        "Sales" => ("Pricing question", "What does the enterprise plan cost?"),
        "Feature_Request" => ("Feature idea", "I would love a dark mode feature."),
        _ => ("App crash", "The app crashes on startup."),
    };
    Example {
        id: ExampleId::new(id),
        ticket: Ticket::new(subject, format!("{} Priority {}. Ref {}", body, priority, id)),
        expected: Expected {
            category: Some(category.to_string()),
            priority: Some(priority.to_string()),
            response_type: Some(response_type_for(category).to_string()),
            helpful: Some(true),
        },
    }
}

/// Generator backed by a closure
pub struct FnGenerator<F> {
    f: F,
}

impl<F> FnGenerator<F>
where
    F: Fn(GenerationRequest<'_>) -> Result<Fields, GenerationError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Generator for FnGenerator<F>
where
    F: Fn(GenerationRequest<'_>) -> Result<Fields, GenerationError> + Send + Sync,
{
    async fn generate(&self, request: GenerationRequest<'_>) -> Result<Fields, GenerationError> {
        (self.f)(request)
    }
}

/// Keyword-driven stand-in for the language model.
///
/// The classifier answers "Technical / Medium" for every ticket until its
/// configuration departs from the defaults (new instructions or any
/// demonstrations); after that it classifies by keyword.
#[derive(Default)]
pub struct ScriptedGenerator {
    failing: HashSet<String>,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn failing_stage(mut self, stage: &str) -> Self {
        self.failing.insert(stage.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn respond(&self, request: GenerationRequest<'_>) -> Result<Fields, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let stage = request.signature.name;
        if self.failing.contains(stage) {
            return Err(GenerationError::Transport(format!("{} is down", stage)));
        }
        let input = request.input;
        let get = |key: &str| input.get(key).and_then(Value::as_str).unwrap_or("").to_string();

        let out = match stage {
            CLASSIFIER => {
                let tuned = request.instructions != request.signature.instructions
                    || !request.demonstrations.is_empty();
                let text = format!("{} {}", get("subject"), get("message")).to_lowercase();
                if tuned {
                    let category = classify(&text);
                    json!({
                        "category": category,
                        "priority": PRIORITIES
                            .iter()
                            .find(|p| text.contains(&format!("priority {}", p.to_lowercase())))
                            .copied()
                            .unwrap_or("Medium"),
                        "response_type": response_type_for(category),
                        "reasoning": "keyword match",
                    })
                } else {
                    json!({
                        "category": "Technical",
                        "priority": "Medium",
                        "response_type": "Troubleshooting",
                    })
                }
            }
            KNOWLEDGE_RETRIEVER => {
                let passages = get("passages");
                json!({
                    "relevant_solution": passages.lines().next().unwrap_or("No solution found"),
                    "escalation_needed": passages.contains("escalation required"),
                })
            }
            RESPONSE_GENERATOR => json!({
                "response": format!(
                    "Thanks for contacting us about your {} issue. {}",
                    get("issue_category"),
                    get("solution_info")
                ),
                "confidence": 0.8,
            }),
            QUALITY_EVALUATOR => json!({
                "quality_score": 0.9,
                "is_helpful": true,
                "is_professional": true,
            }),
            "instruction_rewriter" => json!({
                "improved_instruction": format!("{} Read the whole ticket before labeling it.", get("current_instruction")),
            }),
            other => return Err(GenerationError::Malformed(format!("unknown stage {}", other))),
        };
        Ok(fields(out))
    }
}

fn classify(text: &str) -> &'static str {
    if ["refund", "charged", "invoice", "billing"].iter().any(|k| text.contains(k)) {
        "Billing"
    } else if ["pricing", "plan", "cost", "quote"].iter().any(|k| text.contains(k)) {
        "Sales"
    } else if ["feature", "would love", "suggest"].iter().any(|k| text.contains(k)) {
        "Feature_Request"
    } else {
        "Technical"
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, request: GenerationRequest<'_>) -> Result<Fields, GenerationError> {
        self.respond(request)
    }
}

/// Fails the first `failures` calls with a transport error, then delegates
pub struct FlakyGenerator<G> {
    inner: G,
    remaining: Mutex<usize>,
    injected: AtomicUsize,
}

impl<G: Generator> FlakyGenerator<G> {
    pub fn new(inner: G, failures: usize) -> Self {
        Self {
            inner,
            remaining: Mutex::new(failures),
            injected: AtomicUsize::new(0),
        }
    }

    pub fn failures_injected(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<G: Generator> Generator for FlakyGenerator<G> {
    async fn generate(&self, request: GenerationRequest<'_>) -> Result<Fields, GenerationError> {
        let fail = {
            let mut remaining = self.remaining.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                true
            } else {
                false
            }
        };
        if fail {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(GenerationError::Transport("503 Service Unavailable".into()));
        }
        self.inner.generate(request).await
    }
}

/// Sleeps before delegating and records how many calls overlapped
pub struct SlowGenerator<G> {
    inner: G,
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl<G: Generator> SlowGenerator<G> {
    pub fn new(inner: G, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Most calls ever in flight at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<G: Generator> Generator for SlowGenerator<G> {
    async fn generate(&self, request: GenerationRequest<'_>) -> Result<Fields, GenerationError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let result = self.inner.generate(request).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Returns the same passages for every query
pub struct StaticRetriever {
    passages: Vec<Passage>,
}

impl Default for StaticRetriever {
    fn default() -> Self {
        Self {
            passages: vec![Passage {
                text: "Reset the account password from the login page.".to_string(),
                source: Some("Technical/Account Access".to_string()),
                score: 0.8,
            }],
        }
    }
}

#[async_trait]
impl Retriever for StaticRetriever {
    async fn retrieve(&self, _query: &str, k: usize) -> Result<Vec<Passage>, RetrievalError> {
        Ok(self.passages.iter().take(k).cloned().collect())
    }
}
