//! Labeled ticket datasets and the training/validation example set

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use tracing::warn;

use crate::error::LeakError;
use crate::pipeline::{PipelineState, Ticket};
use crate::signature::{ticket_classifier, FieldKind, CATEGORIES, CLASSIFIER, PRIORITIES, RESPONSE_TYPES};
use crate::stage::Demonstration;

/// Stable identifier of a labeled example
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExampleId(String);

impl ExampleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExampleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ground-truth labels for a ticket. Absent labels are not scored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Expected {
    #[serde(default, rename = "expected_category")]
    pub category: Option<String>,
    #[serde(default, rename = "expected_priority")]
    pub priority: Option<String>,
    #[serde(default, rename = "expected_response_type")]
    pub response_type: Option<String>,
    #[serde(default, rename = "expected_helpful")]
    pub helpful: Option<bool>,
}

impl Expected {
    /// Rewrite labels into the spelling the classifier emits ("billing" -> "Billing").
    ///
    /// Labels outside the known choices are kept as written.
    pub fn normalized(mut self) -> Self {
        for (label, choices) in [
            (&mut self.category, CATEGORIES),
            (&mut self.priority, PRIORITIES),
            (&mut self.response_type, RESPONSE_TYPES),
        ] {
            let Some(raw) = label.as_deref() else {
                continue;
            };
            if let Ok(Value::String(canonical)) =
                FieldKind::Choice(choices).coerce(&Value::String(raw.to_string()))
            {
                *label = Some(canonical);
            }
        }
        self
    }
}

/// A labeled ticket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub id: ExampleId,
    #[serde(flatten)]
    pub ticket: Ticket,
    #[serde(flatten)]
    pub expected: Expected,
}

/// Dataset file contents
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Dataset {
    pub description: String,
    pub version: String,
    pub examples: Vec<Example>,
}

impl Dataset {
    /// Load dataset from a JSON file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read dataset {}", path.display()))?;
        let dataset: Dataset = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse dataset {}", path.display()))?;
        Ok(dataset)
    }

    /// Save dataset to a JSON file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get examples by expected category
    pub fn filter_by_category(&self, category: &str) -> Vec<&Example> {
        self.examples
            .iter()
            .filter(|e| e.expected.category.as_deref() == Some(category))
            .collect()
    }

    /// Get all unique expected categories
    pub fn categories(&self) -> Vec<String> {
        let mut cats: Vec<String> = self
            .examples
            .iter()
            .filter_map(|e| e.expected.category.clone())
            .collect();
        cats.sort();
        cats.dedup();
        cats
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pool {
    Training,
    Validation,
}

/// Examples partitioned into a training pool (demonstration source) and a
/// validation pool (scoring only). Identifiers are unique across both pools.
#[derive(Debug, Clone)]
pub struct ExampleSet {
    training: Vec<Example>,
    validation: Vec<Example>,
    membership: HashMap<ExampleId, Pool>,
}

impl ExampleSet {
    /// Labels are normalized on the way in.
    pub fn new(training: Vec<Example>, validation: Vec<Example>) -> Result<Self, LeakError> {
        let normalize = |examples: Vec<Example>| -> Vec<Example> {
            examples
                .into_iter()
                .map(|e| Example {
                    expected: e.expected.normalized(),
                    ..e
                })
                .collect()
        };
        let (training, validation) = (normalize(training), normalize(validation));

        let mut membership = HashMap::new();
        for (pool, examples) in [(Pool::Training, &training), (Pool::Validation, &validation)] {
            for example in examples {
                if let Some(existing) = membership.insert(example.id.clone(), pool) {
                    return Err(if existing == pool {
                        LeakError::DuplicateIdentifier(example.id.to_string())
                    } else {
                        LeakError::SharedIdentifier(example.id.to_string())
                    });
                }
            }
        }

        Ok(Self {
            training,
            validation,
            membership,
        })
    }

    /// Shuffle a dataset with `seed` and hold out `validation_fraction` of it.
    ///
    /// With two or more examples both pools receive at least one.
    pub fn split(dataset: Dataset, validation_fraction: f32, seed: u64) -> Result<Self, LeakError> {
        let mut examples = dataset.examples;
        let mut rng = StdRng::seed_from_u64(seed);
        examples.shuffle(&mut rng);

        let n = examples.len();
        let mut n_val = (n as f32 * validation_fraction.clamp(0.0, 1.0)).round() as usize;
        if n >= 2 {
            n_val = n_val.clamp(1, n - 1);
        }
        let training = examples.split_off(n_val.min(n));
        Self::new(training, examples)
    }

    pub fn training(&self) -> &[Example] {
        &self.training
    }

    pub fn validation(&self) -> &[Example] {
        &self.validation
    }

    pub fn pool(&self, pool: Pool) -> &[Example] {
        match pool {
            Pool::Training => &self.training,
            Pool::Validation => &self.validation,
        }
    }

    pub fn pool_of(&self, id: &ExampleId) -> Option<Pool> {
        self.membership.get(id).copied()
    }

    pub fn validation_ids(&self) -> HashSet<&ExampleId> {
        self.validation.iter().map(|e| &e.id).collect()
    }

    /// Draw `n` distinct examples from `pool` (all of them if `n` exceeds its size).
    ///
    /// Identical `(pool, n, seed)` always yields the identical sequence.
    pub fn sample(&self, pool: Pool, n: usize, seed: u64) -> Vec<&Example> {
        let examples = self.pool(pool);
        let mut rng = StdRng::seed_from_u64(seed);
        rand::seq::index::sample(&mut rng, examples.len(), n.min(examples.len()))
            .into_iter()
            .map(|i| &examples[i])
            .collect()
    }

    /// Build a classifier demonstration straight from a training example's labels.
    ///
    /// Returns `Ok(None)` when the example lacks a label the classifier needs or
    /// carries one outside the classifier's choices.
    pub fn labeled_demonstration(&self, id: &ExampleId) -> Result<Option<Demonstration>, LeakError> {
        let example = match self.demonstration_source(id, CLASSIFIER)? {
            Some(example) => example,
            None => return Ok(None),
        };
        let expected = &example.expected;
        let (Some(category), Some(priority), Some(response_type)) = (
            expected.category.as_ref(),
            expected.priority.as_ref(),
            expected.response_type.as_ref(),
        ) else {
            return Ok(None);
        };

        let input = example.ticket.to_fields();
        let raw = json!({
            "category": category,
            "priority": priority,
            "response_type": response_type,
        });
        let raw = raw.as_object().cloned().unwrap_or_default();
        let output = match ticket_classifier().coerce_outputs(&raw) {
            Ok(output) => output,
            Err(e) => {
                warn!("Skipping labeled demonstration {}: {}", example.id, e);
                return Ok(None);
            }
        };
        Ok(Some(Demonstration::new(example.id.clone(), input, output)))
    }

    /// Look up a training example for use as demonstration content.
    ///
    /// Validation examples are rejected with a leak error; unknown ids yield `None`.
    pub fn demonstration_source(
        &self,
        id: &ExampleId,
        stage: &str,
    ) -> Result<Option<&Example>, LeakError> {
        match self.pool_of(id) {
            Some(Pool::Validation) => Err(LeakError::Demonstration {
                example_id: id.to_string(),
                stage: stage.to_string(),
            }),
            Some(Pool::Training) => Ok(self.training.iter().find(|e| &e.id == id)),
            None => Ok(None),
        }
    }

    /// Reject any pipeline state whose demonstrations come from the validation pool
    pub fn check_state(&self, state: &PipelineState) -> Result<(), LeakError> {
        for (stage, config) in state.iter() {
            for demo in &config.demonstrations {
                if self.pool_of(&demo.example_id) == Some(Pool::Validation) {
                    return Err(LeakError::Demonstration {
                        example_id: demo.example_id.to_string(),
                        stage: stage.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}
