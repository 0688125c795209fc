//! Pipeline stages and their editable configuration

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dataset::ExampleId;
use crate::error::{GenerationError, StageError};
use crate::primitives::{GenerationRequest, Generator};
use crate::signature::{Fields, Signature};

/// A labeled input/output pair steering a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Demonstration {
    /// Training example the pair was derived from
    pub example_id: ExampleId,
    pub input: Fields,
    pub output: Fields,
}

impl Demonstration {
    pub fn new(example_id: ExampleId, input: Fields, output: Fields) -> Self {
        Self {
            example_id,
            input,
            output,
        }
    }
}

/// Instructions plus demonstrations driving one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub instructions: String,
    #[serde(default)]
    pub demonstrations: Vec<Demonstration>,
}

impl StageConfig {
    pub fn new(instructions: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
            demonstrations: Vec::new(),
        }
    }

    pub fn with_demonstrations(mut self, demonstrations: Vec<Demonstration>) -> Self {
        self.demonstrations = demonstrations;
        self
    }

    /// Check every demonstration against the stage schema
    pub fn validate(&self, signature: &Signature) -> Result<(), String> {
        for demo in &self.demonstrations {
            signature
                .coerce_inputs(&demo.input)
                .map_err(|e| format!("demonstration '{}' input: {}", demo.example_id, e))?;
            signature
                .coerce_outputs(&demo.output)
                .map_err(|e| format!("demonstration '{}' output: {}", demo.example_id, e))?;
        }
        Ok(())
    }
}

/// A named text-transformation unit backed by the generation primitive
#[derive(Debug, Clone)]
pub struct Stage {
    signature: Signature,
}

impl Stage {
    pub fn new(signature: Signature) -> Self {
        Self { signature }
    }

    pub fn name(&self) -> &str {
        self.signature.name
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn default_config(&self) -> StageConfig {
        StageConfig::new(self.signature.instructions)
    }

    /// Run one generation call and parse its output.
    ///
    /// Makes exactly one call to the primitive. Failures are returned as-is;
    /// retrying is the caller's decision.
    pub async fn execute(
        &self,
        config: &StageConfig,
        generator: &dyn Generator,
        input: &Fields,
    ) -> Result<Fields, StageError> {
        let input = self
            .signature
            .coerce_inputs(input)
            .map_err(|detail| StageError::InvalidInput {
                stage: self.name().to_string(),
                detail,
            })?;

        let request = GenerationRequest {
            signature: &self.signature,
            instructions: &config.instructions,
            demonstrations: &config.demonstrations,
            input: &input,
        };

        let raw = generator.generate(request).await.map_err(|e| match e {
            GenerationError::Malformed(detail) => StageError::SchemaMismatch {
                stage: self.name().to_string(),
                detail,
            },
            other => StageError::UpstreamUnavailable {
                stage: self.name().to_string(),
                attempts: 1,
                detail: other.to_string(),
            },
        })?;

        let output = self
            .signature
            .coerce_outputs(&raw)
            .map_err(|detail| StageError::SchemaMismatch {
                stage: self.name().to_string(),
                detail,
            })?;

        debug!("Stage {} produced {} fields", self.name(), output.len());
        Ok(output)
    }
}
