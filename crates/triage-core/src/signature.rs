//! Typed input/output contracts for pipeline stages
//!
//! A `Signature` declares the named fields a stage consumes and produces. The
//! generation primitive returns loosely-typed JSON fields; `coerce_outputs` is the
//! single place where those are parsed into the declared schema.

use serde_json::Value;

/// Field values exchanged between stages and the generation primitive
pub type Fields = serde_json::Map<String, Value>;

pub const CLASSIFIER: &str = "classifier";
pub const KNOWLEDGE_RETRIEVER: &str = "knowledge_retriever";
pub const RESPONSE_GENERATOR: &str = "response_generator";
pub const QUALITY_EVALUATOR: &str = "quality_evaluator";

pub const CATEGORIES: &[&str] = &["Technical", "Billing", "Sales", "Feature_Request"];
pub const PRIORITIES: &[&str] = &["Critical", "High", "Medium", "Low"];
pub const RESPONSE_TYPES: &[&str] = &[
    "Troubleshooting",
    "Account_Review",
    "Information",
    "Product_Feedback",
    "Account_Recovery",
];

#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Text,
    Bool,
    /// A number clamped to [0, 1]
    Score,
    Choice(&'static [&'static str]),
}

impl FieldKind {
    /// Parse a raw value into this kind's canonical JSON representation
    pub fn coerce(&self, value: &Value) -> Result<Value, String> {
        match self {
            FieldKind::Text => match value {
                Value::String(s) => Ok(Value::String(s.clone())),
                Value::Number(n) => Ok(Value::String(n.to_string())),
                Value::Bool(b) => Ok(Value::String(b.to_string())),
                Value::Array(items) => Ok(Value::String(
                    items
                        .iter()
                        .map(|v| match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .collect::<Vec<_>>()
                        .join("\n"),
                )),
                Value::Object(_) => Ok(Value::String(value.to_string())),
                Value::Null => Err("expected text, got null".to_string()),
            },
            FieldKind::Bool => match value {
                Value::Bool(b) => Ok(Value::Bool(*b)),
                Value::String(s) => match s.trim().to_lowercase().as_str() {
                    "true" | "yes" | "1" => Ok(Value::Bool(true)),
                    "false" | "no" | "0" => Ok(Value::Bool(false)),
                    other => Err(format!("expected boolean, got '{}'", other)),
                },
                Value::Number(n) => match n.as_i64() {
                    Some(1) => Ok(Value::Bool(true)),
                    Some(0) => Ok(Value::Bool(false)),
                    _ => Err(format!("expected boolean, got {}", n)),
                },
                other => Err(format!("expected boolean, got {}", other)),
            },
            FieldKind::Score => {
                let number = match value {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                };
                match number {
                    Some(x) if x.is_finite() => Ok(Value::from(x.clamp(0.0, 1.0))),
                    _ => Err(format!("expected a score in [0, 1], got {}", value)),
                }
            }
            FieldKind::Choice(options) => {
                let raw = match value {
                    Value::String(s) => s.as_str(),
                    other => return Err(format!("expected one of {:?}, got {}", options, other)),
                };
                let normalized = raw.trim().replace([' ', '-'], "_");
                options
                    .iter()
                    .find(|opt| opt.eq_ignore_ascii_case(&normalized))
                    .map(|opt| Value::String(opt.to_string()))
                    .ok_or_else(|| format!("expected one of {:?}, got '{}'", options, raw))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub desc: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    pub fn new(name: &'static str, desc: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            desc,
            kind,
            required: true,
        }
    }

    pub fn text(name: &'static str, desc: &'static str) -> Self {
        Self::new(name, desc, FieldKind::Text)
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Value used when an optional field is absent
    fn default_value(&self) -> Option<Value> {
        match self.kind {
            FieldKind::Text => Some(Value::String(String::new())),
            _ => None,
        }
    }
}

/// Declared schema of a stage
#[derive(Debug, Clone)]
pub struct Signature {
    pub name: &'static str,
    /// Default instructions installed before any optimization
    pub instructions: &'static str,
    pub inputs: Vec<FieldSpec>,
    pub outputs: Vec<FieldSpec>,
}

impl Signature {
    /// Verify that every required input is present and well-typed
    pub fn check_inputs(&self, input: &Fields) -> Result<(), String> {
        check_fields(&self.inputs, input).map(|_| ())
    }

    /// Parse raw generator output into the declared output fields.
    ///
    /// Undeclared fields are dropped; missing optional text fields become empty strings.
    pub fn coerce_outputs(&self, raw: &Fields) -> Result<Fields, String> {
        check_fields(&self.outputs, raw)
    }

    /// Coerce an input map the same way outputs are coerced
    pub fn coerce_inputs(&self, raw: &Fields) -> Result<Fields, String> {
        check_fields(&self.inputs, raw)
    }

    pub fn input_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.inputs.iter().map(|f| f.name)
    }

    pub fn output_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.outputs.iter().map(|f| f.name)
    }
}

fn check_fields(specs: &[FieldSpec], raw: &Fields) -> Result<Fields, String> {
    let mut out = Fields::new();
    for spec in specs {
        match raw.get(spec.name) {
            Some(value) if !value.is_null() => {
                let coerced = spec
                    .kind
                    .coerce(value)
                    .map_err(|e| format!("field '{}': {}", spec.name, e))?;
                out.insert(spec.name.to_string(), coerced);
            }
            _ if spec.required => {
                return Err(format!("missing required field '{}'", spec.name));
            }
            _ => {
                if let Some(default) = spec.default_value() {
                    out.insert(spec.name.to_string(), default);
                }
            }
        }
    }
    Ok(out)
}

// ============================================================================
// Support pipeline signatures
// ============================================================================

pub fn ticket_classifier() -> Signature {
    Signature {
        name: CLASSIFIER,
        instructions: "Classify customer support tickets by category, priority and response type.",
        inputs: vec![
            FieldSpec::text("subject", "Ticket subject line"),
            FieldSpec::text("message", "Customer message content"),
        ],
        outputs: vec![
            FieldSpec::new(
                "category",
                "Primary category of the issue",
                FieldKind::Choice(CATEGORIES),
            ),
            FieldSpec::new(
                "priority",
                "Urgency level based on business impact",
                FieldKind::Choice(PRIORITIES),
            ),
            FieldSpec::new(
                "response_type",
                "Type of response needed",
                FieldKind::Choice(RESPONSE_TYPES),
            ),
            FieldSpec::text("reasoning", "Brief explanation of classification").optional(),
        ],
    }
}

pub fn knowledge_retriever() -> Signature {
    Signature {
        name: KNOWLEDGE_RETRIEVER,
        instructions: "Find relevant solution information from knowledge base.",
        inputs: vec![
            FieldSpec::text("category", "Ticket category"),
            FieldSpec::text("issue_description", "Subject and message of the ticket"),
            FieldSpec::text("passages", "Retrieved knowledge base passages, best first"),
        ],
        outputs: vec![
            FieldSpec::text("relevant_solution", "Most relevant solution steps"),
            FieldSpec::new(
                "escalation_needed",
                "Whether human escalation is required",
                FieldKind::Bool,
            ),
        ],
    }
}

pub fn response_generator() -> Signature {
    Signature {
        name: RESPONSE_GENERATOR,
        instructions: "Generate helpful customer support responses.",
        inputs: vec![
            FieldSpec::text("customer_message", "Original customer message"),
            FieldSpec::text("issue_category", "Ticket category"),
            FieldSpec::text("priority_level", "Ticket priority"),
            FieldSpec::text("solution_info", "Solution steps from the knowledge base"),
            FieldSpec::new(
                "escalation_needed",
                "Whether human escalation is required",
                FieldKind::Bool,
            ),
        ],
        outputs: vec![
            FieldSpec::text("response", "Professional, helpful customer response"),
            FieldSpec::new(
                "confidence",
                "Confidence in response quality 0.0-1.0",
                FieldKind::Score,
            ),
        ],
    }
}

pub fn quality_evaluator() -> Signature {
    Signature {
        name: QUALITY_EVALUATOR,
        instructions: "Evaluate response quality and suggest improvements.",
        inputs: vec![
            FieldSpec::text("original_message", "Original customer message"),
            FieldSpec::text("generated_response", "Response to evaluate"),
        ],
        outputs: vec![
            FieldSpec::new("quality_score", "Quality rating 0.0-1.0", FieldKind::Score),
            FieldSpec::new(
                "is_helpful",
                "Whether response addresses the issue",
                FieldKind::Bool,
            ),
            FieldSpec::new(
                "is_professional",
                "Whether tone is appropriate",
                FieldKind::Bool,
            ),
            FieldSpec::text("suggestions", "Improvement suggestions if needed").optional(),
        ],
    }
}

/// Signature of the instruction-rewrite call used by instruction search
pub fn instruction_rewriter() -> Signature {
    Signature {
        name: "instruction_rewriter",
        instructions: "You are an expert prompt engineer. Given the current instruction for one \
                       stage of a support pipeline and examples where it failed, write an improved \
                       instruction that fixes the failure patterns. Output only the instruction text.",
        inputs: vec![
            FieldSpec::text("stage", "Name of the stage being improved"),
            FieldSpec::text("current_instruction", "The current instruction"),
            FieldSpec::text("failures", "Failed examples with expected and actual outputs"),
        ],
        outputs: vec![FieldSpec::text(
            "improved_instruction",
            "The complete improved instruction",
        )],
    }
}
