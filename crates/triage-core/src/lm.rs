//! OpenAI-compatible chat completion generator
//!
//! Each request becomes a system message describing the signature, one
//! user/assistant pair per demonstration, and a final user message with the
//! input. Fields are delimited with `[[ ## name ## ]]` markers on both sides.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::GenerationError;
use crate::primitives::{GenerationRequest, Generator};
use crate::signature::{FieldKind, FieldSpec, Fields, Signature};

const COMPLETED_MARKER: &str = "completed";

#[derive(Clone)]
pub struct ChatGenerator {
    api_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

impl std::fmt::Debug for ChatGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatGenerator")
            .field("api_url", &self.api_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("model", &self.model)
            .finish()
    }
}

impl ChatGenerator {
    pub fn new(api_url: &str, api_key: Option<String>, model: &str) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
            model: model.to_string(),
            temperature: 0.3,
            max_tokens: 1000,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl Generator for ChatGenerator {
    async fn generate(&self, request: GenerationRequest<'_>) -> Result<Fields, GenerationError> {
        let messages = format_messages(request);
        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.api_url))
            .json(&json!({
                "model": &self.model,
                "messages": messages,
                "temperature": self.temperature,
                "max_tokens": self.max_tokens,
            }));
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                GenerationError::Timeout
            } else {
                GenerationError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!("Chat completion failed for {}: {}", request.signature.name, status);
            return Err(GenerationError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| GenerationError::Transport(e.to_string()))?;
        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| GenerationError::Malformed("response has no message content".into()))?;

        debug!(
            "Chat completion for {} returned {} chars",
            request.signature.name,
            content.len()
        );
        parse_completion(request.signature, content)
    }
}

fn marker(name: &str) -> String {
    format!("[[ ## {} ## ]]", name)
}

fn type_hint(kind: &FieldKind) -> String {
    match kind {
        FieldKind::Text => "str".to_string(),
        FieldKind::Bool => "bool".to_string(),
        FieldKind::Score => "float between 0.0 and 1.0".to_string(),
        FieldKind::Choice(options) => format!("one of: {}", options.join(", ")),
    }
}

fn describe_fields(specs: &[FieldSpec]) -> String {
    specs
        .iter()
        .enumerate()
        .map(|(i, f)| format!("{}. `{}` ({}): {}", i + 1, f.name, type_hint(&f.kind), f.desc))
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_fields<'a>(names: impl Iterator<Item = &'a str>, values: &Fields) -> String {
    let mut out = String::new();
    for name in names {
        let value = match values.get(name) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => continue,
        };
        out.push_str(&marker(name));
        out.push('\n');
        out.push_str(&value);
        out.push_str("\n\n");
    }
    out
}

/// Build the chat messages for a request
pub fn format_messages(request: GenerationRequest<'_>) -> Vec<Value> {
    let sig = request.signature;
    let output_format = sig
        .outputs
        .iter()
        .map(|f| format!("{}\n{{{}}}", marker(f.name), f.name))
        .collect::<Vec<_>>()
        .join("\n\n");

    let system = format!(
        "Your input fields are:\n{}\n\nYour output fields are:\n{}\n\n\
         Respond with the corresponding output fields, starting with the field \
         marker, in this order:\n\n{}\n\n{}\n\nIn adhering to this structure, your objective is:\n{}",
        describe_fields(&sig.inputs),
        describe_fields(&sig.outputs),
        output_format,
        marker(COMPLETED_MARKER),
        request.instructions,
    );

    let mut messages = vec![json!({"role": "system", "content": system})];
    for demo in request.demonstrations {
        messages.push(json!({
            "role": "user",
            "content": render_fields(sig.input_names(), &demo.input),
        }));
        messages.push(json!({
            "role": "assistant",
            "content": format!(
                "{}{}",
                render_fields(sig.output_names(), &demo.output),
                marker(COMPLETED_MARKER)
            ),
        }));
    }
    messages.push(json!({
        "role": "user",
        "content": render_fields(sig.input_names(), request.input),
    }));
    messages
}

/// Split a completion into the signature's output fields.
///
/// Values stay as raw strings; the stage coerces them into the schema.
pub fn parse_completion(signature: &Signature, content: &str) -> Result<Fields, GenerationError> {
    let mut fields = Fields::new();
    let mut current: Option<&str> = None;
    let mut buffer = String::new();

    let flush = |name: Option<&str>, buffer: &mut String, fields: &mut Fields| {
        if let Some(name) = name {
            if signature.output_names().any(|n| n == name) {
                fields.insert(name.to_string(), Value::String(buffer.trim().to_string()));
            }
        }
        buffer.clear();
    };

    for line in content.lines() {
        let trimmed = line.trim();
        if let Some((name, rest)) = trimmed
            .strip_prefix("[[ ## ")
            .and_then(|marker| marker.split_once(" ## ]]"))
        {
            flush(current, &mut buffer, &mut fields);
            let name = name.trim();
            current = if name == COMPLETED_MARKER {
                None
            } else {
                Some(name)
            };
            // a value may start on the marker line itself
            let rest = rest.trim();
            if current.is_some() && !rest.is_empty() {
                buffer.push_str(rest);
                buffer.push('\n');
            }
            continue;
        }
        if current.is_some() {
            buffer.push_str(line);
            buffer.push('\n');
        }
    }
    flush(current, &mut buffer, &mut fields);

    if fields.is_empty() {
        return Err(GenerationError::Malformed(format!(
            "no output field markers found for {}",
            signature.name
        )));
    }
    Ok(fields)
}
