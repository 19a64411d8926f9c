//! Tier 3: category suggestions from an OpenAI-compatible chat endpoint.

use std::thread;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::SuggestError;

pub const DEFAULT_PROMPT: &str = "You categorize personal finance transactions from Brazilian \
bank and credit card statements. Prefer one of the known categories when it fits; otherwise \
propose a short, general category name.";

/// Connection and prompt settings for [`OpenAiSuggester`].
#[derive(Debug, Clone)]
pub struct AiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub language: String,
    pub prompt: String,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

/// Context handed to the model alongside the description.
#[derive(Debug, Clone, Default)]
pub struct Heuristics {
    /// Categories already in use, most used first.
    pub known_categories: Vec<String>,
    /// Nearby cached descriptions with their categories.
    pub examples: Vec<(String, String)>,
    pub amount_cents: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Suggestion {
    pub category: String,
    pub confidence: Option<f64>,
    pub tags: Vec<String>,
}

pub trait CategorySuggester {
    fn suggest_category(
        &self,
        description: &str,
        heuristics: &Heuristics,
    ) -> Result<Suggestion, SuggestError>;

    /// Up to `top` candidate categories, best first.
    fn suggest_categories(
        &self,
        description: &str,
        heuristics: &Heuristics,
        top: usize,
    ) -> Result<Vec<String>, SuggestError>;
}

// ---------------------------------------------------------------------------
// Prompt building and response parsing
// ---------------------------------------------------------------------------

fn context_lines(description: &str, language: &str, heuristics: &Heuristics) -> String {
    let mut user = format!("Description: {description}\nLanguage: {language}\n");
    if let Some(cents) = heuristics.amount_cents {
        user.push_str(&format!("Amount: {}\n", crate::models::format_cents(cents)));
    }
    if !heuristics.known_categories.is_empty() {
        user.push_str(&format!(
            "Known categories: {}\n",
            heuristics.known_categories.join(", ")
        ));
    }
    if !heuristics.examples.is_empty() {
        user.push_str("Similar past transactions:\n");
        for (desc, category) in &heuristics.examples {
            user.push_str(&format!("- {desc} => {category}\n"));
        }
    }
    user
}

pub fn category_messages(prompt: &str, language: &str, description: &str, heuristics: &Heuristics) -> Value {
    let system = format!(
        "{}\n\nReturn only JSON with keys: category, tags, confidence. \
         tags must be an array of short strings. \
         confidence must be a number between 0 and 1.",
        prompt.trim()
    );
    let mut user = context_lines(description, language, heuristics);
    user.push_str("If unsure, choose a generic category and low confidence.");
    json!([
        {"role": "system", "content": system},
        {"role": "user", "content": user},
    ])
}

pub fn suggestions_messages(
    prompt: &str,
    language: &str,
    description: &str,
    heuristics: &Heuristics,
    top: usize,
) -> Value {
    let system = format!(
        "{}\n\nReturn only JSON with key: categories. \
         categories must be an array of short strings.",
        prompt.trim()
    );
    let mut user = context_lines(description, language, heuristics);
    user.push_str(&format!("Return up to {top} category suggestions."));
    json!([
        {"role": "system", "content": system},
        {"role": "user", "content": user},
    ])
}

/// Parse a JSON object from model output, tolerating prose or code fences
/// around it.
pub fn parse_json_object(text: &str) -> Result<Value, SuggestError> {
    let text = text.trim();
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(text) {
        return Ok(value);
    }
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => serde_json::from_str(&text[start..=end])
            .map_err(|e| SuggestError::Malformed(e.to_string())),
        _ => Err(SuggestError::Malformed(format!("no JSON object in {text:?}"))),
    }
}

/// Strings from an array, or from a comma-separated string.
fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

pub fn parse_suggestion(content: &str) -> Result<Suggestion, SuggestError> {
    let data = parse_json_object(content)?;
    let category = match data.get("category") {
        Some(Value::String(s)) => s.trim().to_string(),
        _ => String::new(),
    };
    if category.is_empty() {
        return Err(SuggestError::Malformed("model returned an empty category".into()));
    }
    let confidence = match data.get("confidence") {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
    .map(|c: f64| c.clamp(0.0, 1.0));
    Ok(Suggestion {
        category,
        confidence,
        tags: string_list(data.get("tags")),
    })
}

pub fn parse_suggestions(content: &str, top: usize) -> Result<Vec<String>, SuggestError> {
    let data = parse_json_object(content)?;
    let mut categories = string_list(data.get("categories"));
    categories.truncate(top.max(1));
    Ok(categories)
}

/// Run `op` until it succeeds, fails with a non-retryable error or
/// `max_retries` retries are spent. Waits `backoff * attempt` between tries.
pub fn with_retries<T>(
    max_retries: u32,
    backoff: Duration,
    mut op: impl FnMut() -> Result<T, SuggestError>,
) -> Result<T, SuggestError> {
    let mut attempt = 0u32;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_retries => {
                attempt += 1;
                warn!(attempt, max_retries, error = %e, "AI request failed, retrying");
                thread::sleep(backoff * attempt);
            }
            Err(e) => return Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

pub struct OpenAiSuggester {
    config: AiConfig,
    agent: ureq::Agent,
    backoff: Duration,
}

impl OpenAiSuggester {
    pub fn new(config: AiConfig) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.timeout_secs)))
            .http_status_as_error(false)
            .build()
            .into();
        Self {
            config,
            agent,
            backoff: Duration::from_secs(1),
        }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    /// One chat completion request; returns the assistant message content.
    fn complete_once(&self, body: &str) -> Result<String, SuggestError> {
        let mut resp = self
            .agent
            .post(&self.endpoint())
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .send(body)
            .map_err(|e| SuggestError::Transport(e.to_string()))?;

        let status = resp.status().as_u16();
        let text = resp
            .body_mut()
            .read_to_string()
            .map_err(|e| SuggestError::Transport(e.to_string()))?;
        match status {
            200..=299 => {}
            429 => return Err(SuggestError::RateLimited),
            _ => {
                let body = text.chars().take(500).collect();
                return Err(SuggestError::Status { status, body });
            }
        }

        let value: Value =
            serde_json::from_str(&text).map_err(|e| SuggestError::Malformed(e.to_string()))?;
        value
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SuggestError::Malformed("response has no message content".into()))
    }

    fn complete(&self, messages: Value) -> Result<String, SuggestError> {
        let body = json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": 0,
            "response_format": {"type": "json_object"},
        })
        .to_string();
        with_retries(self.config.max_retries, self.backoff, || self.complete_once(&body))
    }
}

impl CategorySuggester for OpenAiSuggester {
    fn suggest_category(
        &self,
        description: &str,
        heuristics: &Heuristics,
    ) -> Result<Suggestion, SuggestError> {
        let messages = category_messages(&self.config.prompt, &self.config.language, description, heuristics);
        let content = self.complete(messages)?;
        debug!(description, content = %content, "AI category response");
        parse_suggestion(&content)
    }

    fn suggest_categories(
        &self,
        description: &str,
        heuristics: &Heuristics,
        top: usize,
    ) -> Result<Vec<String>, SuggestError> {
        let messages = suggestions_messages(
            &self.config.prompt,
            &self.config.language,
            description,
            heuristics,
            top,
        );
        let content = self.complete(messages)?;
        parse_suggestions(&content, top)
    }
}
