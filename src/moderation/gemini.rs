//! Reqwest-backed moderation client for a Gemini `generateContent` endpoint.
//!
//! The request carries the moderation prompt, the per-category safety
//! settings and a JSON response schema. The classifier's own safety filter
//! counts as a verdict: a blocked prompt or a candidate stopped for safety
//! is reported as unsafe, not as an error.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    default_safety_settings, moderation_prompt, HarmCategory, ModerationError, ModerationVerdict,
    Moderator, SafetySetting,
};

pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

/// Connection settings for the classifier
#[derive(Debug, Clone)]
pub struct GeminiSettings {
    pub api_key: String,
    pub endpoint: String,
    pub model: String,
    pub request_timeout: Duration,
    pub safety_settings: Vec<SafetySetting>,
}

impl GeminiSettings {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            request_timeout: Duration::from_secs(30),
            safety_settings: default_safety_settings(),
        }
    }
}

pub struct GeminiModerator {
    client: Client,
    url: String,
    api_key: String,
    safety_settings: Vec<SafetySetting>,
}

impl GeminiModerator {
    /// Build a moderator with an explicit request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error when the API key is empty or the HTTP client cannot be built.
    pub fn new(settings: GeminiSettings) -> Result<Self, ModerationError> {
        if settings.api_key.trim().is_empty() {
            return Err(ModerationError::NotConfigured(
                "missing classifier API key".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| ModerationError::Transport(e.to_string()))?;
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            settings.endpoint.trim_end_matches('/'),
            settings.model
        );
        Ok(Self {
            client,
            url,
            api_key: settings.api_key,
            safety_settings: settings.safety_settings,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn request_body(&self, message: &str) -> Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": moderation_prompt(message) }]
            }],
            "safetySettings": self.safety_settings,
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": {
                    "type": "OBJECT",
                    "properties": {
                        "isSafe": { "type": "BOOLEAN" },
                        "reason": { "type": "STRING", "nullable": true }
                    },
                    "required": ["isSafe"]
                }
            }
        })
    }
}

#[async_trait]
impl Moderator for GeminiModerator {
    async fn moderate(&self, message: &str) -> Result<ModerationVerdict, ModerationError> {
        debug!("Requesting moderation verdict ({} chars)", message.chars().count());
        let response = self
            .client
            .post(&self.url)
            .header("x-goog-api-key", self.api_key.as_str())
            .json(&self.request_body(message))
            .send()
            .await
            .map_err(|e| ModerationError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ModerationError::Transport(e.to_string()))?;
        if !status.is_success() {
            warn!("Classifier returned HTTP {}", status.as_u16());
            return Err(ModerationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        parse_generate_content(&body)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
    #[serde(default)]
    safety_ratings: Vec<SafetyRating>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
    #[serde(default)]
    safety_ratings: Vec<SafetyRating>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SafetyRating {
    category: String,
    #[serde(default)]
    probability: String,
    #[serde(default)]
    blocked: bool,
}

/// Turn a raw `generateContent` response body into a verdict.
pub(crate) fn parse_generate_content(body: &str) -> Result<ModerationVerdict, ModerationError> {
    let response: GenerateContentResponse =
        serde_json::from_str(body).map_err(|e| ModerationError::Decode(e.to_string()))?;

    if let Some(feedback) = &response.prompt_feedback {
        if let Some(block_reason) = &feedback.block_reason {
            let flagged = flagged_categories(&feedback.safety_ratings);
            return Ok(ModerationVerdict::unsafe_because(blocked_reason(block_reason, &flagged)));
        }
    }

    let candidate = response
        .candidates
        .first()
        .ok_or_else(|| ModerationError::Decode("response has no candidates".to_string()))?;

    if candidate.finish_reason.as_deref() == Some("SAFETY") {
        let flagged = flagged_categories(&candidate.safety_ratings);
        return Ok(ModerationVerdict::unsafe_because(blocked_reason("SAFETY", &flagged)));
    }

    let text: String = candidate
        .content
        .as_ref()
        .map(|content| {
            content
                .parts
                .iter()
                .filter_map(|part| part.text.as_deref())
                .collect()
        })
        .unwrap_or_default();
    if text.trim().is_empty() {
        return Err(ModerationError::Decode("candidate has no text".to_string()));
    }

    let mut verdict: ModerationVerdict = serde_json::from_str(strip_code_fence(&text))
        .map_err(|e| ModerationError::Decode(format!("{}: {}", e, text)))?;
    if verdict.reason.as_deref().map(str::trim) == Some("") {
        verdict.reason = None;
    }
    Ok(verdict)
}

fn flagged_categories(ratings: &[SafetyRating]) -> Vec<String> {
    ratings
        .iter()
        .filter(|rating| rating.blocked || matches!(rating.probability.as_str(), "MEDIUM" | "HIGH"))
        .map(|rating| category_label(&rating.category))
        .collect()
}

fn category_label(raw: &str) -> String {
    serde_json::from_value::<HarmCategory>(Value::String(raw.to_string()))
        .map(|category| category.label().to_string())
        .unwrap_or_else(|_| raw.to_lowercase())
}

fn blocked_reason(block_reason: &str, flagged: &[String]) -> String {
    if flagged.is_empty() {
        format!("Message blocked by the safety filter ({})", block_reason)
    } else {
        format!("Message flagged for {}", flagged.join(", "))
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}
