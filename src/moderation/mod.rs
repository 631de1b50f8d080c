// src/moderation/mod.rs
//! Message moderation
//!
//! A candidate message is sent to a remote classifier which answers with a
//! safe/unsafe verdict. Callers must treat every error as "not sent": an
//! unreachable classifier never lets a message through.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod gemini;

pub use gemini::GeminiModerator;

/// Verdict returned by the classifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModerationVerdict {
    pub is_safe: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ModerationVerdict {
    pub fn safe() -> Self {
        Self {
            is_safe: true,
            reason: None,
        }
    }

    pub fn unsafe_because(reason: impl Into<String>) -> Self {
        Self {
            is_safe: false,
            reason: Some(reason.into()),
        }
    }
}

/// Errors that can occur while asking the classifier
#[derive(Debug, Error)]
pub enum ModerationError {
    /// The request never produced a response
    #[error("Transport error: {0}")]
    Transport(String),

    /// The classifier answered with a non-success status
    #[error("Classifier returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The response could not be understood
    #[error("Could not decode classifier response: {0}")]
    Decode(String),

    /// No classifier is configured
    #[error("Moderation is not configured: {0}")]
    NotConfigured(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HarmCategory {
    #[serde(rename = "HARM_CATEGORY_HATE_SPEECH")]
    HateSpeech,
    #[serde(rename = "HARM_CATEGORY_DANGEROUS_CONTENT")]
    DangerousContent,
    #[serde(rename = "HARM_CATEGORY_HARASSMENT")]
    Harassment,
    #[serde(rename = "HARM_CATEGORY_SEXUALLY_EXPLICIT")]
    SexuallyExplicit,
    #[serde(rename = "HARM_CATEGORY_CIVIC_INTEGRITY")]
    CivicIntegrity,
}

impl HarmCategory {
    pub fn label(&self) -> &'static str {
        match self {
            HarmCategory::HateSpeech => "hate speech",
            HarmCategory::DangerousContent => "dangerous content",
            HarmCategory::Harassment => "harassment",
            HarmCategory::SexuallyExplicit => "sexually explicit content",
            HarmCategory::CivicIntegrity => "civic integrity",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockThreshold {
    #[serde(rename = "BLOCK_NONE")]
    BlockNone,
    #[serde(rename = "BLOCK_ONLY_HIGH")]
    BlockOnlyHigh,
    #[serde(rename = "BLOCK_MEDIUM_AND_ABOVE")]
    BlockMediumAndAbove,
    #[serde(rename = "BLOCK_LOW_AND_ABOVE")]
    BlockLowAndAbove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetySetting {
    pub category: HarmCategory,
    pub threshold: BlockThreshold,
}

/// Per-category sensitivity used by the chat application
pub fn default_safety_settings() -> Vec<SafetySetting> {
    vec![
        SafetySetting {
            category: HarmCategory::HateSpeech,
            threshold: BlockThreshold::BlockOnlyHigh,
        },
        SafetySetting {
            category: HarmCategory::DangerousContent,
            threshold: BlockThreshold::BlockNone,
        },
        SafetySetting {
            category: HarmCategory::Harassment,
            threshold: BlockThreshold::BlockMediumAndAbove,
        },
        SafetySetting {
            category: HarmCategory::SexuallyExplicit,
            threshold: BlockThreshold::BlockLowAndAbove,
        },
        SafetySetting {
            category: HarmCategory::CivicIntegrity,
            threshold: BlockThreshold::BlockLowAndAbove,
        },
    ]
}

/// Instruction sent to the classifier for one message
pub fn moderation_prompt(message: &str) -> String {
    format!(
        "You are an AI moderation tool that reviews chat messages and determines if they are safe and appropriate.\n\n\
         Here's the message to review:\n\
         \"\"\"{}\"\"\"\n\n\
         Determine if the message is safe and appropriate. If it is, isSafe should be true, and reason should be null.\n\
         If it is not, isSafe should be false, and reason should explain the problem with the message.\n\
         Be brief and to the point.\n",
        message
    )
}

/// Remote classifier boundary
#[async_trait]
pub trait Moderator: Send + Sync {
    async fn moderate(&self, message: &str) -> Result<ModerationVerdict, ModerationError>;
}

/// Stand-in used when no classifier credentials are available; every call fails.
pub struct UnavailableModerator {
    reason: String,
}

impl UnavailableModerator {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Moderator for UnavailableModerator {
    async fn moderate(&self, _message: &str) -> Result<ModerationVerdict, ModerationError> {
        Err(ModerationError::NotConfigured(self.reason.clone()))
    }
}
