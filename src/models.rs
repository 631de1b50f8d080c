// Core data types shared by the store, the session controller and the UI

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Avatar service used for freshly created accounts
pub const DEFAULT_AVATAR_BASE: &str = "https://i.pravatar.cc/150?u=";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    pub avatar_url: String,
    pub email: String,
    pub online: bool,
}

impl User {
    pub fn default_avatar(user_id: &str) -> String {
        format!("{}{}", DEFAULT_AVATAR_BASE, user_id)
    }
}

/// Input for creating a user document at sign-up
#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub avatar_url: Option<String>,
}

/// Whether the auth collaborator still considers the session alive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    SignedOut,
}

/// Receiving half of a session signal, handed to the session controller
#[derive(Debug, Clone)]
pub struct SessionBinding {
    status: watch::Receiver<SessionStatus>,
}

impl SessionBinding {
    pub fn new(status: watch::Receiver<SessionStatus>) -> Self {
        Self { status }
    }

    pub fn is_active(&self) -> bool {
        *self.status.borrow() == SessionStatus::Active
    }

    /// Resolves once the session is signed out or the signal is gone.
    pub async fn signed_out(&mut self) {
        loop {
            if *self.status.borrow_and_update() == SessionStatus::SignedOut {
                return;
            }
            if self.status.changed().await.is_err() {
                // Sender dropped: the session has been lost
                return;
            }
        }
    }
}

/// A user bound to an authenticated session
#[derive(Debug, Clone)]
pub struct LoggedInUser {
    pub profile: User,
    pub binding: SessionBinding,
}

impl LoggedInUser {
    pub fn new(profile: User, binding: SessionBinding) -> Self {
        Self { profile, binding }
    }

    pub fn id(&self) -> &str {
        &self.profile.id
    }
}

/// Display fields of the sender frozen at send time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderSnapshot {
    pub id: String,
    pub name: String,
    pub avatar_url: String,
    pub email: String,
}

impl SenderSnapshot {
    pub fn of(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            name: user.name.clone(),
            avatar_url: user.avatar_url.clone(),
            email: user.email.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender: SenderSnapshot,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// A message before the store has assigned its id and timestamp
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender: SenderSnapshot,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub message_id: String,
    pub sender_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: String,
    pub participants: [String; 2],
    pub created_at: DateTime<Utc>,
    pub last_message: Option<LastMessage>,
}

/// Canonical conversation id for an unordered pair of user ids.
pub fn conversation_id(a: &str, b: &str) -> String {
    if a <= b {
        format!("{}_{}", a, b)
    } else {
        format!("{}_{}", b, a)
    }
}

/// Sorted participant pair for two user ids
pub fn participants(a: &str, b: &str) -> [String; 2] {
    if a <= b {
        [a.to_string(), b.to_string()]
    } else {
        [b.to_string(), a.to_string()]
    }
}
