// src/store/mod.rs
//! Persistence boundary
//!
//! The chat application keeps three kinds of documents: user profiles (with
//! each user's contact set), conversations, and the ordered messages of each
//! conversation. The traits below are the only way the session controller
//! reaches them; `SqliteStore` is the embedded implementation.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Conversation, Message, NewMessage, NewUser, User};

pub mod sqlite;
pub mod subscriptions;

pub use sqlite::SqliteStore;
pub use subscriptions::{Subscription, SubscriptionHub};

/// Errors raised by the document store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No user with id {0}")]
    UserNotFound(String),

    #[error("Email {0} is already registered")]
    EmailInUse(String),

    #[error("Malformed conversation id: {0}")]
    InvalidConversation(String),

    #[error("Store is unavailable: {0}")]
    Unavailable(String),
}

/// Salted password digest kept next to a user document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordRecord {
    pub salt: String,
    pub digest: String,
}

/// User documents and credentials
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn create_user(&self, user: NewUser, password: PasswordRecord) -> Result<User, StoreError>;

    async fn get_user(&self, user_id: &str) -> Result<Option<User>, StoreError>;

    /// Case-insensitive lookup of a user by email address
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;

    async fn password_record(&self, email: &str) -> Result<Option<(User, PasswordRecord)>, StoreError>;

    async fn update_avatar(&self, user_id: &str, avatar_url: &str) -> Result<User, StoreError>;

    async fn set_online(&self, user_id: &str, online: bool) -> Result<(), StoreError>;
}

/// Each user's set of chat partners
#[async_trait]
pub trait ContactStore: Send + Sync {
    async fn contact_ids(&self, owner_id: &str) -> Result<Vec<String>, StoreError>;

    /// Add each user to the other's contact set and create their conversation
    /// if it does not exist yet, as one atomic write.
    async fn add_contact_pair(&self, a: &str, b: &str) -> Result<(), StoreError>;

    /// Remove each user from the other's contact set as one atomic write.
    async fn remove_contact_pair(&self, a: &str, b: &str) -> Result<(), StoreError>;

    /// Live, insertion-ordered profiles of `owner_id`'s contacts
    async fn watch_contacts(&self, owner_id: &str) -> Result<Subscription<Vec<User>>, StoreError>;
}

/// Ordered, append-only message collections
#[async_trait]
pub trait MessageStream: Send + Sync {
    /// Append a message; the store assigns its id and timestamp.
    async fn append_message(&self, conversation_id: &str, message: NewMessage) -> Result<Message, StoreError>;

    /// All messages ordered by (timestamp, insertion order)
    async fn messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError>;

    async fn conversation(&self, conversation_id: &str) -> Result<Option<Conversation>, StoreError>;

    /// Live view replacing the full message list on every change
    async fn watch_messages(&self, conversation_id: &str) -> Result<Subscription<Vec<Message>>, StoreError>;
}

/// Everything the chat session needs from persistence
pub trait ChatStore: UserDirectory + ContactStore + MessageStream {}

impl<T: UserDirectory + ContactStore + MessageStream> ChatStore for T {}
