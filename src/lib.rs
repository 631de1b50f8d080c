// Direct-messaging chat core: store, moderation and session controller
pub mod auth;
pub mod config;
pub mod models;
pub mod moderation;
pub mod profanity;
pub mod session;
pub mod store;

// Re-export main types for convenience
pub use auth::{AuthError, AuthService, SessionSignal};
pub use config::AppConfig;
pub use models::*;
pub use moderation::{GeminiModerator, ModerationVerdict, Moderator, UnavailableModerator};
pub use profanity::filter_profanity;
pub use session::{ChatSession, SendOutcome, SendState, SessionEvent, SessionOptions};
pub use store::{ChatStore, SqliteStore, StoreError};
