// src/auth.rs
//! Account registration and login
//!
//! Hands out `LoggedInUser` values whose session binding is driven by this
//! service: `sign_out` fires the signal, which tears down any chat session
//! started for that user.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{info, warn};
use once_cell::sync::Lazy;
use rand::RngCore;
use regex::Regex;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::watch;

use crate::models::{LoggedInUser, NewUser, SessionBinding, SessionStatus, User};
use crate::store::{PasswordRecord, StoreError, UserDirectory};

pub const MIN_PASSWORD_LEN: usize = 6;

static EMAIL_SHAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+$").expect("email pattern is valid"));

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Name must not be empty")]
    MissingName,

    #[error("Invalid email address: {0}")]
    InvalidEmail(String),

    #[error("Password must be at least 6 characters")]
    WeakPassword,

    #[error("Email {0} is already registered")]
    EmailInUse(String),

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Sending half of a session binding
#[derive(Debug)]
pub struct SessionSignal {
    sender: watch::Sender<SessionStatus>,
}

impl SessionSignal {
    pub fn channel() -> (Self, SessionBinding) {
        let (sender, receiver) = watch::channel(SessionStatus::Active);
        (Self { sender }, SessionBinding::new(receiver))
    }

    pub fn binding(&self) -> SessionBinding {
        SessionBinding::new(self.sender.subscribe())
    }

    pub fn sign_out(&self) {
        self.sender.send_replace(SessionStatus::SignedOut);
    }
}

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_SHAPE.is_match(email.trim())
}

fn new_salt() -> String {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    hex::encode(salt)
}

fn digest_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct AuthService {
    directory: Arc<dyn UserDirectory>,
    signals: Mutex<HashMap<String, SessionSignal>>,
}

impl AuthService {
    pub fn new(directory: Arc<dyn UserDirectory>) -> Self {
        Self {
            directory,
            signals: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new account and sign it in.
    pub async fn sign_up(&self, name: &str, email: &str, password: &str) -> Result<LoggedInUser, AuthError> {
        let name = name.trim();
        let email = email.trim();
        if name.is_empty() {
            return Err(AuthError::MissingName);
        }
        if !is_valid_email(email) {
            return Err(AuthError::InvalidEmail(email.to_string()));
        }
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword);
        }

        let salt = new_salt();
        let record = PasswordRecord {
            digest: digest_password(&salt, password),
            salt,
        };
        let new_user = NewUser {
            name: name.to_string(),
            email: email.to_string(),
            avatar_url: None,
        };
        let user = match self.directory.create_user(new_user, record).await {
            Ok(user) => user,
            Err(StoreError::EmailInUse(email)) => {
                warn!("Sign-up refused, {} is already registered", email);
                return Err(AuthError::EmailInUse(email));
            }
            Err(e) => return Err(e.into()),
        };
        info!("Signed up {} <{}>", user.id, user.email);
        self.establish(user).await
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<LoggedInUser, AuthError> {
        let Some((user, record)) = self.directory.password_record(email.trim()).await? else {
            warn!("Sign-in failed for unknown email {}", email.trim());
            return Err(AuthError::InvalidCredentials);
        };
        if digest_password(&record.salt, password) != record.digest {
            warn!("Sign-in failed for {}: wrong password", user.email);
            return Err(AuthError::InvalidCredentials);
        }
        info!("Signed in {} <{}>", user.id, user.email);
        self.establish(user).await
    }

    /// Mark the user offline and end every session bound to this login.
    pub async fn sign_out(&self, user_id: &str) -> Result<(), AuthError> {
        let signal = self
            .signals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(user_id);
        if let Some(signal) = signal {
            signal.sign_out();
        }
        self.directory.set_online(user_id, false).await?;
        info!("Signed out {}", user_id);
        Ok(())
    }

    async fn establish(&self, mut user: User) -> Result<LoggedInUser, AuthError> {
        self.directory.set_online(&user.id, true).await?;
        user.online = true;

        let (signal, binding) = SessionSignal::channel();
        let replaced = self
            .signals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(user.id.clone(), signal);
        if let Some(previous) = replaced {
            // A second login for the same account supersedes the first
            previous.sign_out();
        }
        Ok(LoggedInUser::new(user, binding))
    }
}
