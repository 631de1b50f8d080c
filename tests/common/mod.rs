// Common test utilities for integration tests
// Shared fixtures: logging, an in-memory store, scripted moderation and
// helpers for waiting on session events.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use log::LevelFilter;
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep, timeout, Instant};

use chitchathub::auth::AuthService;
use chitchathub::models::{Conversation, LoggedInUser, Message, NewMessage, NewUser, User};
use chitchathub::moderation::{ModerationError, ModerationVerdict, Moderator};
use chitchathub::session::{ChatSession, SessionEvent, SessionOptions};
use chitchathub::store::{
    ContactStore, MessageStream, PasswordRecord, SqliteStore, StoreError, Subscription,
    UserDirectory,
};

pub const PASSWORD: &str = "password1";
pub const WAIT: Duration = Duration::from_secs(3);

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

/// A fresh in-memory store with an auth service on top
pub struct TestWorld {
    pub store: Arc<SqliteStore>,
    pub auth: AuthService,
}

impl TestWorld {
    pub fn new() -> Self {
        setup_logging();
        let store = Arc::new(SqliteStore::open_in_memory().expect("in-memory store"));
        let auth = AuthService::new(store.clone());
        TestWorld { store, auth }
    }

    /// Sign up `name` as `{name}@example.com`
    pub async fn register(&self, name: &str) -> LoggedInUser {
        self.auth
            .sign_up(name, &format!("{}@example.com", name.to_lowercase()), PASSWORD)
            .await
            .expect("sign up")
    }

    pub async fn start(
        &self,
        user: LoggedInUser,
        moderator: Arc<dyn Moderator>,
    ) -> (ChatSession, mpsc::UnboundedReceiver<SessionEvent>) {
        ChatSession::start(user, self.store.clone(), moderator, SessionOptions::default())
            .await
            .expect("session start")
    }
}

/// One scripted classifier answer
pub enum Script {
    Verdict(ModerationVerdict),
    Fail(String),
    /// Never answers
    Hang,
    /// Answers with the verdict once notified
    Wait(Arc<Notify>, ModerationVerdict),
}

/// Moderator that replays scripted answers (safe once the script runs out)
/// and records every message it was asked about.
#[derive(Default)]
pub struct ScriptedModerator {
    scripts: Mutex<VecDeque<Script>>,
    seen: Mutex<Vec<String>>,
}

impl ScriptedModerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Moderator for ScriptedModerator {
    async fn moderate(&self, message: &str) -> Result<ModerationVerdict, ModerationError> {
        self.seen.lock().unwrap().push(message.to_string());
        let script = self.scripts.lock().unwrap().pop_front();
        match script {
            None => Ok(ModerationVerdict::safe()),
            Some(Script::Verdict(verdict)) => Ok(verdict),
            Some(Script::Fail(reason)) => Err(ModerationError::Transport(reason)),
            Some(Script::Hang) => std::future::pending().await,
            Some(Script::Wait(notify, verdict)) => {
                notify.notified().await;
                Ok(verdict)
            }
        }
    }
}

/// Store wrapper with switchable faults on appends and contact lookups
pub struct FaultyStore {
    pub inner: Arc<SqliteStore>,
    fail_appends: AtomicBool,
    fail_contact_lookups: AtomicBool,
}

impl FaultyStore {
    pub fn new(inner: Arc<SqliteStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_appends: AtomicBool::new(false),
            fail_contact_lookups: AtomicBool::new(false),
        })
    }

    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    pub fn fail_contact_lookups(&self, fail: bool) {
        self.fail_contact_lookups.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl UserDirectory for FaultyStore {
    async fn create_user(&self, user: NewUser, password: PasswordRecord) -> Result<User, StoreError> {
        self.inner.create_user(user, password).await
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        self.inner.get_user(user_id).await
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        self.inner.find_user_by_email(email).await
    }

    async fn password_record(&self, email: &str) -> Result<Option<(User, PasswordRecord)>, StoreError> {
        self.inner.password_record(email).await
    }

    async fn update_avatar(&self, user_id: &str, avatar_url: &str) -> Result<User, StoreError> {
        self.inner.update_avatar(user_id, avatar_url).await
    }

    async fn set_online(&self, user_id: &str, online: bool) -> Result<(), StoreError> {
        self.inner.set_online(user_id, online).await
    }
}

#[async_trait]
impl ContactStore for FaultyStore {
    async fn contact_ids(&self, owner_id: &str) -> Result<Vec<String>, StoreError> {
        if self.fail_contact_lookups.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("lookup down".to_string()));
        }
        self.inner.contact_ids(owner_id).await
    }

    async fn add_contact_pair(&self, a: &str, b: &str) -> Result<(), StoreError> {
        self.inner.add_contact_pair(a, b).await
    }

    async fn remove_contact_pair(&self, a: &str, b: &str) -> Result<(), StoreError> {
        self.inner.remove_contact_pair(a, b).await
    }

    async fn watch_contacts(&self, owner_id: &str) -> Result<Subscription<Vec<User>>, StoreError> {
        self.inner.watch_contacts(owner_id).await
    }
}

#[async_trait]
impl MessageStream for FaultyStore {
    async fn append_message(&self, conversation_id: &str, message: NewMessage) -> Result<Message, StoreError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("write rejected".to_string()));
        }
        self.inner.append_message(conversation_id, message).await
    }

    async fn messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        self.inner.messages(conversation_id).await
    }

    async fn conversation(&self, conversation_id: &str) -> Result<Option<Conversation>, StoreError> {
        self.inner.conversation(conversation_id).await
    }

    async fn watch_messages(&self, conversation_id: &str) -> Result<Subscription<Vec<Message>>, StoreError> {
        self.inner.watch_messages(conversation_id).await
    }
}

/// Receive events until one matches `pred`; panics after `WAIT`.
pub async fn wait_for<F>(events: &mut mpsc::UnboundedReceiver<SessionEvent>, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    let deadline = Instant::now() + WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, events.recv()).await {
            Ok(Some(event)) if pred(&event) => return event,
            Ok(Some(_)) => continue,
            Ok(None) => panic!("session event channel closed"),
            Err(_) => panic!("timed out waiting for a session event"),
        }
    }
}

/// Poll `cond` until it holds; returns false after `WAIT`.
pub async fn wait_until<F>(mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Wait until the session has `user_id` selected
pub async fn wait_for_selection(session: &ChatSession, user_id: Option<&str>) -> bool {
    wait_until(|| session.selected_contact().map(|u| u.id).as_deref() == user_id).await
}
