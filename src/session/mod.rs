// src/session/mod.rs
//! Chat session controller
//!
//! A `ChatSession` is built from an explicit logged-in user plus its store
//! and moderation collaborators. It keeps the observed contact list and the
//! selected conversation in sync with the store, drives the
//! filter → moderate → append pipeline for outgoing messages, and reports
//! everything the view needs through a `SessionEvent` channel.
//!
//! Every live store registration is owned by a task of the session. Closing
//! the session (explicitly, on drop, or when the auth collaborator signs the
//! user out) aborts those tasks, which releases the registrations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

pub mod reconcile;

pub use reconcile::reconcile_selection;

use crate::models::{
    conversation_id, LoggedInUser, Message, NewMessage, SenderSnapshot, SessionBinding, User,
};
use crate::moderation::Moderator;
use crate::profanity::filter_profanity;
use crate::store::{ChatStore, StoreError, Subscription};

pub const DEFAULT_MODERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Shown when the classifier flags a message without saying why
pub const GENERIC_REJECTION: &str = "This message violates our community guidelines.";
const GENERIC_SEND_FAILURE: &str = "Failed to send message. Please try again.";

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Upper bound on one classifier call; expiry aborts the send
    pub moderation_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            moderation_timeout: DEFAULT_MODERATION_TIMEOUT,
        }
    }
}

/// Stage of the outgoing-message pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Idle,
    Filtering,
    Moderating,
    Appending,
    Rejected,
}

impl SendState {
    pub fn is_busy(&self) -> bool {
        !matches!(self, SendState::Idle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Error,
}

/// A short user-facing message, rendered as a toast by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub title: String,
    pub description: String,
}

impl Notice {
    pub fn info(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            title: title.into(),
            description: description.into(),
        }
    }

    pub fn error(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            title: title.into(),
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ContactsChanged(Vec<User>),
    SelectionChanged(Option<User>),
    MessagesChanged {
        conversation_id: String,
        messages: Vec<Message>,
    },
    SendStateChanged(SendState),
    ProfileChanged(User),
    Notice(Notice),
    /// The auth collaborator ended the session; the controller is closed
    SignedOut,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("The session has been signed out")]
    SignedOut,

    #[error("The session is closed")]
    Closed,

    #[error("{0} is not in the chat list")]
    UnknownContact(String),

    #[error("Avatar URL must not be empty")]
    EmptyAvatar,
}

/// Reasons a send request is refused before the pipeline starts
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("Message is empty")]
    Empty,

    #[error("No conversation is selected")]
    NoConversation,

    #[error("Another message is still being sent")]
    Busy,

    #[error("The session is closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendFailure {
    #[error("Moderation failed: {0}")]
    Moderation(String),

    #[error("Moderation timed out")]
    ModerationTimedOut,

    #[error("Could not store message: {0}")]
    Append(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent(Message),
    /// The classifier judged the message unsafe; nothing was written
    Rejected { reason: Option<String> },
    /// A remote call failed; nothing was written and nothing is retried
    Failed(SendFailure),
}

#[derive(Debug, Error)]
pub enum AddContactError {
    #[error("Email address is empty")]
    InvalidEmail,

    #[error("Cannot add yourself")]
    SelfAdd,

    #[error("No user with email {0}")]
    NotFound(String),

    #[error("{0} is already in the chat list")]
    AlreadyContact(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("The session is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum RemoveContactError {
    #[error("{0} is not in the chat list")]
    NotAContact(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("The session is closed")]
    Closed,
}

#[derive(Debug, Default)]
struct ViewState {
    contacts: Vec<User>,
    selected: Option<User>,
    conversation_id: Option<String>,
    messages: Vec<Message>,
}

struct SessionInner {
    user_id: String,
    profile: Mutex<User>,
    store: Arc<dyn ChatStore>,
    moderator: Arc<dyn Moderator>,
    options: SessionOptions,
    events: mpsc::UnboundedSender<SessionEvent>,
    view: Mutex<ViewState>,
    send_state: Mutex<SendState>,
    // Serialises selection changes so only one message feed is ever open
    switching: AsyncMutex<()>,
    message_feed: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn emit(&self, event: SessionEvent) {
        // A dropped receiver only means nobody is rendering anymore
        let _ = self.events.send(event);
    }

    fn notice(&self, notice: Notice) {
        match notice.level {
            NoticeLevel::Info => info!("{}: {}", notice.title, notice.description),
            NoticeLevel::Error => warn!("{}: {}", notice.title, notice.description),
        }
        self.emit(SessionEvent::Notice(notice));
    }

    fn set_send_state(&self, state: SendState) {
        *lock(&self.send_state) = state;
        debug!("Send state for {} -> {:?}", self.user_id, state);
        self.emit(SessionEvent::SendStateChanged(state));
    }

    fn close(&self) {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        let feed = lock(&self.message_feed).take();
        if let Some(feed) = feed {
            feed.abort();
        }
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        if first {
            info!("Chat session for {} closed", self.user_id);
        }
    }

    /// Apply a fresh contact list and reconcile the selection against it.
    async fn apply_contacts(self: &Arc<Self>, contacts: Vec<User>) {
        let _switching = self.switching.lock().await;
        if self.is_closed() {
            return;
        }

        let (previous, next) = {
            let mut view = lock(&self.view);
            view.contacts = contacts.clone();
            let previous = view.selected.clone();
            let next = reconcile_selection(previous.as_ref().map(|u| u.id.as_str()), &contacts);
            (previous, next)
        };
        debug!("Contact list for {} now has {} entries", self.user_id, contacts.len());
        self.emit(SessionEvent::ContactsChanged(contacts));

        let same_contact = previous.as_ref().map(|u| u.id.as_str()) == next.as_ref().map(|u| u.id.as_str());
        if same_contact {
            // Presence or avatar of the selected contact may still have changed
            if previous != next {
                lock(&self.view).selected = next.clone();
                self.emit(SessionEvent::SelectionChanged(next));
            }
        } else {
            self.open_conversation(next).await;
        }
    }

    /// Replace the open message feed with the one for `next`.
    /// Callers hold the `switching` lock.
    async fn open_conversation(self: &Arc<Self>, next: Option<User>) {
        let previous_feed = lock(&self.message_feed).take();
        if let Some(feed) = previous_feed {
            feed.abort();
            // Wait until the old subscription has actually been released
            let _ = feed.await;
        }

        let conversation = next.as_ref().map(|user| conversation_id(&self.user_id, &user.id));
        {
            let mut view = lock(&self.view);
            view.selected = next.clone();
            view.conversation_id = conversation.clone();
            view.messages.clear();
        }
        match &next {
            Some(user) => debug!("{} selected {}", self.user_id, user.id),
            None => debug!("{} has no selected contact", self.user_id),
        }
        self.emit(SessionEvent::SelectionChanged(next));

        let Some(conversation) = conversation else {
            return;
        };
        let subscription = match self.store.watch_messages(&conversation).await {
            Ok(subscription) => subscription,
            Err(e) => {
                error!("Failed to open message stream for {}: {}", conversation, e);
                self.notice(Notice::error("Error", "Failed to load messages. Please try again."));
                return;
            }
        };
        self.apply_messages(&conversation, subscription.current());

        let mut feed = lock(&self.message_feed);
        if self.is_closed() {
            return;
        }
        *feed = Some(tokio::spawn(message_listener(
            Arc::clone(self),
            conversation,
            subscription,
        )));
    }

    fn apply_messages(&self, conversation: &str, messages: Vec<Message>) {
        {
            let mut view = lock(&self.view);
            if view.conversation_id.as_deref() != Some(conversation) {
                return;
            }
            view.messages = messages.clone();
        }
        self.emit(SessionEvent::MessagesChanged {
            conversation_id: conversation.to_string(),
            messages,
        });
    }
}

async fn contact_listener(inner: Arc<SessionInner>, mut contacts: Subscription<Vec<User>>) {
    while let Some(list) = contacts.changed().await {
        inner.apply_contacts(list).await;
    }
    debug!("Contact stream for {} ended", inner.user_id);
}

async fn message_listener(
    inner: Arc<SessionInner>,
    conversation: String,
    mut messages: Subscription<Vec<Message>>,
) {
    while let Some(list) = messages.changed().await {
        inner.apply_messages(&conversation, list);
    }
    debug!("Message stream for {} ended", conversation);
}

async fn sign_out_watcher(inner: Arc<SessionInner>, mut binding: SessionBinding) {
    binding.signed_out().await;
    info!("Session for {} ended by sign-out", inner.user_id);
    inner.emit(SessionEvent::SignedOut);
    inner.close();
}

/// Returns the pipeline to `Idle` however the send ends.
struct SendGuard<'a> {
    inner: &'a SessionInner,
}

impl<'a> SendGuard<'a> {
    fn begin(inner: &'a SessionInner) -> Result<Self, SendError> {
        {
            let mut state = lock(&inner.send_state);
            if state.is_busy() {
                return Err(SendError::Busy);
            }
            *state = SendState::Filtering;
        }
        debug!("Send state for {} -> {:?}", inner.user_id, SendState::Filtering);
        inner.emit(SessionEvent::SendStateChanged(SendState::Filtering));
        Ok(Self { inner })
    }

    fn enter(&self, state: SendState) {
        self.inner.set_send_state(state);
    }
}

impl Drop for SendGuard<'_> {
    fn drop(&mut self) {
        self.inner.set_send_state(SendState::Idle);
    }
}

pub struct ChatSession {
    inner: Arc<SessionInner>,
}

impl ChatSession {
    /// Start a session for `user`.
    ///
    /// Subscribes to the user's contact set, selects a contact, opens its
    /// message feed and starts watching for sign-out. Events are delivered
    /// on the returned receiver.
    pub async fn start(
        user: LoggedInUser,
        store: Arc<dyn ChatStore>,
        moderator: Arc<dyn Moderator>,
        options: SessionOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), SessionError> {
        if !user.binding.is_active() {
            return Err(SessionError::SignedOut);
        }
        let LoggedInUser { profile, binding } = user;
        let contacts = store.watch_contacts(&profile.id).await?;
        let (events, receiver) = mpsc::unbounded_channel();

        info!("Starting chat session for {} <{}>", profile.id, profile.email);
        let inner = Arc::new(SessionInner {
            user_id: profile.id.clone(),
            profile: Mutex::new(profile),
            store,
            moderator,
            options,
            events,
            view: Mutex::new(ViewState::default()),
            send_state: Mutex::new(SendState::Idle),
            switching: AsyncMutex::new(()),
            message_feed: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        inner.apply_contacts(contacts.current()).await;
        let listener = tokio::spawn(contact_listener(Arc::clone(&inner), contacts));
        let watcher = tokio::spawn(sign_out_watcher(Arc::clone(&inner), binding));
        lock(&inner.tasks).extend([listener, watcher]);
        if inner.is_closed() {
            // Signed out while starting; abort the tasks registered just now
            inner.close();
        }

        Ok((Self { inner }, receiver))
    }

    pub fn profile(&self) -> User {
        lock(&self.inner.profile).clone()
    }

    pub fn contacts(&self) -> Vec<User> {
        lock(&self.inner.view).contacts.clone()
    }

    pub fn selected_contact(&self) -> Option<User> {
        lock(&self.inner.view).selected.clone()
    }

    /// Conversation id of the selected contact
    pub fn conversation_id(&self) -> Option<String> {
        lock(&self.inner.view).conversation_id.clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        lock(&self.inner.view).messages.clone()
    }

    pub fn send_state(&self) -> SendState {
        *lock(&self.inner.send_state)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Case-insensitive substring filter over the open conversation.
    /// The query is matched as typed, whitespace included.
    pub fn search_messages(&self, query: &str) -> Vec<Message> {
        let needle = query.to_lowercase();
        let view = lock(&self.inner.view);
        if needle.is_empty() {
            return view.messages.clone();
        }
        view.messages
            .iter()
            .filter(|message| message.text.to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }

    pub async fn select_contact(&self, user_id: &str) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let _switching = self.inner.switching.lock().await;
        let (contact, current) = {
            let view = lock(&self.inner.view);
            let contact = view.contacts.iter().find(|user| user.id == user_id).cloned();
            (contact, view.selected.as_ref().map(|user| user.id.clone()))
        };
        let contact = contact.ok_or_else(|| SessionError::UnknownContact(user_id.to_string()))?;
        if current.as_deref() == Some(user_id) {
            return Ok(());
        }
        self.inner.open_conversation(Some(contact)).await;
        Ok(())
    }

    /// Run one message through the filter, the classifier and the store.
    ///
    /// `Err` means the request was refused up front and the pipeline never
    /// started. Everything that happens once it has started is reported as
    /// a `SendOutcome`, together with a notice for the user.
    pub async fn send_message(&self, text: &str) -> Result<SendOutcome, SendError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(SendError::Closed);
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(SendError::Empty);
        }
        let conversation = lock(&inner.view)
            .conversation_id
            .clone()
            .ok_or(SendError::NoConversation)?;

        let guard = SendGuard::begin(inner)?;
        let filtered = filter_profanity(text);

        guard.enter(SendState::Moderating);
        let moderation = tokio::time::timeout(
            inner.options.moderation_timeout,
            inner.moderator.moderate(&filtered),
        )
        .await;
        let verdict = match moderation {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(e)) => {
                error!("Moderation request failed: {}", e);
                return Ok(self.send_failed(SendFailure::Moderation(e.to_string())));
            }
            Err(_) => {
                warn!(
                    "Moderation did not answer within {:?}",
                    inner.options.moderation_timeout
                );
                return Ok(self.send_failed(SendFailure::ModerationTimedOut));
            }
        };

        if !verdict.is_safe {
            guard.enter(SendState::Rejected);
            let reason = verdict.reason.filter(|reason| !reason.trim().is_empty());
            info!("Message to {} rejected by moderation", conversation);
            inner.notice(Notice::error(
                "Message not sent",
                reason.clone().unwrap_or_else(|| GENERIC_REJECTION.to_string()),
            ));
            return Ok(SendOutcome::Rejected { reason });
        }

        guard.enter(SendState::Appending);
        let message = NewMessage {
            sender: SenderSnapshot::of(&self.profile()),
            text: filtered,
        };
        match inner.store.append_message(&conversation, message).await {
            Ok(stored) => {
                debug!("Sent message {} to {}", stored.id, conversation);
                Ok(SendOutcome::Sent(stored))
            }
            Err(e) => {
                error!("Failed to append message to {}: {}", conversation, e);
                Ok(self.send_failed(SendFailure::Append(e.to_string())))
            }
        }
    }

    fn send_failed(&self, failure: SendFailure) -> SendOutcome {
        self.inner.notice(Notice::error("Error", GENERIC_SEND_FAILURE));
        SendOutcome::Failed(failure)
    }

    /// Add the user registered under `email` to both chat lists.
    pub async fn add_contact(&self, email: &str) -> Result<User, AddContactError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(AddContactError::Closed);
        }
        let email = email.trim();
        if email.is_empty() {
            warn!("Refusing to add a contact without an email address");
            return Err(AddContactError::InvalidEmail);
        }

        let target = match inner.store.find_user_by_email(email).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                inner.notice(Notice::error("User not found", "No user with that email exists."));
                return Err(AddContactError::NotFound(email.to_string()));
            }
            Err(e) => return Err(self.add_contact_failed(e)),
        };
        if target.id == inner.user_id {
            inner.notice(Notice::error(
                "Cannot add yourself",
                "You cannot add yourself to your chat list.",
            ));
            return Err(AddContactError::SelfAdd);
        }

        let existing = match inner.store.contact_ids(&inner.user_id).await {
            Ok(ids) => ids,
            Err(e) => return Err(self.add_contact_failed(e)),
        };
        if existing.iter().any(|id| *id == target.id) {
            inner.notice(Notice::error(
                "User already in list",
                "This user is already in your chat list.",
            ));
            return Err(AddContactError::AlreadyContact(target.email));
        }

        if let Err(e) = inner.store.add_contact_pair(&inner.user_id, &target.id).await {
            return Err(self.add_contact_failed(e));
        }
        inner.notice(Notice::info(
            "Contact added",
            format!("{} was added to your chat list.", target.name),
        ));
        Ok(target)
    }

    fn add_contact_failed(&self, e: StoreError) -> AddContactError {
        error!("Failed to add contact: {}", e);
        self.inner
            .notice(Notice::error("Error", "Failed to add contact. Please try again."));
        AddContactError::Store(e)
    }

    /// Remove `user_id` from both chat lists.
    ///
    /// Only the caller's side is checked; both directions are deleted, which
    /// also repairs a one-sided link.
    pub async fn remove_contact(&self, user_id: &str) -> Result<(), RemoveContactError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(RemoveContactError::Closed);
        }
        let listed = match inner.store.contact_ids(&inner.user_id).await {
            Ok(ids) => ids,
            Err(e) => return Err(self.remove_contact_failed(user_id, e)),
        };
        if !listed.iter().any(|id| id == user_id) {
            warn!("{} tried to remove non-contact {}", inner.user_id, user_id);
            return Err(RemoveContactError::NotAContact(user_id.to_string()));
        }
        if let Err(e) = inner.store.remove_contact_pair(&inner.user_id, user_id).await {
            return Err(self.remove_contact_failed(user_id, e));
        }
        Ok(())
    }

    fn remove_contact_failed(&self, user_id: &str, e: StoreError) -> RemoveContactError {
        error!("Failed to remove contact {}: {}", user_id, e);
        self.inner
            .notice(Notice::error("Error", "Failed to remove contact. Please try again."));
        RemoveContactError::Store(e)
    }

    /// Change the avatar of the logged-in user. Messages already sent keep
    /// the avatar they were sent with.
    pub async fn update_avatar(&self, avatar_url: &str) -> Result<User, SessionError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(SessionError::Closed);
        }
        let avatar_url = avatar_url.trim();
        if avatar_url.is_empty() {
            return Err(SessionError::EmptyAvatar);
        }
        let updated = match inner.store.update_avatar(&inner.user_id, avatar_url).await {
            Ok(user) => user,
            Err(e) => {
                error!("Failed to update avatar: {}", e);
                inner.notice(Notice::error(
                    "Error",
                    "Failed to update your profile picture. Please try again.",
                ));
                return Err(e.into());
            }
        };
        *lock(&inner.profile) = updated.clone();
        inner.emit(SessionEvent::ProfileChanged(updated.clone()));
        inner.notice(Notice::info(
            "Profile Updated",
            "Your profile picture has been changed.",
        ));
        Ok(updated)
    }

    /// Tear the session down: abort listeners and release every subscription.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.inner.close();
    }
}
