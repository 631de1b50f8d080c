// src/store/sqlite.rs
//! SQLite-backed document store
//!
//! All reads and writes go through one connection guarded by an async mutex.
//! Live views are published while that lock is still held, so a subscriber
//! never misses a write that happened between loading its initial value and
//! registering.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info, warn};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    ContactStore, MessageStream, PasswordRecord, StoreError, Subscription, SubscriptionHub,
    UserDirectory,
};
use crate::models::{
    conversation_id, participants, Conversation, LastMessage, Message, NewMessage, NewUser,
    SenderSnapshot, User,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        email TEXT NOT NULL UNIQUE COLLATE NOCASE,
        avatar_url TEXT NOT NULL,
        online INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS credentials (
        user_id TEXT PRIMARY KEY REFERENCES users (id) ON DELETE CASCADE,
        salt TEXT NOT NULL,
        digest TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS contacts (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        owner_id TEXT NOT NULL,
        partner_id TEXT NOT NULL,
        added_at INTEGER NOT NULL,
        UNIQUE (owner_id, partner_id)
    );
    CREATE TABLE IF NOT EXISTS chats (
        id TEXT PRIMARY KEY,
        participant_a TEXT NOT NULL,
        participant_b TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        last_message TEXT
    );
    CREATE TABLE IF NOT EXISTS messages (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        chat_id TEXT NOT NULL,
        sender TEXT NOT NULL,
        text TEXT NOT NULL,
        timestamp INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS messages_by_chat ON messages (chat_id, timestamp, seq);
    CREATE INDEX IF NOT EXISTS contacts_by_partner ON contacts (partner_id);
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
    contact_views: SubscriptionHub<Vec<User>>,
    message_views: SubscriptionHub<Vec<Message>>,
}

impl SqliteStore {
    /// Open (or create) a store at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        info!("Opened chat store at {}", path.display());
        Self::with_connection(conn)
    }

    /// A throwaway store, used by tests and demos
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            contact_views: SubscriptionHub::new("contacts"),
            message_views: SubscriptionHub::new("messages"),
        })
    }

    /// Live contact-list registrations, keyed by owner id
    pub fn contact_views(&self) -> &SubscriptionHub<Vec<User>> {
        &self.contact_views
    }

    /// Live message-list registrations, keyed by conversation id
    pub fn message_views(&self) -> &SubscriptionHub<Vec<Message>> {
        &self.message_views
    }

    /// Total live registrations across both kinds of view
    pub fn active_subscriptions(&self) -> usize {
        self.contact_views.len() + self.message_views.len()
    }

    fn publish_contacts(&self, conn: &Connection, owner_id: &str) -> Result<(), StoreError> {
        if self.contact_views.is_watched(owner_id) {
            let contacts = load_contacts(conn, owner_id)?;
            debug!("Publishing {} contacts for {}", contacts.len(), owner_id);
            self.contact_views.publish(owner_id, contacts);
        }
        Ok(())
    }

    /// Refresh the contact views of everyone who lists `user_id`
    fn publish_profile_change(&self, conn: &Connection, user_id: &str) -> Result<(), StoreError> {
        let mut stmt = conn.prepare("SELECT owner_id FROM contacts WHERE partner_id = ?1")?;
        let owners = stmt
            .query_map(params![user_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        for owner in owners {
            self.publish_contacts(conn, &owner)?;
        }
        Ok(())
    }

    fn publish_messages(&self, conn: &Connection, chat_id: &str) -> Result<(), StoreError> {
        if self.message_views.is_watched(chat_id) {
            let messages = load_messages(conn, chat_id)?;
            self.message_views.publish(chat_id, messages);
        }
        Ok(())
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get("id")?,
        name: row.get("name")?,
        email: row.get("email")?,
        avatar_url: row.get("avatar_url")?,
        online: row.get::<_, i64>("online")? != 0,
    })
}

fn load_user(conn: &Connection, user_id: &str) -> Result<Option<User>, StoreError> {
    let user = conn
        .query_row(
            "SELECT id, name, email, avatar_url, online FROM users WHERE id = ?1",
            params![user_id],
            user_from_row,
        )
        .optional()?;
    Ok(user)
}

fn load_user_by_email(conn: &Connection, email: &str) -> Result<Option<User>, StoreError> {
    let user = conn
        .query_row(
            "SELECT id, name, email, avatar_url, online FROM users WHERE email = ?1 COLLATE NOCASE",
            params![email.trim()],
            user_from_row,
        )
        .optional()?;
    Ok(user)
}

fn load_contact_ids(conn: &Connection, owner_id: &str) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare("SELECT partner_id FROM contacts WHERE owner_id = ?1 ORDER BY seq")?;
    let ids = stmt
        .query_map(params![owner_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn load_contacts(conn: &Connection, owner_id: &str) -> Result<Vec<User>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT u.id, u.name, u.email, u.avatar_url, u.online
         FROM contacts c JOIN users u ON u.id = c.partner_id
         WHERE c.owner_id = ?1
         ORDER BY c.seq",
    )?;
    let users = stmt
        .query_map(params![owner_id], user_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(users)
}

fn load_messages(conn: &Connection, chat_id: &str) -> Result<Vec<Message>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, sender, text, timestamp FROM messages
         WHERE chat_id = ?1
         ORDER BY timestamp ASC, seq ASC",
    )?;
    let rows = stmt
        .query_map(params![chat_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut messages = Vec::with_capacity(rows.len());
    for (id, sender_json, text, timestamp) in rows {
        let sender: SenderSnapshot = serde_json::from_str(&sender_json)?;
        messages.push(Message {
            id,
            conversation_id: chat_id.to_string(),
            sender,
            text,
            timestamp: from_millis(timestamp),
        });
    }
    Ok(messages)
}

fn load_conversation(conn: &Connection, chat_id: &str) -> Result<Option<Conversation>, StoreError> {
    let row = conn
        .query_row(
            "SELECT participant_a, participant_b, created_at, last_message FROM chats WHERE id = ?1",
            params![chat_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            },
        )
        .optional()?;

    let Some((a, b, created_at, last_message)) = row else {
        return Ok(None);
    };
    let last_message = match last_message {
        Some(json) => Some(serde_json::from_str::<LastMessage>(&json)?),
        None => None,
    };
    Ok(Some(Conversation {
        id: chat_id.to_string(),
        participants: [a, b],
        created_at: from_millis(created_at),
        last_message,
    }))
}

/// Create the conversation record for a pair unless it already exists
fn ensure_chat(conn: &Connection, a: &str, b: &str) -> Result<String, StoreError> {
    let chat_id = conversation_id(a, b);
    let [first, second] = participants(a, b);
    let created = conn.execute(
        "INSERT OR IGNORE INTO chats (id, participant_a, participant_b, created_at, last_message)
         VALUES (?1, ?2, ?3, ?4, NULL)",
        params![chat_id, first, second, now_millis()],
    )?;
    if created > 0 {
        debug!("Created conversation {}", chat_id);
    }
    Ok(chat_id)
}

/// Recover the other participant of `chat_id` given one known participant
fn other_participant(chat_id: &str, known: &str) -> Option<String> {
    let candidate = chat_id
        .strip_prefix(&format!("{}_", known))
        .or_else(|| chat_id.strip_suffix(&format!("_{}", known)))?;
    if conversation_id(known, candidate) == chat_id {
        Some(candidate.to_string())
    } else {
        None
    }
}

#[async_trait]
impl UserDirectory for SqliteStore {
    async fn create_user(&self, user: NewUser, password: PasswordRecord) -> Result<User, StoreError> {
        let mut conn = self.conn.lock().await;
        let email = user.email.trim().to_string();
        if load_user_by_email(&conn, &email)?.is_some() {
            return Err(StoreError::EmailInUse(email));
        }

        let id = Uuid::new_v4().to_string();
        let avatar_url = user
            .avatar_url
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| User::default_avatar(&id));
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO users (id, name, email, avatar_url, online, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![id, user.name.trim(), email, avatar_url, now_millis()],
        )?;
        tx.execute(
            "INSERT INTO credentials (user_id, salt, digest) VALUES (?1, ?2, ?3)",
            params![id, password.salt, password.digest],
        )?;
        tx.commit()?;

        info!("Created user {} <{}>", id, email);
        load_user(&conn, &id)?.ok_or(StoreError::UserNotFound(id))
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        let conn = self.conn.lock().await;
        load_user(&conn, user_id)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let conn = self.conn.lock().await;
        load_user_by_email(&conn, email)
    }

    async fn password_record(&self, email: &str) -> Result<Option<(User, PasswordRecord)>, StoreError> {
        let conn = self.conn.lock().await;
        let Some(user) = load_user_by_email(&conn, email)? else {
            return Ok(None);
        };
        let record = conn
            .query_row(
                "SELECT salt, digest FROM credentials WHERE user_id = ?1",
                params![user.id],
                |row| {
                    Ok(PasswordRecord {
                        salt: row.get(0)?,
                        digest: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(record.map(|record| (user, record)))
    }

    async fn update_avatar(&self, user_id: &str, avatar_url: &str) -> Result<User, StoreError> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE users SET avatar_url = ?1 WHERE id = ?2",
            params![avatar_url.trim(), user_id],
        )?;
        if updated == 0 {
            return Err(StoreError::UserNotFound(user_id.to_string()));
        }
        self.publish_profile_change(&conn, user_id)?;
        load_user(&conn, user_id)?.ok_or_else(|| StoreError::UserNotFound(user_id.to_string()))
    }

    async fn set_online(&self, user_id: &str, online: bool) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE users SET online = ?1 WHERE id = ?2",
            params![online as i64, user_id],
        )?;
        if updated == 0 {
            return Err(StoreError::UserNotFound(user_id.to_string()));
        }
        debug!("User {} is now {}", user_id, if online { "online" } else { "offline" });
        self.publish_profile_change(&conn, user_id)
    }
}

#[async_trait]
impl ContactStore for SqliteStore {
    async fn contact_ids(&self, owner_id: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().await;
        load_contact_ids(&conn, owner_id)
    }

    async fn add_contact_pair(&self, a: &str, b: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        for id in [a, b] {
            if load_user(&conn, id)?.is_none() {
                return Err(StoreError::UserNotFound(id.to_string()));
            }
        }

        let now = now_millis();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO contacts (owner_id, partner_id, added_at) VALUES (?1, ?2, ?3)",
            params![a, b, now],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO contacts (owner_id, partner_id, added_at) VALUES (?1, ?2, ?3)",
            params![b, a, now],
        )?;
        let chat_id = ensure_chat(&tx, a, b)?;
        tx.commit()?;
        info!("Linked contacts {} <-> {} (conversation {})", a, b, chat_id);

        self.publish_contacts(&conn, a)?;
        self.publish_contacts(&conn, b)
    }

    async fn remove_contact_pair(&self, a: &str, b: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM contacts
             WHERE (owner_id = ?1 AND partner_id = ?2) OR (owner_id = ?2 AND partner_id = ?1)",
            params![a, b],
        )?;
        tx.commit()?;
        if removed < 2 {
            warn!("Contact link {} <-> {} was asymmetric before removal ({} sides)", a, b, removed);
        }
        info!("Unlinked contacts {} <-> {}", a, b);

        self.publish_contacts(&conn, a)?;
        self.publish_contacts(&conn, b)
    }

    async fn watch_contacts(&self, owner_id: &str) -> Result<Subscription<Vec<User>>, StoreError> {
        let conn = self.conn.lock().await;
        let contacts = load_contacts(&conn, owner_id)?;
        Ok(self.contact_views.subscribe(owner_id, contacts))
    }
}

#[async_trait]
impl MessageStream for SqliteStore {
    async fn append_message(&self, chat_id: &str, message: NewMessage) -> Result<Message, StoreError> {
        let mut conn = self.conn.lock().await;
        let sender_id = message.sender.id.clone();
        let other = other_participant(chat_id, &sender_id)
            .ok_or_else(|| StoreError::InvalidConversation(chat_id.to_string()))?;

        let id = Uuid::new_v4().to_string();
        let millis = now_millis();
        let stored = Message {
            id: id.clone(),
            conversation_id: chat_id.to_string(),
            sender: message.sender,
            text: message.text,
            timestamp: from_millis(millis),
        };
        let last = LastMessage {
            message_id: id.clone(),
            sender_id: sender_id.clone(),
            text: stored.text.clone(),
            timestamp: stored.timestamp,
        };

        let tx = conn.transaction()?;
        ensure_chat(&tx, &sender_id, &other)?;
        tx.execute(
            "INSERT INTO messages (id, chat_id, sender, text, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, chat_id, serde_json::to_string(&stored.sender)?, stored.text, millis],
        )?;
        tx.execute(
            "UPDATE chats SET last_message = ?1 WHERE id = ?2",
            params![serde_json::to_string(&last)?, chat_id],
        )?;
        tx.commit()?;
        debug!("Appended message {} to {}", id, chat_id);

        self.publish_messages(&conn, chat_id)?;
        Ok(stored)
    }

    async fn messages(&self, chat_id: &str) -> Result<Vec<Message>, StoreError> {
        let conn = self.conn.lock().await;
        load_messages(&conn, chat_id)
    }

    async fn conversation(&self, chat_id: &str) -> Result<Option<Conversation>, StoreError> {
        let conn = self.conn.lock().await;
        load_conversation(&conn, chat_id)
    }

    async fn watch_messages(&self, chat_id: &str) -> Result<Subscription<Vec<Message>>, StoreError> {
        let conn = self.conn.lock().await;
        let messages = load_messages(&conn, chat_id)?;
        Ok(self.message_views.subscribe(chat_id, messages))
    }
}
