//! Persistence collaborator — users, sessions, chat history, and
//! activity records.
//!
//! The engine consumes a [`SessionStore`] instance injected at
//! startup; it never reaches for an ambient global handle. Every call
//! is best-effort: failures are logged by the caller and never block
//! or fail the protocol operation that triggered them.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use visor_core::VisorError;

pub type UserId = String;
pub type SessionId = String;

// ── Records ──────────────────────────────────────────────────────

/// A known participant identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub name: String,
    pub password_hash: String,
    pub admin: bool,
    /// Milliseconds since the Unix epoch; `None` until the first login.
    pub last_login_ms: Option<u64>,
}

/// One connection's lifetime in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub user_id: UserId,
    pub name: String,
    pub peer_addr: String,
    pub started_ms: u64,
    pub ended_ms: Option<u64>,
}

/// A persisted chat line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRecord {
    pub session_id: SessionId,
    pub sender: String,
    pub text: String,
    pub sent_ms: u64,
}

/// A persisted activity entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub session_id: SessionId,
    pub kind: ActivityKind,
    pub details: String,
    pub at_ms: u64,
}

/// What happened. Matches the audit vocabulary of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Connect,
    Disconnect,
    Chat,
    FileUpload,
    ControlGrant,
    ControlRevoke,
    MouseControl,
    KeyboardControl,
}

impl ActivityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityKind::Connect => "connect",
            ActivityKind::Disconnect => "disconnect",
            ActivityKind::Chat => "chat",
            ActivityKind::FileUpload => "file_upload",
            ActivityKind::ControlGrant => "control_grant",
            ActivityKind::ControlRevoke => "control_revoke",
            ActivityKind::MouseControl => "mouse_control",
            ActivityKind::KeyboardControl => "keyboard_control",
        }
    }
}

// ── Trait ────────────────────────────────────────────────────────

/// Document-store-backed persistence, consumed through CRUD-style
/// operations. Implementations must be safe to call from any task.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn find_user(&self, name: &str) -> Result<Option<UserRecord>, VisorError>;

    async fn create_user(&self, name: &str, password_hash: &str) -> Result<UserId, VisorError>;

    async fn update_last_login(&self, name: &str) -> Result<(), VisorError>;

    async fn start_session(
        &self,
        user_id: &UserId,
        name: &str,
        peer_addr: &str,
    ) -> Result<SessionId, VisorError>;

    async fn end_session(&self, session_id: &SessionId) -> Result<(), VisorError>;

    async fn save_chat_message(
        &self,
        session_id: &SessionId,
        sender: &str,
        text: &str,
    ) -> Result<(), VisorError>;

    /// Chat lines for a session, oldest first, at most `limit`.
    async fn recent_chat_messages(
        &self,
        session_id: &SessionId,
        limit: usize,
    ) -> Result<Vec<ChatRecord>, VisorError>;

    async fn record_activity(
        &self,
        session_id: &SessionId,
        kind: ActivityKind,
        details: &str,
    ) -> Result<(), VisorError>;

    /// Digest a password for storage. Hashing mechanics belong to the
    /// store implementation, not to the engine.
    fn hash_password(&self, password: &str) -> String;
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── MemoryStore ──────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemoryInner {
    users: HashMap<String, UserRecord>,
    sessions: HashMap<SessionId, SessionRecord>,
    chat: Vec<ChatRecord>,
    activity: Vec<ActivityRecord>,
    /// How many times `end_session` ran per session, for auditing
    /// teardown idempotence.
    end_calls: HashMap<SessionId, u32>,
    next_id: u64,
}

/// Concurrency-safe in-memory store. The reference implementation for
/// tests and for embedders that do not wire a database.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(inner: &mut MemoryInner, prefix: &str) -> String {
        inner.next_id += 1;
        format!("{prefix}-{}", inner.next_id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().expect("memory store lock poisoned")
    }

    /// All session records, for inspection.
    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.lock().sessions.values().cloned().collect()
    }

    /// All activity records, for inspection.
    pub fn activity(&self) -> Vec<ActivityRecord> {
        self.lock().activity.clone()
    }

    /// How many times `end_session` was invoked for a session.
    pub fn end_session_calls(&self, session_id: &SessionId) -> u32 {
        self.lock().end_calls.get(session_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn find_user(&self, name: &str) -> Result<Option<UserRecord>, VisorError> {
        Ok(self.lock().users.get(name).cloned())
    }

    async fn create_user(&self, name: &str, password_hash: &str) -> Result<UserId, VisorError> {
        let mut inner = self.lock();
        let id = Self::next_id(&mut inner, "user");
        inner.users.insert(
            name.to_string(),
            UserRecord {
                id: id.clone(),
                name: name.to_string(),
                password_hash: password_hash.to_string(),
                admin: false,
                last_login_ms: Some(now_ms()),
            },
        );
        Ok(id)
    }

    async fn update_last_login(&self, name: &str) -> Result<(), VisorError> {
        let mut inner = self.lock();
        match inner.users.get_mut(name) {
            Some(user) => {
                user.last_login_ms = Some(now_ms());
                Ok(())
            }
            None => Err(VisorError::Persistence(format!("no such user: {name}"))),
        }
    }

    async fn start_session(
        &self,
        user_id: &UserId,
        name: &str,
        peer_addr: &str,
    ) -> Result<SessionId, VisorError> {
        let mut inner = self.lock();
        let id = Self::next_id(&mut inner, "session");
        inner.sessions.insert(
            id.clone(),
            SessionRecord {
                id: id.clone(),
                user_id: user_id.clone(),
                name: name.to_string(),
                peer_addr: peer_addr.to_string(),
                started_ms: now_ms(),
                ended_ms: None,
            },
        );
        Ok(id)
    }

    async fn end_session(&self, session_id: &SessionId) -> Result<(), VisorError> {
        let mut inner = self.lock();
        *inner.end_calls.entry(session_id.clone()).or_insert(0) += 1;
        match inner.sessions.get_mut(session_id) {
            Some(session) => {
                session.ended_ms = Some(now_ms());
                Ok(())
            }
            None => Err(VisorError::Persistence(format!(
                "no such session: {session_id}"
            ))),
        }
    }

    async fn save_chat_message(
        &self,
        session_id: &SessionId,
        sender: &str,
        text: &str,
    ) -> Result<(), VisorError> {
        self.lock().chat.push(ChatRecord {
            session_id: session_id.clone(),
            sender: sender.to_string(),
            text: text.to_string(),
            sent_ms: now_ms(),
        });
        Ok(())
    }

    async fn recent_chat_messages(
        &self,
        session_id: &SessionId,
        limit: usize,
    ) -> Result<Vec<ChatRecord>, VisorError> {
        let inner = self.lock();
        let matching: Vec<ChatRecord> = inner
            .chat
            .iter()
            .filter(|c| &c.session_id == session_id)
            .cloned()
            .collect();
        let skip = matching.len().saturating_sub(limit);
        Ok(matching.into_iter().skip(skip).collect())
    }

    async fn record_activity(
        &self,
        session_id: &SessionId,
        kind: ActivityKind,
        details: &str,
    ) -> Result<(), VisorError> {
        self.lock().activity.push(ActivityRecord {
            session_id: session_id.clone(),
            kind,
            details: details.to_string(),
            at_ms: now_ms(),
        });
        Ok(())
    }

    // The reference store keeps the secret verbatim; real stores
    // substitute their own digest.
    fn hash_password(&self, password: &str) -> String {
        password.to_string()
    }
}

// ── Tests ────────────────────────────────────────────────────────
