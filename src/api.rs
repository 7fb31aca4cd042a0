//! Boundary to the remote conversation API.
//!
//! The engine only talks to [`ConversationApi`]; the Slack implementation
//! lives in [`crate::slack`] and tests plug in a scripted fake.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::UnrecoverableKind;
use crate::model::{Conversation, Message, Timestamp, User};

/// Group of endpoints sharing one server-side rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointFamily {
    /// `auth.test`, resolving which workspace the token belongs to.
    Identity,
    ConversationsList,
    UsersList,
    History,
    Replies,
}

impl EndpointFamily {
    pub const ALL: [EndpointFamily; 5] = [
        EndpointFamily::Identity,
        EndpointFamily::ConversationsList,
        EndpointFamily::UsersList,
        EndpointFamily::History,
        EndpointFamily::Replies,
    ];

    pub fn method(&self) -> &'static str {
        match self {
            EndpointFamily::Identity => "auth.test",
            EndpointFamily::ConversationsList => "conversations.list",
            EndpointFamily::UsersList => "users.list",
            EndpointFamily::History => "conversations.history",
            EndpointFamily::Replies => "conversations.replies",
        }
    }

    /// Requests per minute Slack documents for the method's tier.
    pub fn tier_rpm(&self) -> u32 {
        match self {
            EndpointFamily::Identity => 100,
            EndpointFamily::ConversationsList | EndpointFamily::UsersList => 20,
            EndpointFamily::History | EndpointFamily::Replies => 50,
        }
    }

    /// Even spacing that keeps a family inside its tier.
    pub fn tier_spacing(&self) -> Duration {
        Duration::from_millis(60_000 / u64::from(self.tier_rpm()))
    }
}

impl fmt::Display for EndpointFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method())
    }
}

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    /// Slack signals the terminal page with an absent or blank cursor.
    pub fn new(items: Vec<T>, next_cursor: Option<String>) -> Self {
        let next_cursor = next_cursor.filter(|c| !c.trim().is_empty());
        Self { items, next_cursor }
    }

    pub fn is_last(&self) -> bool {
        self.next_cursor.is_none()
    }
}

/// Raw classification of one failed attempt, before any retry policy.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiFailure {
    RateLimited { retry_after: Option<Duration> },
    Transport(String),
    Unrecoverable {
        kind: UnrecoverableKind,
        message: String,
    },
}

impl ApiFailure {
    pub fn authorization(message: impl Into<String>) -> Self {
        ApiFailure::Unrecoverable {
            kind: UnrecoverableKind::Authorization,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiFailure::Unrecoverable {
            kind: UnrecoverableKind::NotFound,
            message: message.into(),
        }
    }

    /// Maps a Slack `error` code from an `ok: false` body.
    pub fn from_slack_code(code: &str) -> Self {
        match code {
            "ratelimited" | "rate_limited" => ApiFailure::RateLimited { retry_after: None },
            "invalid_auth" | "not_authed" | "token_revoked" | "token_expired"
            | "account_inactive" | "missing_scope" | "not_in_channel" | "access_denied"
            | "no_permission" | "ekm_access_denied" => ApiFailure::authorization(code),
            "channel_not_found" | "thread_not_found" | "user_not_found" | "team_not_found" => {
                ApiFailure::not_found(code)
            }
            "internal_error" | "fatal_error" | "service_unavailable" | "request_timeout" => {
                ApiFailure::Transport(code.to_string())
            }
            other => ApiFailure::Unrecoverable {
                kind: UnrecoverableKind::Other,
                message: other.to_string(),
            },
        }
    }
}

/// Optional time bounds for history requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryWindow {
    pub oldest: Option<Timestamp>,
    pub latest: Option<Timestamp>,
}

#[async_trait]
pub trait ConversationApi: Send + Sync {
    /// Identity of the workspace the credentials belong to.
    async fn workspace_id(&self) -> Result<String, ApiFailure>;

    async fn list_conversations(
        &self,
        cursor: Option<&str>,
        limit: u16,
        include_archived: bool,
    ) -> Result<Page<Conversation>, ApiFailure>;

    async fn list_users(&self, cursor: Option<&str>, limit: u16)
    -> Result<Page<User>, ApiFailure>;

    async fn history(
        &self,
        conversation_id: &str,
        window: &HistoryWindow,
        cursor: Option<&str>,
        limit: u16,
    ) -> Result<Page<Message>, ApiFailure>;

    async fn replies(
        &self,
        conversation_id: &str,
        parent_ts: &Timestamp,
        cursor: Option<&str>,
        limit: u16,
    ) -> Result<Page<Message>, ApiFailure>;
}
