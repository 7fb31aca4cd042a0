use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Slack message timestamp ("1767636991.559059").
///
/// Unique per conversation, so it doubles as message id and sort key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timestamp {
    secs: u64,
    micros: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid Slack timestamp: {0:?}")]
pub struct InvalidTimestamp(pub String);

impl Timestamp {
    pub fn new(secs: u64, micros: u32) -> Self {
        Self {
            secs,
            micros: micros % 1_000_000,
        }
    }

    pub fn secs(&self) -> u64 {
        self.secs
    }
}

impl FromStr for Timestamp {
    type Err = InvalidTimestamp;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidTimestamp(s.to_string());
        let (secs, frac) = s.trim().split_once('.').unwrap_or((s.trim(), ""));
        if secs.is_empty() || frac.len() > 6 {
            return Err(invalid());
        }
        let secs: u64 = secs.parse().map_err(|_| invalid())?;
        let micros = if frac.is_empty() {
            0
        } else {
            // "5" is half a second, not five microseconds
            let padded = format!("{:0<6}", frac);
            padded.parse::<u32>().map_err(|_| invalid())?
        };
        Ok(Self { secs, micros })
    }
}

impl TryFrom<String> for Timestamp {
    type Error = InvalidTimestamp;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timestamp> for String {
    fn from(ts: Timestamp) -> Self {
        ts.to_string()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.secs, self.micros)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    PublicChannel,
    PrivateChannel,
    DirectMessage,
    MultiPersonDirectMessage,
}

impl ConversationKind {
    pub fn label(&self) -> &'static str {
        match self {
            ConversationKind::PublicChannel => "channel",
            ConversationKind::PrivateChannel => "private channel",
            ConversationKind::DirectMessage => "direct_message",
            ConversationKind::MultiPersonDirectMessage => "multiparty-direct_message",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub kind: ConversationKind,
    /// Channel name as listed; direct messages have none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub is_member: bool,
    #[serde(default)]
    pub is_archived: bool,
    /// Peer of a direct message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
}

impl Conversation {
    /// Reads a conversation object as returned by `conversations.list`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let id = value.get("id")?.as_str()?.to_string();
        let flag = |key: &str| value.get(key).and_then(Value::as_bool).unwrap_or(false);
        let text = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let kind = if flag("is_im") {
            ConversationKind::DirectMessage
        } else if flag("is_mpim") {
            ConversationKind::MultiPersonDirectMessage
        } else if flag("is_private") || flag("is_group") {
            ConversationKind::PrivateChannel
        } else {
            ConversationKind::PublicChannel
        };

        Some(Self {
            id,
            kind,
            name: text("name"),
            is_member: kind == ConversationKind::DirectMessage || flag("is_member"),
            is_archived: flag("is_archived"),
            user: text("user"),
            creator: text("creator"),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    /// Handle (`name` in the API).
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub real_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tz: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub roles: Vec<String>,
}

const USER_ROLE_FLAGS: [(&str, &str); 7] = [
    ("is_admin", "admin"),
    ("is_owner", "owner"),
    ("is_primary_owner", "primary_owner"),
    ("is_restricted", "restricted"),
    ("is_ultra_restricted", "ultra_restricted"),
    ("is_bot", "bot"),
    ("is_app_user", "app_user"),
];

impl User {
    /// Reads a member object as returned by `users.list`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let id = value.get("id")?.as_str()?.to_string();
        let profile = value.get("profile");
        let non_empty = |v: Option<&Value>| {
            v.and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let roles = USER_ROLE_FLAGS
            .iter()
            .filter(|(key, _)| value.get(*key).and_then(Value::as_bool).unwrap_or(false))
            .map(|(_, role)| role.to_string())
            .collect();

        Some(Self {
            name: non_empty(value.get("name")).unwrap_or_else(|| id.clone()),
            real_name: non_empty(value.get("real_name"))
                .or_else(|| non_empty(profile.and_then(|p| p.get("real_name")))),
            display_name: non_empty(profile.and_then(|p| p.get("display_name"))),
            tz: non_empty(value.get("tz")),
            deleted: value.get("deleted").and_then(Value::as_bool).unwrap_or(false),
            roles,
            id,
        })
    }

    /// Profile display name, then real name, then handle.
    pub fn preferred_name(&self) -> &str {
        self.display_name
            .as_deref()
            .or(self.real_name.as_deref())
            .unwrap_or(&self.name)
    }
}

/// A message as exported. Fields the engine does not interpret (blocks,
/// files, reactions, ...) ride along in `extra` untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub ts: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_ts: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_reply: Option<Timestamp>,
    /// Inlined thread, parent excluded. `None` until resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replies: Option<Vec<Message>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_unavailable: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    pub fn new(ts: Timestamp, user: Option<String>, text: impl Into<String>) -> Self {
        Self {
            ts,
            channel: None,
            user,
            text: text.into(),
            thread_ts: None,
            reply_count: None,
            latest_reply: None,
            replies: None,
            thread_unavailable: None,
            extra: Map::new(),
        }
    }

    pub fn is_thread_parent(&self) -> bool {
        self.reply_count.is_some_and(|n| n > 0) || self.thread_ts.as_ref() == Some(&self.ts)
    }

    /// True once the inlined thread matches what the parent advertises.
    pub fn thread_settled(&self) -> bool {
        !self.is_thread_parent() || self.replies.is_some() || self.thread_unavailable.is_some()
    }
}

/// Everything exported for one conversation, keyed and ordered by timestamp.
///
/// Merging is idempotent: a page fetched twice leaves the result unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportResult {
    pub conversation: Conversation,
    pub display_name: String,
    messages: BTreeMap<Timestamp, Message>,
}

impl ExportResult {
    pub fn new(conversation: Conversation, display_name: impl Into<String>) -> Self {
        Self {
            conversation,
            display_name: display_name.into(),
            messages: BTreeMap::new(),
        }
    }

    /// Merges a batch and returns the thread parents that still need
    /// resolving. A parent whose latest reply moved is taken as fresh.
    pub fn merge(&mut self, batch: Vec<Message>) -> Vec<Message> {
        let mut unresolved = Vec::new();
        for mut message in batch {
            if message.channel.is_none() {
                message.channel = Some(self.conversation.id.clone());
            }
            let keep_existing = self
                .messages
                .get(&message.ts)
                .is_some_and(|existing| existing.latest_reply == message.latest_reply);
            if keep_existing {
                continue;
            }
            if message.is_thread_parent() && !message.thread_settled() {
                unresolved.push(message.clone());
            }
            self.messages.insert(message.ts.clone(), message);
        }
        unresolved
    }

    /// Inlines a resolved thread. Returns false when the parent is unknown.
    pub fn attach_replies(&mut self, parent_ts: &Timestamp, replies: Vec<Message>) -> bool {
        match self.messages.get_mut(parent_ts) {
            Some(parent) => {
                parent.replies = Some(replies);
                parent.thread_unavailable = None;
                true
            }
            None => false,
        }
    }

    pub fn mark_thread_unavailable(&mut self, parent_ts: &Timestamp, reason: impl Into<String>) {
        if let Some(parent) = self.messages.get_mut(parent_ts) {
            parent.replies = None;
            parent.thread_unavailable = Some(reason.into());
        }
    }

    pub fn get(&self, ts: &Timestamp) -> Option<&Message> {
        self.messages.get(ts)
    }

    /// Messages in ascending timestamp order.
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.values()
    }

    /// Parents whose thread is neither inlined nor known to be unavailable.
    pub fn unsettled_threads(&self) -> Vec<Timestamp> {
        self.messages
            .values()
            .filter(|m| !m.thread_settled())
            .map(|m| m.ts.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn reply_count(&self) -> usize {
        self.messages
            .values()
            .map(|m| m.replies.as_ref().map_or(0, Vec::len))
            .sum()
    }

    /// Top-level messages plus inlined replies.
    pub fn total_records(&self) -> usize {
        self.len() + self.reply_count()
    }
}
