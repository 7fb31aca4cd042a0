//! `ConversationApi` on top of slack-morphism.
//!
//! The client's own rate control is left off; 429s come back as
//! [`ApiFailure::RateLimited`] and the request gate decides what to do.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use slack_morphism::errors::SlackClientError;
use slack_morphism::prelude::*;
use tracing::trace;

use crate::api::{ApiFailure, ConversationApi, HistoryWindow, Page};
use crate::error::UnrecoverableKind;
use crate::model::{Conversation, Message, Timestamp, User};
use crate::{AppError, Result};

pub struct SlackApi {
    client: SlackHyperClient,
    token: SlackApiToken,
}

impl SlackApi {
    pub fn new(token: &str) -> Result<Self> {
        let connector =
            SlackClientHyperConnector::new().map_err(|e| AppError::SlackApi(e.to_string()))?;
        Ok(Self {
            client: SlackClient::new(connector),
            token: SlackApiToken::new(SlackApiTokenValue(token.to_string())),
        })
    }
}

fn cursor_id(cursor: Option<&str>) -> Option<SlackCursorId> {
    cursor.map(|c| SlackCursorId(c.to_string()))
}

fn next_cursor(metadata: Option<SlackResponseMetadata>) -> Option<String> {
    metadata.and_then(|m| m.next_cursor).map(|c| c.0)
}

fn slack_ts(ts: &Timestamp) -> SlackTs {
    SlackTs(ts.to_string())
}

fn malformed(what: &str, detail: impl std::fmt::Display) -> ApiFailure {
    ApiFailure::Unrecoverable {
        kind: UnrecoverableKind::Other,
        message: format!("malformed {what}: {detail}"),
    }
}

fn to_value<T: Serialize>(item: &T, what: &str) -> std::result::Result<Value, ApiFailure> {
    serde_json::to_value(item).map_err(|e| malformed(what, e))
}

/// Reads one history or replies entry. The legacy `replies` stub list some
/// workspaces still return is dropped; threads are always resolved.
pub(crate) fn message_from_value(mut value: Value) -> std::result::Result<Message, ApiFailure> {
    if let Some(object) = value.as_object_mut() {
        object.remove("replies");
    }
    serde_json::from_value(value).map_err(|e| malformed("message", e))
}

fn messages<T: Serialize>(items: &[T]) -> std::result::Result<Vec<Message>, ApiFailure> {
    items
        .iter()
        .map(|m| to_value(m, "message").and_then(message_from_value))
        .collect()
}

/// Classifies an HTTP status that slack-morphism could not map itself.
pub(crate) fn classify_status(status: u16, detail: String) -> ApiFailure {
    match status {
        429 => ApiFailure::RateLimited { retry_after: None },
        401 | 403 => ApiFailure::authorization(detail),
        404 => ApiFailure::not_found(detail),
        408 | 500..=599 => ApiFailure::Transport(detail),
        _ => ApiFailure::Unrecoverable {
            kind: UnrecoverableKind::Other,
            message: detail,
        },
    }
}

fn classify(error: SlackClientError) -> ApiFailure {
    match error {
        SlackClientError::RateLimitError(e) => ApiFailure::RateLimited {
            retry_after: e.retry_after.or(Some(Duration::from_secs(1))),
        },
        SlackClientError::ApiError(e) => ApiFailure::from_slack_code(&e.code),
        SlackClientError::HttpError(e) => classify_status(e.status_code.as_u16(), e.to_string()),
        SlackClientError::HttpProtocolError(e) => ApiFailure::Transport(e.to_string()),
        SlackClientError::SystemError(e) => ApiFailure::Transport(e.to_string()),
        other => ApiFailure::Unrecoverable {
            kind: UnrecoverableKind::Other,
            message: other.to_string(),
        },
    }
}

#[async_trait]
impl ConversationApi for SlackApi {
    async fn workspace_id(&self) -> std::result::Result<String, ApiFailure> {
        let session = self.client.open_session(&self.token);
        let response = session.auth_test().await.map_err(classify)?;
        Ok(response.team_id.0)
    }

    async fn list_conversations(
        &self,
        cursor: Option<&str>,
        limit: u16,
        include_archived: bool,
    ) -> std::result::Result<Page<Conversation>, ApiFailure> {
        let session = self.client.open_session(&self.token);
        let request = SlackApiConversationsListRequest::new()
            .with_limit(limit)
            .with_exclude_archived(!include_archived)
            .with_types(vec![
                SlackConversationType::Public,
                SlackConversationType::Private,
                SlackConversationType::Mpim,
                SlackConversationType::Im,
            ])
            .opt_cursor(cursor_id(cursor));
        let response = session.conversations_list(&request).await.map_err(classify)?;

        let mut items = Vec::with_capacity(response.channels.len());
        for channel in &response.channels {
            let value = to_value(channel, "conversation")?;
            let conversation =
                Conversation::from_value(&value).ok_or_else(|| malformed("conversation", "no id"))?;
            items.push(conversation);
        }
        trace!(items = items.len(), "conversations.list page");
        Ok(Page::new(items, next_cursor(response.response_metadata)))
    }

    async fn list_users(
        &self,
        cursor: Option<&str>,
        limit: u16,
    ) -> std::result::Result<Page<User>, ApiFailure> {
        let session = self.client.open_session(&self.token);
        let request = SlackApiUsersListRequest::new()
            .with_limit(limit)
            .opt_cursor(cursor_id(cursor));
        let response = session.users_list(&request).await.map_err(classify)?;

        let mut items = Vec::with_capacity(response.members.len());
        for member in &response.members {
            let value = to_value(member, "user")?;
            items.push(User::from_value(&value).ok_or_else(|| malformed("user", "no id"))?);
        }
        trace!(items = items.len(), "users.list page");
        Ok(Page::new(items, next_cursor(response.response_metadata)))
    }

    async fn history(
        &self,
        conversation_id: &str,
        window: &HistoryWindow,
        cursor: Option<&str>,
        limit: u16,
    ) -> std::result::Result<Page<Message>, ApiFailure> {
        let session = self.client.open_session(&self.token);
        let request = SlackApiConversationsHistoryRequest::new()
            .with_channel(SlackChannelId(conversation_id.to_string()))
            .with_limit(limit)
            .opt_oldest(window.oldest.as_ref().map(slack_ts))
            .opt_latest(window.latest.as_ref().map(slack_ts))
            .opt_cursor(cursor_id(cursor));
        let response = session
            .conversations_history(&request)
            .await
            .map_err(classify)?;

        // the API pages newest first; pages are handed on as ascending batches
        let mut items = messages(&response.messages)?;
        items.sort_by(|a, b| a.ts.cmp(&b.ts));
        Ok(Page::new(items, next_cursor(response.response_metadata)))
    }

    async fn replies(
        &self,
        conversation_id: &str,
        parent_ts: &Timestamp,
        cursor: Option<&str>,
        limit: u16,
    ) -> std::result::Result<Page<Message>, ApiFailure> {
        let session = self.client.open_session(&self.token);
        let request = SlackApiConversationsRepliesRequest::new(
            SlackChannelId(conversation_id.to_string()),
            slack_ts(parent_ts),
        )
        .with_limit(limit)
        .opt_cursor(cursor_id(cursor));
        let response = session
            .conversations_replies(&request)
            .await
            .map_err(classify)?;

        let items = messages(&response.messages)?;
        Ok(Page::new(items, next_cursor(response.response_metadata)))
    }
}
