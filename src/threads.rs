use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::api::{ConversationApi, EndpointFamily, Page};
use crate::error::FetchError;
use crate::gate::RequestGate;
use crate::model::{Message, Timestamp};

/// A resolved thread: the parent first, then replies by timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Thread {
    pub parent_ts: Timestamp,
    pub messages: Vec<Message>,
    /// Reply count the API reported for the parent during resolution.
    pub reported_replies: Option<u32>,
}

impl Thread {
    fn empty(parent_ts: Timestamp) -> Self {
        Self {
            parent_ts,
            messages: Vec::new(),
            reported_replies: None,
        }
    }

    /// Replies without the parent, never more than the reported count.
    pub fn into_replies(self) -> Vec<Message> {
        let parent_ts = self.parent_ts;
        let mut replies: Vec<Message> = self
            .messages
            .into_iter()
            .filter(|m| m.ts != parent_ts)
            .collect();
        if let Some(limit) = self.reported_replies {
            replies.truncate(limit as usize);
        }
        replies
    }
}

/// Resolves thread replies for one conversation.
///
/// Cheap to share between tasks; every request goes through the shared
/// gate, which owns the real rate ceiling.
pub struct ThreadResolver {
    api: Arc<dyn ConversationApi>,
    gate: Arc<RequestGate>,
    conversation_id: String,
    page_size: u16,
}

impl ThreadResolver {
    pub fn new(
        api: Arc<dyn ConversationApi>,
        gate: Arc<RequestGate>,
        conversation_id: impl Into<String>,
        page_size: u16,
    ) -> Self {
        Self {
            api,
            gate,
            conversation_id: conversation_id.into(),
            page_size,
        }
    }

    /// Fetches every reply page of `parent`. Non-parents resolve to an
    /// empty thread without touching the API. Replies deleted since the
    /// parent was listed simply do not show up.
    pub async fn resolve(&self, parent: &Message) -> Result<Thread, FetchError> {
        if !parent.is_thread_parent() {
            return Ok(Thread::empty(parent.ts.clone()));
        }

        let mut collected: BTreeMap<Timestamp, Message> = BTreeMap::new();
        let mut reported_replies = None;
        let mut cursor: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let api = self.api.as_ref();
            let conversation_id = self.conversation_id.as_str();
            let parent_ts = &parent.ts;
            let current = cursor.as_deref();
            let limit = self.page_size;

            let page: Page<Message> = self
                .gate
                .execute(EndpointFamily::Replies, move || {
                    api.replies(conversation_id, parent_ts, current, limit)
                })
                .await?;
            pages += 1;

            for message in page.items {
                if message.ts == parent.ts {
                    reported_replies = message.reply_count.or(Some(0));
                }
                collected.entry(message.ts.clone()).or_insert(message);
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        debug!(
            conversation = %self.conversation_id,
            parent = %parent.ts,
            pages,
            messages = collected.len(),
            "thread resolved"
        );

        // parent sorts first: replies always carry later timestamps
        collected
            .entry(parent.ts.clone())
            .or_insert_with(|| parent.clone());
        Ok(Thread {
            parent_ts: parent.ts.clone(),
            messages: collected.into_values().collect(),
            reported_replies,
        })
    }
}
