//! Scripted in-memory `ConversationApi` for engine tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::api::{ApiFailure, ConversationApi, EndpointFamily, HistoryWindow, Page};
use crate::model::{Conversation, ConversationKind, Message, Timestamp, User};

pub const WORKSPACE: &str = "T0001";

/// Items per directory listing page.
const LISTING_PAGE_SIZE: usize = 200;

#[derive(Debug, Clone, Copy)]
pub enum Fault {
    Transport,
    RateLimited(Duration),
    Authorization,
    NotFound,
    InvalidCursor,
}

impl Fault {
    fn failure(self) -> ApiFailure {
        match self {
            Fault::Transport => ApiFailure::Transport("connection reset by peer".to_string()),
            Fault::RateLimited(delay) => ApiFailure::RateLimited {
                retry_after: Some(delay),
            },
            Fault::Authorization => ApiFailure::authorization("not_in_channel"),
            Fault::NotFound => ApiFailure::not_found("thread_not_found"),
            Fault::InvalidCursor => ApiFailure::from_slack_code("invalid_cursor"),
        }
    }
}

type FaultKey = (EndpointFamily, String, usize);

#[derive(Default)]
pub struct FakeApi {
    channels: Vec<Conversation>,
    users: Vec<User>,
    histories: HashMap<String, Vec<Vec<Message>>>,
    replies: HashMap<(String, Timestamp), Vec<Vec<Message>>>,
    denied: Vec<String>,
    faults: Mutex<HashMap<FaultKey, (Fault, u32)>>,
    calls: Mutex<HashMap<EndpointFamily, usize>>,
    latency: Option<Duration>,
    /// Current and peak number of requests being served, per family.
    in_flight: Mutex<HashMap<EndpointFamily, (usize, usize)>>,
}

/// Counts one request as in flight until dropped.
struct Serving<'a> {
    api: &'a FakeApi,
    family: EndpointFamily,
}

impl Drop for Serving<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.api.in_flight.lock().unwrap();
        if let Some((current, _)) = in_flight.get_mut(&self.family) {
            *current -= 1;
        }
    }
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cursor_for(page: usize) -> String {
        format!("page:{page}")
    }

    fn page_index(cursor: Option<&str>) -> usize {
        cursor
            .and_then(|c| c.strip_prefix("page:"))
            .and_then(|n| n.parse().ok())
            .unwrap_or(0)
    }

    pub fn with_channels(mut self, channels: Vec<Conversation>) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_users(mut self, users: Vec<User>) -> Self {
        self.users = users;
        self
    }

    pub fn with_history(mut self, conversation_id: &str, pages: Vec<Vec<Message>>) -> Self {
        self.histories.insert(conversation_id.to_string(), pages);
        self
    }

    pub fn with_replies(
        mut self,
        conversation_id: &str,
        parent: &Timestamp,
        pages: Vec<Vec<Message>>,
    ) -> Self {
        self.replies
            .insert((conversation_id.to_string(), parent.clone()), pages);
        self
    }

    /// Fails the request for page `page` of `key` `times` times before
    /// letting it through. `key` is the conversation id for history, the
    /// parent timestamp for replies, and empty for listings.
    pub fn with_fault(
        self,
        family: EndpointFamily,
        key: &str,
        page: usize,
        fault: Fault,
        times: u32,
    ) -> Self {
        self.faults
            .lock()
            .unwrap()
            .insert((family, key.to_string(), page), (fault, times));
        self
    }

    /// History and replies requests take `latency` to answer.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Most requests of `family` ever served at the same time.
    pub fn peak_in_flight(&self, family: EndpointFamily) -> usize {
        self.in_flight
            .lock()
            .unwrap()
            .get(&family)
            .map_or(0, |(_, peak)| *peak)
    }

    async fn serve(&self, family: EndpointFamily) {
        let Some(latency) = self.latency else {
            return;
        };
        let _serving = {
            let mut in_flight = self.in_flight.lock().unwrap();
            let (current, peak) = in_flight.entry(family).or_default();
            *current += 1;
            *peak = (*peak).max(*current);
            Serving { api: self, family }
        };
        tokio::time::sleep(latency).await;
    }

    pub fn deny(mut self, conversation_id: &str) -> Self {
        self.denied.push(conversation_id.to_string());
        self
    }

    pub fn calls(&self, family: EndpointFamily) -> usize {
        self.calls.lock().unwrap().get(&family).copied().unwrap_or(0)
    }

    fn record(&self, family: EndpointFamily, key: &str, page: usize) -> Result<(), ApiFailure> {
        *self.calls.lock().unwrap().entry(family).or_default() += 1;
        let mut faults = self.faults.lock().unwrap();
        if let Some((fault, remaining)) = faults.get_mut(&(family, key.to_string(), page))
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(fault.failure());
        }
        Ok(())
    }

    fn paged<T: Clone>(pages: Option<&Vec<Vec<T>>>, index: usize) -> Page<T> {
        let pages = pages.map(Vec::as_slice).unwrap_or_default();
        let items = pages.get(index).cloned().unwrap_or_default();
        let next = (index + 1 < pages.len()).then(|| Self::cursor_for(index + 1));
        Page::new(items, next)
    }

    fn chunked<T: Clone>(items: &[T], size: usize, index: usize) -> Page<T> {
        let chunks: Vec<Vec<T>> = items.chunks(size).map(<[T]>::to_vec).collect();
        Self::paged(Some(&chunks), index)
    }
}

#[async_trait]
impl ConversationApi for FakeApi {
    async fn workspace_id(&self) -> Result<String, ApiFailure> {
        self.record(EndpointFamily::Identity, "", 0)?;
        Ok(WORKSPACE.to_string())
    }

    async fn list_conversations(
        &self,
        cursor: Option<&str>,
        _limit: u16,
        include_archived: bool,
    ) -> Result<Page<Conversation>, ApiFailure> {
        let index = Self::page_index(cursor);
        self.record(EndpointFamily::ConversationsList, "", index)?;
        let visible: Vec<Conversation> = self
            .channels
            .iter()
            .filter(|c| include_archived || !c.is_archived)
            .cloned()
            .collect();
        Ok(Self::chunked(&visible, LISTING_PAGE_SIZE, index))
    }

    async fn list_users(
        &self,
        cursor: Option<&str>,
        _limit: u16,
    ) -> Result<Page<User>, ApiFailure> {
        let index = Self::page_index(cursor);
        self.record(EndpointFamily::UsersList, "", index)?;
        Ok(Self::chunked(&self.users, LISTING_PAGE_SIZE, index))
    }

    async fn history(
        &self,
        conversation_id: &str,
        _window: &HistoryWindow,
        cursor: Option<&str>,
        _limit: u16,
    ) -> Result<Page<Message>, ApiFailure> {
        let index = Self::page_index(cursor);
        self.record(EndpointFamily::History, conversation_id, index)?;
        self.serve(EndpointFamily::History).await;
        if self.denied.iter().any(|d| d == conversation_id) {
            return Err(ApiFailure::authorization("not_in_channel"));
        }
        Ok(Self::paged(self.histories.get(conversation_id), index))
    }

    async fn replies(
        &self,
        conversation_id: &str,
        parent_ts: &Timestamp,
        cursor: Option<&str>,
        _limit: u16,
    ) -> Result<Page<Message>, ApiFailure> {
        let index = Self::page_index(cursor);
        self.record(EndpointFamily::Replies, &parent_ts.to_string(), index)?;
        self.serve(EndpointFamily::Replies).await;
        if self.denied.iter().any(|d| d == conversation_id) {
            return Err(ApiFailure::authorization("not_in_channel"));
        }
        let key = (conversation_id.to_string(), parent_ts.clone());
        Ok(Self::paged(self.replies.get(&key), index))
    }
}

pub fn ts(n: usize) -> Timestamp {
    Timestamp::new(1_700_000_000 + n as u64, 0)
}

pub fn message(n: usize) -> Message {
    Message::new(ts(n), Some("U1".to_string()), format!("message {n}"))
}

/// `count` consecutive messages starting at `start`, ascending.
pub fn messages(start: usize, count: usize) -> Vec<Message> {
    (start..start + count).map(message).collect()
}

pub fn parent(n: usize, reply_count: u32) -> Message {
    let mut m = message(n);
    m.thread_ts = Some(ts(n));
    m.reply_count = Some(reply_count);
    m.latest_reply = Some(Timestamp::new(ts(n).secs(), reply_count));
    m
}

/// Reply `k` (1-based) in the thread under message `n`.
pub fn reply(n: usize, k: u32) -> Message {
    let mut m = Message::new(
        Timestamp::new(ts(n).secs(), k),
        Some("U2".to_string()),
        format!("reply {k} to {n}"),
    );
    m.thread_ts = Some(ts(n));
    m
}

pub fn channel(id: &str, name: &str) -> Conversation {
    Conversation {
        id: id.to_string(),
        kind: ConversationKind::PublicChannel,
        name: Some(name.to_string()),
        is_member: true,
        is_archived: false,
        user: None,
        creator: None,
    }
}

pub fn direct_message(id: &str, peer: &str) -> Conversation {
    Conversation {
        id: id.to_string(),
        kind: ConversationKind::DirectMessage,
        name: None,
        is_member: true,
        is_archived: false,
        user: Some(peer.to_string()),
        creator: None,
    }
}

pub fn user(id: &str, name: &str) -> User {
    User {
        id: id.to_string(),
        name: name.to_string(),
        ..User::default()
    }
}
