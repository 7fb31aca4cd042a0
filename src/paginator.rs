use std::sync::Arc;

use tracing::debug;

use crate::api::{ConversationApi, EndpointFamily, HistoryWindow, Page};
use crate::error::FetchError;
use crate::gate::RequestGate;
use crate::model::Message;

/// A page request that gave up, with the cursor it was issued at.
#[derive(Debug, Clone, PartialEq)]
pub struct PageFailure {
    pub error: FetchError,
    /// Cursor of the failed request; `None` means the first page.
    pub cursor: Option<String>,
}

/// Lazily walks one conversation's history, one page per call.
///
/// Pages come back in API order. The cursor only advances after a page was
/// delivered, so a transient failure can be retried by calling
/// [`HistoryPaginator::next_page`] again or resumed later from
/// [`HistoryPaginator::cursor`].
pub struct HistoryPaginator {
    api: Arc<dyn ConversationApi>,
    gate: Arc<RequestGate>,
    conversation_id: String,
    window: HistoryWindow,
    page_size: u16,
    cursor: Option<String>,
    finished: bool,
    pages: usize,
}

impl HistoryPaginator {
    pub fn new(
        api: Arc<dyn ConversationApi>,
        gate: Arc<RequestGate>,
        conversation_id: impl Into<String>,
        window: HistoryWindow,
        page_size: u16,
    ) -> Self {
        Self {
            api,
            gate,
            conversation_id: conversation_id.into(),
            window,
            page_size,
            cursor: None,
            finished: false,
            pages: 0,
        }
    }

    /// Continues from a cursor recorded by an earlier run.
    pub fn starting_at(mut self, cursor: Option<String>) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Pages delivered so far by this paginator.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Next batch of messages; `None` once the terminal page was delivered
    /// or an unrecoverable error stopped the walk.
    pub async fn next_page(&mut self) -> Option<Result<Vec<Message>, PageFailure>> {
        if self.finished {
            return None;
        }

        let api = self.api.as_ref();
        let conversation_id = self.conversation_id.as_str();
        let window = &self.window;
        let cursor = self.cursor.as_deref();
        let limit = self.page_size;

        let fetched: Result<Page<Message>, FetchError> = self
            .gate
            .execute(EndpointFamily::History, move || {
                api.history(conversation_id, window, cursor, limit)
            })
            .await;

        match fetched {
            Ok(page) => {
                self.pages += 1;
                debug!(
                    conversation = %self.conversation_id,
                    page = self.pages,
                    messages = page.items.len(),
                    last = page.is_last(),
                    "history page"
                );
                if page.next_cursor.is_none() {
                    self.finished = true;
                }
                self.cursor = page.next_cursor;
                Some(Ok(page.items))
            }
            Err(error) => {
                if error.is_unrecoverable() {
                    self.finished = true;
                }
                Some(Err(PageFailure {
                    error,
                    cursor: self.cursor.clone(),
                }))
            }
        }
    }
}
