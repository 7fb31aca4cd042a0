//! Export coordinator.
//!
//! Runs several conversations at once, each walking its history strictly
//! in cursor order while thread replies are fetched alongside by a bounded
//! set of tasks. Failures stay inside the conversation that hit them and
//! end up in the [`ExportReport`].

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::api::{ConversationApi, HistoryWindow};
use crate::directory::DirectorySnapshot;
use crate::error::{FetchError, UnrecoverableKind};
use crate::gate::{RateSnapshot, RequestGate};
use crate::model::{Conversation, ExportResult, Message, Timestamp};
use crate::paginator::HistoryPaginator;
use crate::resume::{Checkpoint, CheckpointStore, ResumePoint};
use crate::threads::{Thread, ThreadResolver};

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub window: HistoryWindow,
    pub page_size: u16,
    pub conversation_concurrency: usize,
    pub thread_concurrency: usize,
    /// Ignore stored checkpoints and start every conversation over.
    pub restart: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            window: HistoryWindow::default(),
            page_size: 200,
            conversation_concurrency: 4,
            thread_concurrency: 4,
            restart: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConversationOutcome {
    Complete(ExportResult),
    /// Some data is missing; `resume` says where a later run picks up.
    Partial {
        result: ExportResult,
        resume: ResumePoint,
        reason: String,
    },
    Excluded {
        conversation_id: String,
        kind: UnrecoverableKind,
        reason: String,
    },
}

impl ConversationOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            ConversationOutcome::Complete(_) => "complete",
            ConversationOutcome::Partial { .. } => "partial",
            ConversationOutcome::Excluded { .. } => "excluded",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportReport {
    pub outcomes: BTreeMap<String, ConversationOutcome>,
    pub rate_limits: Vec<RateSnapshot>,
}

impl ExportReport {
    pub fn count(&self, status: &str) -> usize {
        self.outcomes
            .values()
            .filter(|o| o.status() == status)
            .count()
    }
}

/// Live counters, readable while a run is in progress.
#[derive(Debug, Default)]
pub struct Progress {
    conversations_done: AtomicUsize,
    pages: AtomicUsize,
    messages: AtomicUsize,
    threads: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub conversations_done: usize,
    pub pages: usize,
    pub messages: usize,
    pub threads: usize,
}

impl Progress {
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            conversations_done: self.conversations_done.load(Ordering::Relaxed),
            pages: self.pages.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            threads: self.threads.load(Ordering::Relaxed),
        }
    }
}

type ThreadOutcome = (Timestamp, Result<Vec<Message>, FetchError>);

enum Walk {
    Finished(ConversationOutcome),
    /// The API refused the cursor a checkpoint resumed from.
    CursorRejected { message: String },
}

#[derive(Clone)]
pub struct ExportCoordinator {
    api: Arc<dyn ConversationApi>,
    gate: Arc<RequestGate>,
    directory: Arc<DirectorySnapshot>,
    checkpoints: Option<Arc<CheckpointStore>>,
    options: Arc<ExportOptions>,
    progress: Arc<Progress>,
}

impl ExportCoordinator {
    pub fn new(
        api: Arc<dyn ConversationApi>,
        gate: Arc<RequestGate>,
        directory: Arc<DirectorySnapshot>,
        options: ExportOptions,
    ) -> Self {
        Self {
            api,
            gate,
            directory,
            checkpoints: None,
            options: Arc::new(options),
            progress: Arc::new(Progress::default()),
        }
    }

    pub fn with_checkpoints(mut self, store: CheckpointStore) -> Self {
        self.checkpoints = Some(Arc::new(store));
        self
    }

    pub fn progress(&self) -> Arc<Progress> {
        self.progress.clone()
    }

    /// Exports every requested conversation and reports one outcome each.
    /// Only cancellation stops the run early, and even then every id gets
    /// an outcome.
    pub async fn export_all(&self, conversation_ids: &[String]) -> ExportReport {
        let limit = self.options.conversation_concurrency.max(1);
        let mut outcomes = BTreeMap::new();
        let mut tasks: JoinSet<(String, ConversationOutcome)> = JoinSet::new();

        info!(
            conversations = conversation_ids.len(),
            concurrency = limit,
            "starting export"
        );

        let mut seen = HashSet::new();
        for id in conversation_ids {
            if !seen.insert(id.as_str()) {
                continue;
            }
            while tasks.len() >= limit {
                self.collect_one(&mut tasks, &mut outcomes).await;
            }
            let this = self.clone();
            let id = id.clone();
            tasks.spawn(async move {
                let outcome = this.export_one(&id).await;
                (id, outcome)
            });
        }
        while !tasks.is_empty() {
            self.collect_one(&mut tasks, &mut outcomes).await;
        }

        // a panicked task leaves no outcome behind; report it as restartable
        for id in conversation_ids {
            if !outcomes.contains_key(id) {
                let outcome = self.not_started(id, "export task aborted");
                outcomes.insert(id.clone(), outcome);
            }
        }

        ExportReport {
            outcomes,
            rate_limits: self.gate.rate_state().snapshot(),
        }
    }

    async fn collect_one(
        &self,
        tasks: &mut JoinSet<(String, ConversationOutcome)>,
        outcomes: &mut BTreeMap<String, ConversationOutcome>,
    ) {
        match tasks.join_next().await {
            Some(Ok((id, outcome))) => {
                self.progress
                    .conversations_done
                    .fetch_add(1, Ordering::Relaxed);
                outcomes.insert(id, outcome);
            }
            Some(Err(e)) => error!(error = %e, "conversation export task failed"),
            None => {}
        }
    }

    fn not_started(&self, conversation_id: &str, reason: &str) -> ConversationOutcome {
        match self.directory.find(conversation_id) {
            Some(conversation) => ConversationOutcome::Partial {
                result: ExportResult::new(
                    conversation.clone(),
                    self.directory.display_name(conversation),
                ),
                resume: ResumePoint::default(),
                reason: reason.to_string(),
            },
            None => unknown_conversation(conversation_id),
        }
    }

    /// Exports a single conversation, continuing from its checkpoint when
    /// one exists.
    pub async fn export_one(&self, conversation_id: &str) -> ConversationOutcome {
        let Some(conversation) = self.directory.find(conversation_id) else {
            warn!(conversation = conversation_id, "not in the workspace directory");
            return unknown_conversation(conversation_id);
        };

        let checkpoint = self.load_checkpoint(conversation_id);
        match self.walk(conversation, checkpoint).await {
            Walk::Finished(outcome) => outcome,
            Walk::CursorRejected { message } => {
                warn!(
                    conversation = conversation_id,
                    %message,
                    "stored cursor rejected, exporting from the start"
                );
                self.clear_checkpoint(conversation_id);
                match self.walk(conversation, None).await {
                    Walk::Finished(outcome) => outcome,
                    // a walk without a checkpoint has no stored cursor
                    Walk::CursorRejected { message } => ConversationOutcome::Excluded {
                        conversation_id: conversation_id.to_string(),
                        kind: UnrecoverableKind::Other,
                        reason: format!("Unrecoverable: {message}"),
                    },
                }
            }
        }
    }

    /// One pass over a conversation's history and threads, optionally
    /// seeded from a checkpoint.
    async fn walk(&self, conversation: &Conversation, checkpoint: Option<Checkpoint>) -> Walk {
        let conversation_id = conversation.id.as_str();
        let display_name = self.directory.display_name(conversation);
        let mut result = ExportResult::new(conversation.clone(), display_name);
        let mut waiting: VecDeque<Message> = VecDeque::new();
        let mut start_cursor = None;
        let mut history_done = false;

        if let Some(checkpoint) = checkpoint {
            info!(
                conversation = conversation_id,
                messages = checkpoint.messages.len(),
                "resuming from checkpoint"
            );
            waiting.extend(result.merge(checkpoint.messages));
            start_cursor = checkpoint.resume.history_cursor;
            history_done = checkpoint.resume.history_done;
        }

        let resolver = Arc::new(ThreadResolver::new(
            self.api.clone(),
            self.gate.clone(),
            conversation_id,
            self.options.page_size,
        ));
        let thread_limit = self.options.thread_concurrency.max(1);
        let mut threads: JoinSet<ThreadOutcome> = JoinSet::new();
        let mut history_failure: Option<(FetchError, Option<String>)> = None;

        if !history_done {
            let mut pager = HistoryPaginator::new(
                self.api.clone(),
                self.gate.clone(),
                conversation_id,
                self.options.window.clone(),
                self.options.page_size,
            )
            .starting_at(start_cursor.clone());

            while let Some(page) = pager.next_page().await {
                match page {
                    Ok(batch) => {
                        self.progress.pages.fetch_add(1, Ordering::Relaxed);
                        self.progress
                            .messages
                            .fetch_add(batch.len(), Ordering::Relaxed);
                        waiting.extend(result.merge(batch));
                    }
                    Err(failure) => {
                        history_failure = Some((failure.error, failure.cursor));
                        break;
                    }
                }
                while let Some(joined) = threads.try_join_next() {
                    self.progress.threads.fetch_add(1, Ordering::Relaxed);
                    apply_thread(&mut result, joined);
                }
                spawn_threads(&mut threads, &mut waiting, &resolver, thread_limit);
            }
            history_done = pager.is_finished() && history_failure.is_none();
            debug!(
                conversation = conversation_id,
                pages = pager.pages(),
                done = history_done,
                "history walk ended"
            );
        }

        if let Some((error, cursor)) = &history_failure
            && let FetchError::Unrecoverable { kind, message, .. } = error
        {
            threads.abort_all();
            if *kind == UnrecoverableKind::Other && cursor.is_some() && *cursor == start_cursor {
                return Walk::CursorRejected {
                    message: message.clone(),
                };
            }
            warn!(
                conversation = conversation_id,
                family = %error.family(),
                %error,
                "excluding conversation"
            );
            return Walk::Finished(ConversationOutcome::Excluded {
                conversation_id: conversation_id.to_string(),
                kind: *kind,
                reason: format!("{}: {message}", error.label()),
            });
        }

        // threads found on the last pages, plus whatever is still running
        loop {
            spawn_threads(&mut threads, &mut waiting, &resolver, thread_limit);
            match threads.join_next().await {
                Some(joined) => {
                    self.progress.threads.fetch_add(1, Ordering::Relaxed);
                    apply_thread(&mut result, joined);
                }
                None => break,
            }
        }

        let pending_threads = result.unsettled_threads();
        let reason = match &history_failure {
            Some((error, _)) => Some(error.to_string()),
            None if !pending_threads.is_empty() => Some(format!(
                "{} thread(s) could not be fetched",
                pending_threads.len()
            )),
            None => None,
        };

        match reason {
            None => {
                info!(
                    conversation = conversation_id,
                    messages = result.len(),
                    replies = result.reply_count(),
                    "conversation complete"
                );
                self.clear_checkpoint(conversation_id);
                Walk::Finished(ConversationOutcome::Complete(result))
            }
            Some(reason) => {
                let resume = ResumePoint {
                    history_cursor: history_failure.and_then(|(_, cursor)| cursor),
                    history_done,
                    pending_threads,
                };
                warn!(
                    conversation = conversation_id,
                    messages = result.len(),
                    %reason,
                    "conversation partial"
                );
                self.save_checkpoint(&result, &resume, &reason);
                Walk::Finished(ConversationOutcome::Partial {
                    result,
                    resume,
                    reason,
                })
            }
        }
    }

    fn load_checkpoint(&self, conversation_id: &str) -> Option<Checkpoint> {
        if self.options.restart {
            return None;
        }
        let store = self.checkpoints.as_ref()?;
        match store.load(conversation_id) {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!(conversation = conversation_id, error = %e, "ignoring unreadable checkpoint");
                None
            }
        }
    }

    fn save_checkpoint(&self, result: &ExportResult, resume: &ResumePoint, reason: &str) {
        let Some(store) = &self.checkpoints else {
            return;
        };
        if result.is_empty() && resume.is_start() {
            return;
        }
        let checkpoint = Checkpoint::new(result, resume.clone(), reason);
        if let Err(e) = store.save(&checkpoint) {
            error!(conversation = %result.conversation.id, error = %e, "failed to save checkpoint");
        }
    }

    fn clear_checkpoint(&self, conversation_id: &str) {
        if let Some(store) = &self.checkpoints
            && let Err(e) = store.remove(conversation_id)
        {
            warn!(conversation = conversation_id, error = %e, "failed to remove checkpoint");
        }
    }
}

fn unknown_conversation(conversation_id: &str) -> ConversationOutcome {
    ConversationOutcome::Excluded {
        conversation_id: conversation_id.to_string(),
        kind: UnrecoverableKind::NotFound,
        reason: "Unrecoverable: conversation not in workspace directory".to_string(),
    }
}

fn spawn_threads(
    threads: &mut JoinSet<ThreadOutcome>,
    waiting: &mut VecDeque<Message>,
    resolver: &Arc<ThreadResolver>,
    limit: usize,
) {
    while threads.len() < limit {
        let Some(parent) = waiting.pop_front() else {
            return;
        };
        let resolver = resolver.clone();
        threads.spawn(async move {
            let replies = resolver.resolve(&parent).await.map(Thread::into_replies);
            (parent.ts, replies)
        });
    }
}

fn apply_thread(
    result: &mut ExportResult,
    joined: Result<ThreadOutcome, tokio::task::JoinError>,
) {
    match joined {
        Ok((parent_ts, Ok(replies))) => {
            debug!(parent = %parent_ts, replies = replies.len(), "thread attached");
            result.attach_replies(&parent_ts, replies);
        }
        Ok((parent_ts, Err(FetchError::Unrecoverable { message, .. }))) => {
            warn!(parent = %parent_ts, %message, "thread unavailable");
            result.mark_thread_unavailable(&parent_ts, message);
        }
        // stays unsettled and shows up in the resume point
        Ok((parent_ts, Err(e))) => warn!(parent = %parent_ts, error = %e, "thread pending"),
        Err(e) => error!(error = %e, "thread task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::EndpointFamily;
    use crate::gate::RetryPolicy;
    use crate::testing::{
        FakeApi, Fault, channel, direct_message, message, messages, parent, reply, ts, user,
    };
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn directory() -> Arc<DirectorySnapshot> {
        Arc::new(DirectorySnapshot::new(
            "T0001",
            vec![
                channel("C", "general"),
                channel("D", "random"),
                channel("E", "secret"),
                channel("Z", "empty"),
                direct_message("DM1", "U1"),
            ],
            vec![user("U1", "jane")],
        ))
    }

    fn coordinator(api: FakeApi, policy: RetryPolicy) -> (Arc<FakeApi>, ExportCoordinator) {
        coordinator_with(api, policy, CancellationToken::new())
    }

    fn coordinator_with(
        api: FakeApi,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> (Arc<FakeApi>, ExportCoordinator) {
        let api = Arc::new(api);
        let gate = Arc::new(RequestGate::new(policy, cancel));
        let coordinator =
            ExportCoordinator::new(api.clone(), gate, directory(), ExportOptions::default());
        (api, coordinator)
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    /// 100 + 100 + 42 messages, message 150 opens a 5-reply thread split
    /// over two reply pages.
    fn threaded_history(api: FakeApi, id: &str) -> FakeApi {
        let mut second = messages(100, 100);
        second[50] = parent(150, 5);
        api.with_history(id, vec![messages(0, 100), second, messages(200, 42)])
            .with_replies(
                id,
                &ts(150),
                vec![
                    vec![parent(150, 5), reply(150, 1), reply(150, 2), reply(150, 3), reply(150, 4)],
                    vec![parent(150, 5), reply(150, 5)],
                ],
            )
    }

    fn complete(outcome: &ConversationOutcome) -> &ExportResult {
        match outcome {
            ConversationOutcome::Complete(result) => result,
            other => panic!("expected complete, got {other:?}"),
        }
    }

    fn assert_strictly_ordered(result: &ExportResult) {
        let all: Vec<&Message> = result.messages().collect();
        assert!(all.windows(2).all(|w| w[0].ts < w[1].ts));
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_with_thread_totals_247_records() {
        let (api, coordinator) =
            coordinator(threaded_history(FakeApi::new(), "C"), RetryPolicy::default());

        let report = coordinator.export_all(&ids(&["C"])).await;
        let result = complete(&report.outcomes["C"]);

        assert_eq!(result.len(), 242);
        assert_eq!(result.reply_count(), 5);
        assert_eq!(result.total_records(), 247);
        assert_strictly_ordered(result);

        let thread = result.get(&ts(150)).unwrap().replies.as_ref().unwrap();
        assert_eq!(thread.len(), 5);
        assert!(thread.windows(2).all(|w| w[0].ts < w[1].ts));
        assert_eq!(api.calls(EndpointFamily::History), 3);
        assert_eq!(api.calls(EndpointFamily::Replies), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_page_failures_leave_no_trace() {
        let clean = threaded_history(FakeApi::new(), "D");
        let (_, baseline) = coordinator(clean, RetryPolicy::default());
        let expected = baseline.export_all(&ids(&["D"])).await;

        let flaky = threaded_history(FakeApi::new(), "D").with_fault(
            EndpointFamily::History,
            "D",
            1,
            Fault::Transport,
            3,
        );
        let (api, coordinator) = coordinator(flaky, RetryPolicy::default());
        let report = coordinator.export_all(&ids(&["D"])).await;

        assert_eq!(complete(&report.outcomes["D"]), complete(&expected.outcomes["D"]));
        assert_eq!(api.calls(EndpointFamily::History), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_conversation_is_excluded_alone() {
        let api = threaded_history(FakeApi::new(), "C")
            .with_history("D", vec![messages(0, 10)])
            .deny("E");
        let (_, coordinator) = coordinator(api, RetryPolicy::default());

        let report = coordinator.export_all(&ids(&["C", "D", "E"])).await;

        match &report.outcomes["E"] {
            ConversationOutcome::Excluded { kind, reason, .. } => {
                assert_eq!(*kind, UnrecoverableKind::Authorization);
                assert!(reason.starts_with("Unrecoverable"));
            }
            other => panic!("expected excluded, got {other:?}"),
        }
        assert_eq!(complete(&report.outcomes["C"]).total_records(), 247);
        assert_eq!(complete(&report.outcomes["D"]).len(), 10);
        assert_eq!(report.count("complete"), 2);
        assert_eq!(report.count("excluded"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_history_is_complete() {
        let (_, coordinator) = coordinator(FakeApi::new(), RetryPolicy::default());
        let report = coordinator.export_all(&ids(&["Z", "DM1"])).await;
        assert!(complete(&report.outcomes["Z"]).is_empty());
        assert_eq!(complete(&report.outcomes["DM1"]).display_name, "jane");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_conversation_is_excluded() {
        let (api, coordinator) = coordinator(FakeApi::new(), RetryPolicy::default());
        let report = coordinator.export_all(&ids(&["C404"])).await;
        assert!(matches!(
            report.outcomes["C404"],
            ConversationOutcome::Excluded {
                kind: UnrecoverableKind::NotFound,
                ..
            }
        ));
        assert_eq!(api.calls(EndpointFamily::History), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_matches_from_scratch_export() {
        let temp_dir = TempDir::new().unwrap();
        let policy = RetryPolicy {
            max_transport_retries: 1,
            ..RetryPolicy::default()
        };
        let (_, baseline) = coordinator(threaded_history(FakeApi::new(), "C"), policy.clone());
        let expected = baseline.export_all(&ids(&["C"])).await;

        // page 3 fails past the retry bound once, then recovers
        let api = Arc::new(threaded_history(FakeApi::new(), "C").with_fault(
            EndpointFamily::History,
            "C",
            2,
            Fault::Transport,
            2,
        ));
        let run = |api: Arc<FakeApi>| {
            let gate = Arc::new(RequestGate::new(policy.clone(), CancellationToken::new()));
            ExportCoordinator::new(api, gate, directory(), ExportOptions::default())
                .with_checkpoints(CheckpointStore::new(temp_dir.path()))
        };

        let first = run(api.clone()).export_all(&ids(&["C"])).await;
        match &first.outcomes["C"] {
            ConversationOutcome::Partial { result, resume, .. } => {
                assert_eq!(result.len(), 200);
                assert_eq!(result.reply_count(), 5);
                assert_eq!(resume.history_cursor, Some(FakeApi::cursor_for(2)));
                assert!(!resume.history_done);
            }
            other => panic!("expected partial, got {other:?}"),
        }
        assert!(CheckpointStore::new(temp_dir.path()).load("C").unwrap().is_some());

        let second = run(api.clone()).export_all(&ids(&["C"])).await;
        assert_eq!(complete(&second.outcomes["C"]), complete(&expected.outcomes["C"]));
        // 2 pages + 2 failures, then only the missing page
        assert_eq!(api.calls(EndpointFamily::History), 5);
        // the thread resolved in the first run is not fetched again
        assert_eq!(api.calls(EndpointFamily::Replies), 2);
        assert!(CheckpointStore::new(temp_dir.path()).load("C").unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_ignores_checkpoint() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp_dir.path());
        let mut stale = ExportResult::new(channel("D", "random"), "random");
        stale.merge(vec![message(500)]);
        store
            .save(&Checkpoint::new(
                &stale,
                ResumePoint {
                    history_cursor: Some(FakeApi::cursor_for(1)),
                    ..ResumePoint::default()
                },
                "timeout",
            ))
            .unwrap();

        let api = Arc::new(FakeApi::new().with_history("D", vec![messages(0, 3), messages(3, 3)]));
        let gate = Arc::new(RequestGate::new(
            RetryPolicy::default(),
            CancellationToken::new(),
        ));
        let options = ExportOptions {
            restart: true,
            ..ExportOptions::default()
        };
        let report = ExportCoordinator::new(api.clone(), gate, directory(), options)
            .with_checkpoints(CheckpointStore::new(temp_dir.path()))
            .export_all(&ids(&["D"]))
            .await;

        let result = complete(&report.outcomes["D"]);
        assert_eq!(result.len(), 6);
        assert!(result.get(&ts(500)).is_none());
        assert_eq!(api.calls(EndpointFamily::History), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_thread_keeps_conversation_complete() {
        let api = FakeApi::new()
            .with_history("C", vec![vec![message(1), parent(2, 3), message(3)]])
            .with_fault(EndpointFamily::Replies, &ts(2).to_string(), 0, Fault::NotFound, 1);
        let (_, coordinator) = coordinator(api, RetryPolicy::default());

        let report = coordinator.export_all(&ids(&["C"])).await;
        let result = complete(&report.outcomes["C"]);
        let parent = result.get(&ts(2)).unwrap();
        assert!(parent.replies.is_none());
        assert_eq!(parent.thread_unavailable.as_deref(), Some("thread_not_found"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleted_replies_inline_empty_thread() {
        let mut now_empty = parent(2, 0);
        now_empty.reply_count = Some(0);
        let api = FakeApi::new()
            .with_history("C", vec![vec![message(1), parent(2, 4)]])
            .with_replies("C", &ts(2), vec![vec![now_empty]]);
        let (_, coordinator) = coordinator(api, RetryPolicy::default());

        let report = coordinator.export_all(&ids(&["C"])).await;
        let result = complete(&report.outcomes["C"]);
        assert_eq!(result.get(&ts(2)).unwrap().replies, Some(Vec::new()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_thread_makes_conversation_partial() {
        let policy = RetryPolicy {
            max_transport_retries: 0,
            ..RetryPolicy::default()
        };
        let api = FakeApi::new()
            .with_history("C", vec![vec![message(1), parent(2, 1), parent(3, 1)]])
            .with_replies("C", &ts(3), vec![vec![parent(3, 1), reply(3, 1)]])
            .with_fault(EndpointFamily::Replies, &ts(2).to_string(), 0, Fault::Transport, 1);
        let (_, coordinator) = coordinator(api, policy);

        let report = coordinator.export_all(&ids(&["C"])).await;
        match &report.outcomes["C"] {
            ConversationOutcome::Partial { result, resume, .. } => {
                assert!(resume.history_done);
                assert!(resume.history_cursor.is_none());
                assert_eq!(resume.pending_threads, vec![ts(2)]);
                assert_eq!(result.reply_count(), 1);
            }
            other => panic!("expected partial, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_run_reports_everything_partial() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let api = threaded_history(FakeApi::new(), "C").with_history("D", vec![messages(0, 5)]);
        let (api, coordinator) = coordinator_with(api, RetryPolicy::default(), cancel);

        let report = coordinator.export_all(&ids(&["C", "D"])).await;
        for id in ["C", "D"] {
            match &report.outcomes[id] {
                ConversationOutcome::Partial { result, resume, .. } => {
                    assert!(result.is_empty());
                    assert!(resume.is_start());
                }
                other => panic!("expected partial, got {other:?}"),
            }
        }
        assert_eq!(api.calls(EndpointFamily::History), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_run_checkpoints_progress() {
        let temp_dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        // page 2 keeps the gate waiting on a long retry-after
        let api = Arc::new(threaded_history(FakeApi::new(), "C").with_fault(
            EndpointFamily::History,
            "C",
            1,
            Fault::RateLimited(std::time::Duration::from_secs(600)),
            1,
        ));
        let gate = Arc::new(RequestGate::new(RetryPolicy::default(), cancel.clone()));
        let coordinator = ExportCoordinator::new(api.clone(), gate, directory(), ExportOptions::default())
            .with_checkpoints(CheckpointStore::new(temp_dir.path()));

        let run = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.export_all(&ids(&["C"])).await }
        });
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        cancel.cancel();
        let report = run.await.unwrap();

        match &report.outcomes["C"] {
            ConversationOutcome::Partial { result, resume, .. } => {
                assert_eq!(result.len(), 100);
                assert_eq!(resume.history_cursor, Some(FakeApi::cursor_for(1)));
            }
            other => panic!("expected partial, got {other:?}"),
        }
        let saved = CheckpointStore::new(temp_dir.path()).load("C").unwrap().unwrap();
        assert_eq!(saved.messages.len(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_concurrency_exports_many_conversations() {
        let mut channels = Vec::new();
        let mut api = FakeApi::new();
        for i in 0..12 {
            let id = format!("C{i}");
            channels.push(channel(&id, &format!("chan-{i}")));
            api = api.with_history(&id, vec![messages(0, 5), messages(5, 5)]);
        }
        let directory = Arc::new(DirectorySnapshot::new("T0001", channels, vec![]));
        let api = Arc::new(api);
        let gate = Arc::new(RequestGate::new(
            RetryPolicy::default(),
            CancellationToken::new(),
        ));
        let options = ExportOptions {
            conversation_concurrency: 3,
            ..ExportOptions::default()
        };
        let coordinator = ExportCoordinator::new(api.clone(), gate, directory, options);
        let wanted: Vec<String> = (0..12).map(|i| format!("C{i}")).collect();

        let report = coordinator.export_all(&wanted).await;
        assert_eq!(report.count("complete"), 12);
        assert_eq!(coordinator.progress().snapshot().conversations_done, 12);
        assert_eq!(coordinator.progress().snapshot().messages, 120);
        assert_eq!(api.calls(EndpointFamily::History), 24);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_requests_respect_conversation_concurrency() {
        let mut channels = Vec::new();
        let mut api = FakeApi::new().with_latency(Duration::from_secs(1));
        for i in 0..9 {
            let id = format!("C{i}");
            channels.push(channel(&id, &format!("chan-{i}")));
            api = api.with_history(&id, vec![messages(0, 5), messages(5, 5)]);
        }
        let directory = Arc::new(DirectorySnapshot::new("T0001", channels, vec![]));
        let api = Arc::new(api);
        let gate = Arc::new(RequestGate::new(
            RetryPolicy::default(),
            CancellationToken::new(),
        ));
        let options = ExportOptions {
            conversation_concurrency: 3,
            ..ExportOptions::default()
        };
        let coordinator = ExportCoordinator::new(api.clone(), gate, directory, options);
        let wanted: Vec<String> = (0..9).map(|i| format!("C{i}")).collect();

        let report = coordinator.export_all(&wanted).await;
        assert_eq!(report.count("complete"), 9);
        assert_eq!(api.peak_in_flight(EndpointFamily::History), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_requests_respect_thread_concurrency() {
        let parents: Vec<Message> = (0..8).map(|n| parent(n, 1)).collect();
        let mut api = FakeApi::new()
            .with_latency(Duration::from_secs(1))
            .with_history("C", vec![parents]);
        for n in 0..8 {
            api = api.with_replies("C", &ts(n), vec![vec![parent(n, 1), reply(n, 1)]]);
        }
        let api = Arc::new(api);
        let gate = Arc::new(RequestGate::new(
            RetryPolicy::default(),
            CancellationToken::new(),
        ));
        let options = ExportOptions {
            thread_concurrency: 2,
            ..ExportOptions::default()
        };
        let coordinator = ExportCoordinator::new(api.clone(), gate, directory(), options);

        let outcome = coordinator.export_one("C").await;
        let result = complete(&outcome);
        assert_eq!(result.reply_count(), 8);
        assert_eq!(api.calls(EndpointFamily::Replies), 8);
        assert_eq!(api.peak_in_flight(EndpointFamily::Replies), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_checkpoint_cursor_restarts_history() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp_dir.path());
        let mut stale = ExportResult::new(channel("D", "random"), "random");
        stale.merge(vec![message(500)]);
        store
            .save(&Checkpoint::new(
                &stale,
                ResumePoint {
                    history_cursor: Some(FakeApi::cursor_for(1)),
                    ..ResumePoint::default()
                },
                "timeout",
            ))
            .unwrap();

        let api = Arc::new(
            FakeApi::new()
                .with_history("D", vec![messages(0, 3), messages(3, 3)])
                .with_fault(EndpointFamily::History, "D", 1, Fault::InvalidCursor, 1),
        );
        let gate = Arc::new(RequestGate::new(
            RetryPolicy::default(),
            CancellationToken::new(),
        ));
        let report = ExportCoordinator::new(api.clone(), gate, directory(), ExportOptions::default())
            .with_checkpoints(CheckpointStore::new(temp_dir.path()))
            .export_all(&ids(&["D"]))
            .await;

        let result = complete(&report.outcomes["D"]);
        assert_eq!(result.len(), 6);
        assert!(result.get(&ts(500)).is_none());
        // the rejected resume, then both pages from the start
        assert_eq!(api.calls(EndpointFamily::History), 3);
        assert!(store.load("D").unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_excluded_reason_names_the_failure() {
        let api = FakeApi::new().with_history("E", vec![messages(0, 2)]).deny("E");
        let (_, coordinator) = coordinator(api, RetryPolicy::default());

        match coordinator.export_one("E").await {
            ConversationOutcome::Excluded { kind, reason, .. } => {
                assert_eq!(kind, UnrecoverableKind::Authorization);
                assert_eq!(reason, "Unrecoverable: not_in_channel");
            }
            other => panic!("expected excluded, got {other:?}"),
        }
    }
}
