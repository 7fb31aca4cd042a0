//! Workspace directory: every conversation and user the token can see.
//!
//! A [`DirectoryCache`] lists both fully through the request gate, keeps
//! the result as an immutable [`DirectorySnapshot`] for the rest of the run
//! and persists it through a [`DirectoryStore`]. There is no expiry: a
//! stored directory is reused until someone asks for a refresh.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::api::{ApiFailure, ConversationApi, EndpointFamily, Page};
use crate::error::FetchError;
use crate::gate::RequestGate;
use crate::model::{Conversation, ConversationKind, User};
use crate::output::{read_json, write_json_atomic};
use crate::{AppError, Result};

pub const CHANNELS_FILE: &str = "channels.json";
pub const USERS_FILE: &str = "users.json";

const LISTING_LIMIT: u16 = 1000;

/// Everything the directory persists for one workspace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    pub channels: Vec<Conversation>,
    pub users: Vec<User>,
}

/// Durable storage for directory records. Reads and writes are whole
/// records; there is no partial update.
pub trait DirectoryStore: Send + Sync {
    fn load(&self, workspace: &str) -> Result<Option<DirectoryRecord>>;
    fn replace(&self, workspace: &str, record: &DirectoryRecord) -> Result<()>;
}

/// `<root>/<workspace>/channels.json` and `users.json`.
#[derive(Debug, Clone)]
pub struct JsonDirectoryStore {
    root: PathBuf,
}

impl JsonDirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn workspace_dir(&self, workspace: &str) -> PathBuf {
        self.root.join(workspace)
    }
}

impl DirectoryStore for JsonDirectoryStore {
    fn load(&self, workspace: &str) -> Result<Option<DirectoryRecord>> {
        let dir = self.workspace_dir(workspace);
        let channels_path = dir.join(CHANNELS_FILE);
        let users_path = dir.join(USERS_FILE);
        if !channels_path.exists() || !users_path.exists() {
            return Ok(None);
        }
        Ok(Some(DirectoryRecord {
            channels: read_json(&channels_path)?,
            users: read_json(&users_path)?,
        }))
    }

    fn replace(&self, workspace: &str, record: &DirectoryRecord) -> Result<()> {
        let dir = self.workspace_dir(workspace);
        write_json_atomic(&dir.join(USERS_FILE), &record.users)?;
        write_json_atomic(&dir.join(CHANNELS_FILE), &record.channels)
    }
}

/// Which conversations to export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Every conversation the user is a member of.
    All,
    /// Names (`general`, `#general`), conversation ids, or DM peer names.
    Named(Vec<String>),
}

impl Selection {
    /// Builds a selection from command line names plus an optional JSON
    /// file holding an array of names. No names at all means `All`.
    pub fn from_args(names: Vec<String>, file: Option<&Path>) -> Result<Self> {
        let mut all: Vec<String> = names
            .into_iter()
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect();
        if let Some(path) = file {
            let listed: Vec<String> = read_json(path)?;
            all.extend(listed);
        }
        if all.is_empty() {
            Ok(Selection::All)
        } else {
            Ok(Selection::Named(all))
        }
    }
}

/// Read-only view of the directory for one run.
#[derive(Debug, Clone)]
pub struct DirectorySnapshot {
    workspace: String,
    channels: Vec<Conversation>,
    users: HashMap<String, User>,
    names: HashMap<String, String>,
}

impl DirectorySnapshot {
    pub fn new(workspace: impl Into<String>, channels: Vec<Conversation>, users: Vec<User>) -> Self {
        let names = users
            .iter()
            .map(|u| (u.id.clone(), u.preferred_name().to_string()))
            .collect();
        let users = users.into_iter().map(|u| (u.id.clone(), u)).collect();
        Self {
            workspace: workspace.into(),
            channels,
            users,
            names,
        }
    }

    fn from_record(workspace: &str, record: DirectoryRecord) -> Self {
        Self::new(workspace, record.channels, record.users)
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    pub fn channels(&self) -> &[Conversation] {
        &self.channels
    }

    /// User id to display name.
    pub fn users(&self) -> &HashMap<String, String> {
        &self.names
    }

    pub fn user_list(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn user_name(&self, id: &str) -> String {
        self.names.get(id).cloned().unwrap_or_else(|| id.to_string())
    }

    pub fn find(&self, conversation_id: &str) -> Option<&Conversation> {
        self.channels.iter().find(|c| c.id == conversation_id)
    }

    /// Direct messages are named after the peer, everything else after
    /// the channel name.
    pub fn display_name(&self, conversation: &Conversation) -> String {
        match (conversation.kind, &conversation.user, &conversation.name) {
            (ConversationKind::DirectMessage, Some(peer), _) => self.user_name(peer),
            (_, _, Some(name)) => name.clone(),
            _ => conversation.id.clone(),
        }
    }

    /// Resolves a selection to conversation ids, in request order without
    /// duplicates, plus the names that matched nothing.
    pub fn resolve(&self, selection: &Selection) -> (Vec<String>, Vec<String>) {
        let names = match selection {
            Selection::All => {
                let ids = self
                    .channels
                    .iter()
                    .filter(|c| c.is_member)
                    .map(|c| c.id.clone())
                    .collect();
                return (ids, Vec::new());
            }
            Selection::Named(names) => names,
        };

        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        let mut unknown = Vec::new();
        for raw in names {
            let wanted = raw.trim().trim_start_matches('#');
            let found = self.channels.iter().find(|c| {
                c.id == wanted
                    || c.name.as_deref() == Some(wanted)
                    || (c.kind == ConversationKind::DirectMessage
                        && self.display_name(c) == wanted)
            });
            match found {
                Some(c) => {
                    if seen.insert(c.id.clone()) {
                        ids.push(c.id.clone());
                    }
                }
                None => unknown.push(raw.clone()),
            }
        }
        (ids, unknown)
    }
}

/// Lazily warmed, run-scoped directory.
pub struct DirectoryCache {
    api: Arc<dyn ConversationApi>,
    gate: Arc<RequestGate>,
    store: Arc<dyn DirectoryStore>,
    workspace: Option<String>,
    include_archived: bool,
    snapshot: Mutex<Option<Arc<DirectorySnapshot>>>,
}

impl DirectoryCache {
    pub fn new(
        api: Arc<dyn ConversationApi>,
        gate: Arc<RequestGate>,
        store: Arc<dyn DirectoryStore>,
    ) -> Self {
        Self {
            api,
            gate,
            store,
            workspace: None,
            include_archived: false,
            snapshot: Mutex::new(None),
        }
    }

    /// Uses `workspace` as the cache key instead of asking the API.
    pub fn with_workspace(mut self, workspace: Option<String>) -> Self {
        self.workspace = workspace;
        self
    }

    pub fn with_archived(mut self, include_archived: bool) -> Self {
        self.include_archived = include_archived;
        self
    }

    /// The directory for this run, warming it on first use.
    pub async fn snapshot(&self) -> Result<Arc<DirectorySnapshot>> {
        self.warm(false).await
    }

    pub async fn channels(&self) -> Result<Vec<Conversation>> {
        Ok(self.snapshot().await?.channels().to_vec())
    }

    pub async fn users(&self) -> Result<HashMap<String, String>> {
        Ok(self.snapshot().await?.users().clone())
    }

    /// Loads the directory: from memory, then from the store, then from
    /// the API. `refresh` skips both caches and replaces the stored copy.
    pub async fn warm(&self, refresh: bool) -> Result<Arc<DirectorySnapshot>> {
        let mut current = self.snapshot.lock().await;
        if !refresh && let Some(snapshot) = current.as_ref() {
            return Ok(snapshot.clone());
        }

        let workspace = self.workspace_key().await?;
        // a refresh keeps the stored copy until the new listing is complete
        if !refresh && let Some(record) = self.store.load(&workspace)? {
            info!(
                workspace = %workspace,
                channels = record.channels.len(),
                users = record.users.len(),
                "directory loaded from cache"
            );
            let snapshot = Arc::new(DirectorySnapshot::from_record(&workspace, record));
            *current = Some(snapshot.clone());
            return Ok(snapshot);
        }

        let record = self.fetch().await.map_err(AppError::DirectoryWarmup)?;
        self.store.replace(&workspace, &record)?;
        info!(
            workspace = %workspace,
            channels = record.channels.len(),
            users = record.users.len(),
            "directory fetched"
        );
        let snapshot = Arc::new(DirectorySnapshot::from_record(&workspace, record));
        *current = Some(snapshot.clone());
        Ok(snapshot)
    }

    async fn workspace_key(&self) -> Result<String> {
        if let Some(workspace) = &self.workspace {
            return Ok(workspace.clone());
        }
        let api = self.api.as_ref();
        self.gate
            .execute(EndpointFamily::Identity, || api.workspace_id())
            .await
            .map_err(AppError::DirectoryWarmup)
    }

    async fn fetch(&self) -> std::result::Result<DirectoryRecord, FetchError> {
        let api = self.api.as_ref();
        let include_archived = self.include_archived;
        let channels = self
            .collect(EndpointFamily::ConversationsList, move |cursor| async move {
                api.list_conversations(cursor.as_deref(), LISTING_LIMIT, include_archived)
                    .await
            })
            .await?;
        let users = self
            .collect(EndpointFamily::UsersList, move |cursor| async move {
                api.list_users(cursor.as_deref(), LISTING_LIMIT).await
            })
            .await?;
        Ok(DirectoryRecord { channels, users })
    }

    /// Accumulates every page of one listing; nothing is returned unless
    /// the terminal page was reached.
    async fn collect<T, F, Fut>(
        &self,
        family: EndpointFamily,
        request: F,
    ) -> std::result::Result<Vec<T>, FetchError>
    where
        F: Fn(Option<String>) -> Fut,
        Fut: Future<Output = std::result::Result<Page<T>, ApiFailure>>,
    {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page: Page<T> = self
                .gate
                .execute(family, || request(cursor.clone()))
                .await
                .inspect_err(|e| warn!(family = %family, error = %e, "directory listing failed"))?;
            items.extend(page.items);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(items),
            }
        }
    }
}
