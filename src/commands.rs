use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::coordinator::{ExportCoordinator, ExportOptions};
use crate::directory::{DirectoryCache, DirectorySnapshot, JsonDirectoryStore, Selection};
use crate::error::{AppError, Result};
use crate::gate::{RequestGate, RetryPolicy};
use crate::output::{self, render_channel_list, render_user_list};
use crate::resume::CheckpointStore;
use crate::settings::Settings;
use crate::slack::SlackApi;
use crate::{history_window, load_token};

const CHECKPOINTS_DIR: &str = "checkpoints";
const PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

/// Export flags that override `settings.toml`.
#[derive(Debug, Default)]
pub struct ExportArgs {
    pub channels: Vec<String>,
    pub channels_file: Option<PathBuf>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub output: Option<PathBuf>,
    pub refresh: bool,
    pub restart: bool,
    pub concurrency: Option<usize>,
    pub thread_concurrency: Option<usize>,
    pub max_rpm: Option<f64>,
    pub no_adaptive: bool,
}

/// Everything a command needs to talk to Slack.
struct Context {
    api: Arc<SlackApi>,
    gate: Arc<RequestGate>,
    directory: DirectoryCache,
}

impl Context {
    fn new(settings: &Settings, policy: RetryPolicy, cancel: CancellationToken) -> Result<Self> {
        let token = load_token()?;
        let api = Arc::new(SlackApi::new(&token)?);
        let gate = Arc::new(RequestGate::new(policy, cancel));
        let store = Arc::new(JsonDirectoryStore::new(&settings.cache.dir));
        let directory = DirectoryCache::new(api.clone(), gate.clone(), store)
            .with_workspace(settings.cache.workspace.clone())
            .with_archived(settings.export.include_archived);
        Ok(Self {
            api,
            gate,
            directory,
        })
    }
}

fn checkpoint_store(settings: &Settings, workspace: &str) -> CheckpointStore {
    CheckpointStore::new(settings.cache.dir.join(workspace).join(CHECKPOINTS_DIR))
}

pub async fn run_warm(settings: &Settings, cancel: CancellationToken, refresh: bool) -> Result<()> {
    let context = Context::new(settings, settings.rate_limit.to_retry_policy(), cancel)?;

    println!("Fetching workspace directory...");
    let snapshot = context.directory.warm(refresh).await?;

    println!(
        "Directory ready: {} conversations, {} users (workspace {}).",
        snapshot.channels().len(),
        snapshot.users().len(),
        snapshot.workspace()
    );
    Ok(())
}

async fn listing_snapshot(
    settings: &Settings,
    cancel: CancellationToken,
    refresh: bool,
) -> Result<Arc<DirectorySnapshot>> {
    let context = Context::new(settings, settings.rate_limit.to_retry_policy(), cancel)?;
    context.directory.warm(refresh).await
}

pub async fn run_channels(
    settings: &Settings,
    cancel: CancellationToken,
    json: bool,
    refresh: bool,
) -> Result<()> {
    let snapshot = listing_snapshot(settings, cancel, refresh).await?;
    if json {
        let out = serde_json::to_string_pretty(snapshot.channels())
            .map_err(|e| AppError::JsonSerialize(e.to_string()))?;
        println!("{out}");
    } else {
        println!("{}", render_channel_list(&snapshot));
    }
    Ok(())
}

pub async fn run_users(
    settings: &Settings,
    cancel: CancellationToken,
    json: bool,
    refresh: bool,
) -> Result<()> {
    let snapshot = listing_snapshot(settings, cancel, refresh).await?;
    if json {
        let mut users: Vec<_> = snapshot.user_list().collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        let out = serde_json::to_string_pretty(&users)
            .map_err(|e| AppError::JsonSerialize(e.to_string()))?;
        println!("{out}");
    } else {
        println!("{}", render_user_list(&snapshot));
    }
    Ok(())
}

fn retry_policy(settings: &Settings, args: &ExportArgs) -> RetryPolicy {
    let mut policy = settings.rate_limit.to_retry_policy();
    if let Some(rpm) = args.max_rpm {
        policy.max_rpm = (rpm > 0.0).then_some(rpm);
    }
    if args.no_adaptive {
        policy.adaptive = false;
    }
    policy
}

fn export_options(settings: &Settings, args: &ExportArgs) -> Result<ExportOptions> {
    Ok(ExportOptions {
        window: history_window(args.from.as_deref(), args.to.as_deref())?,
        page_size: settings.export.page_size.clamp(1, 1000),
        conversation_concurrency: args
            .concurrency
            .unwrap_or(settings.export.conversation_concurrency)
            .max(1),
        thread_concurrency: args
            .thread_concurrency
            .unwrap_or(settings.export.thread_concurrency)
            .max(1),
        restart: args.restart,
    })
}

/// Conversation ids for the requested names; unknown names are skipped
/// unless nothing at all matched.
fn select(snapshot: &DirectorySnapshot, args: &ExportArgs) -> Result<Vec<String>> {
    let selection = Selection::from_args(args.channels.clone(), args.channels_file.as_deref())?;
    let (ids, unknown) = snapshot.resolve(&selection);
    for name in &unknown {
        warn!(name = %name, "no conversation with this name, skipping");
    }
    if ids.is_empty() && !unknown.is_empty() {
        return Err(AppError::UnknownConversation(unknown.join(", ")));
    }
    Ok(ids)
}

pub async fn run_export(settings: &Settings, cancel: CancellationToken, args: ExportArgs) -> Result<()> {
    let options = export_options(settings, &args)?;
    let output_dir = args
        .output
        .clone()
        .unwrap_or_else(|| settings.export.output_dir.clone());
    let context = Context::new(settings, retry_policy(settings, &args), cancel)?;

    let snapshot = context.directory.warm(args.refresh).await?;
    let ids = select(&snapshot, &args)?;
    if ids.is_empty() {
        println!("Nothing to export.");
        return Ok(());
    }

    println!(
        "Exporting {} conversation(s) to {}...",
        ids.len(),
        output_dir.display()
    );

    let coordinator = ExportCoordinator::new(
        context.api.clone(),
        context.gate.clone(),
        snapshot.clone(),
        options,
    )
    .with_checkpoints(checkpoint_store(settings, snapshot.workspace()));

    let ticker = {
        let progress = coordinator.progress();
        let total = ids.len();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PROGRESS_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let p = progress.snapshot();
                info!(
                    done = p.conversations_done,
                    total,
                    pages = p.pages,
                    messages = p.messages,
                    threads = p.threads,
                    "progress"
                );
            }
        })
    };
    let report = coordinator.export_all(&ids).await;
    ticker.abort();

    let run = output::write_run(&output_dir, &report)?;
    println!(
        "Export finished: {} complete, {} partial, {} excluded, {} records.",
        run.summary.complete, run.summary.partial, run.summary.excluded, run.summary.records
    );
    if run.summary.partial > 0 {
        println!("Run the same command again to resume the partial conversations.");
    }

    if context.gate.is_cancelled() {
        return Err(AppError::Cancelled);
    }
    Ok(())
}

/// Lists checkpoints of every cached workspace. Needs no token.
pub fn run_pending(settings: &Settings) -> Result<()> {
    let workspaces = cached_workspaces(&settings.cache.dir)?;
    let mut total = 0;
    for workspace in workspaces {
        for checkpoint in checkpoint_store(settings, &workspace).list()? {
            total += 1;
            println!(
                "[{}] {} ({}): {} messages, {}, saved {}",
                checkpoint.conversation_id(),
                checkpoint.display_name,
                workspace,
                checkpoint.messages.len(),
                checkpoint.reason,
                checkpoint.saved_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
    }
    if total == 0 {
        println!("No partial exports.");
    }
    Ok(())
}

fn cached_workspaces(cache_dir: &Path) -> Result<Vec<String>> {
    if !cache_dir.exists() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(cache_dir).map_err(|e| AppError::ReadFile {
        path: cache_dir.display().to_string(),
        source: e,
    })?;
    let mut workspaces: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    workspaces.sort();
    Ok(workspaces)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::channel;
    use tempfile::TempDir;

    #[test]
    fn test_cli_flags_override_settings() {
        let settings = Settings::default();
        let args = ExportArgs {
            concurrency: Some(8),
            max_rpm: Some(30.0),
            no_adaptive: true,
            from: Some("2024-01-01".to_string()),
            ..ExportArgs::default()
        };

        let options = export_options(&settings, &args).unwrap();
        assert_eq!(options.conversation_concurrency, 8);
        assert_eq!(options.thread_concurrency, 4);
        assert!(options.window.oldest.is_some());
        assert!(options.window.latest.is_none());

        let policy = retry_policy(&settings, &args);
        assert_eq!(policy.max_rpm, Some(30.0));
        assert!(!policy.adaptive);
    }

    #[test]
    fn test_select_fails_only_when_nothing_matches() {
        let snapshot = DirectorySnapshot::new("T1", vec![channel("C1", "general")], vec![]);

        let args = ExportArgs {
            channels: vec!["general".to_string(), "missing".to_string()],
            ..ExportArgs::default()
        };
        assert_eq!(select(&snapshot, &args).unwrap(), vec!["C1"]);

        let args = ExportArgs {
            channels: vec!["missing".to_string()],
            ..ExportArgs::default()
        };
        assert!(matches!(
            select(&snapshot, &args),
            Err(AppError::UnknownConversation(_))
        ));
    }

    #[test]
    fn test_pending_lists_cached_workspaces() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("T1").join(CHECKPOINTS_DIR)).unwrap();
        fs::create_dir_all(temp_dir.path().join("T2")).unwrap();
        fs::write(temp_dir.path().join("stray.json"), "[]").unwrap();

        assert_eq!(cached_workspaces(temp_dir.path()).unwrap(), vec!["T1", "T2"]);
        assert!(cached_workspaces(&temp_dir.path().join("none")).unwrap().is_empty());

        let mut settings = Settings::default();
        settings.cache.dir = temp_dir.path().to_path_buf();
        run_pending(&settings).unwrap();
    }
}
