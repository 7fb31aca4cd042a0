use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::coordinator::{ConversationOutcome, ExportReport};
use crate::directory::DirectorySnapshot;
use crate::error::UnrecoverableKind;
use crate::gate::RateSnapshot;
use crate::model::{Conversation, ExportResult, Message};
use crate::resume::ResumePoint;
use crate::{AppError, Result};

pub const REPORT_FILE: &str = "report.json";

pub fn write_json<T: Serialize + ?Sized>(path: &Path, data: &T) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| AppError::WriteFile {
            path: parent.display().to_string(),
            source: e,
        })?;
    }
    let file = File::create(path).map_err(|e| AppError::WriteFile {
        path: path.display().to_string(),
        source: e,
    })?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, data).map_err(|e| AppError::JsonSerialize(e.to_string()))?;
    Ok(())
}

/// Writes next to `path` under a unique name, then renames over it, so
/// readers see either the old or the new file, never a torn one.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, data: &T) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));
    write_json(&tmp, data)?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        AppError::WriteFile {
            path: path.display().to_string(),
            source: e,
        }
    })
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).map_err(|e| AppError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    serde_json::from_reader(BufReader::new(file)).map_err(|e| AppError::JsonParse(e.to_string()))
}

/// Turns a display name into a single safe path component.
pub fn file_stem(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .trim_start_matches('#')
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "unnamed".to_string(),
        s => s.to_string(),
    }
}

/// `<output-dir>/<name>_<id>/<name>_<id>.json`. Display names repeat (a DM
/// peer called `general` next to `#general`), ids do not.
pub fn export_path(output_dir: &Path, result: &ExportResult) -> PathBuf {
    let stem = format!(
        "{}_{}",
        file_stem(&result.display_name),
        file_stem(&result.conversation.id)
    );
    output_dir.join(&stem).join(format!("{stem}.json"))
}

#[derive(Serialize)]
struct ExportFile<'a> {
    conversation: &'a Conversation,
    display_name: &'a str,
    complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    resume: Option<&'a ResumePoint>,
    messages: Vec<&'a Message>,
}

/// Writes one conversation's messages, ascending, replies inlined.
pub fn write_export(
    output_dir: &Path,
    result: &ExportResult,
    resume: Option<&ResumePoint>,
) -> Result<PathBuf> {
    let path = export_path(output_dir, result);
    let file = ExportFile {
        conversation: &result.conversation,
        display_name: &result.display_name,
        complete: resume.is_none(),
        resume,
        messages: result.messages().collect(),
    };
    write_json_atomic(&path, &file)?;
    Ok(path)
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum ReportEntry {
    Complete {
        display_name: String,
        messages: usize,
        replies: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
    },
    Partial {
        display_name: String,
        messages: usize,
        replies: usize,
        resume: ResumePoint,
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
    },
    Excluded {
        kind: UnrecoverableKind,
        reason: String,
    },
}

#[derive(Debug, Default, Serialize)]
pub struct ReportSummary {
    pub complete: usize,
    pub partial: usize,
    pub excluded: usize,
    pub records: usize,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub summary: ReportSummary,
    pub conversations: BTreeMap<String, ReportEntry>,
    pub rate_limits: Vec<RateSnapshot>,
}

/// Writes every exported conversation and the run report. Excluded
/// conversations only show up in the report.
pub fn write_run(output_dir: &Path, report: &ExportReport) -> Result<RunReport> {
    let mut summary = ReportSummary::default();
    let mut conversations = BTreeMap::new();

    for (id, outcome) in &report.outcomes {
        let entry = match outcome {
            ConversationOutcome::Complete(result) => {
                let path = write_export(output_dir, result, None)?;
                summary.complete += 1;
                summary.records += result.total_records();
                ReportEntry::Complete {
                    display_name: result.display_name.clone(),
                    messages: result.len(),
                    replies: result.reply_count(),
                    path: Some(path),
                }
            }
            ConversationOutcome::Partial {
                result,
                resume,
                reason,
            } => {
                let path = if result.is_empty() {
                    None
                } else {
                    Some(write_export(output_dir, result, Some(resume))?)
                };
                summary.partial += 1;
                summary.records += result.total_records();
                ReportEntry::Partial {
                    display_name: result.display_name.clone(),
                    messages: result.len(),
                    replies: result.reply_count(),
                    resume: resume.clone(),
                    reason: reason.clone(),
                    path,
                }
            }
            ConversationOutcome::Excluded { kind, reason, .. } => {
                summary.excluded += 1;
                ReportEntry::Excluded {
                    kind: *kind,
                    reason: reason.clone(),
                }
            }
        };
        conversations.insert(id.clone(), entry);
    }

    let run = RunReport {
        summary,
        conversations,
        rate_limits: report.rate_limits.clone(),
    };
    write_json(&output_dir.join(REPORT_FILE), &run)?;
    info!(
        complete = run.summary.complete,
        partial = run.summary.partial,
        excluded = run.summary.excluded,
        records = run.summary.records,
        "export written to {}",
        output_dir.display()
    );
    Ok(run)
}

/// `[id] name: kind created by/with someone`, one line per conversation.
pub fn render_channel_list(snapshot: &DirectorySnapshot) -> String {
    let mut lines: Vec<String> = snapshot
        .channels()
        .iter()
        .map(|c| {
            let owner = match (&c.user, &c.creator) {
                (Some(peer), _) => format!(" with {}", snapshot.user_name(peer)),
                (None, Some(creator)) => format!(" created by {}", snapshot.user_name(creator)),
                (None, None) => String::new(),
            };
            let archived = if c.is_archived { " (archived)" } else { "" };
            format!(
                "[{}] {}: {}{}{}",
                c.id,
                snapshot.display_name(c),
                c.kind.label(),
                owner,
                archived
            )
        })
        .collect();
    lines.sort_by_key(|l| l.to_lowercase());
    lines.join("\n")
}

/// `[id] name (real name), tz, roles`, one line per user.
pub fn render_user_list(snapshot: &DirectorySnapshot) -> String {
    let mut users: Vec<_> = snapshot.user_list().collect();
    users.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    users
        .into_iter()
        .map(|u| {
            let mut line = format!("[{}] {}", u.id, u.name);
            if let Some(real) = &u.real_name {
                line.push_str(&format!(" ({real})"));
            }
            if let Some(tz) = &u.tz {
                line.push_str(&format!(", {tz}"));
            }
            if !u.roles.is_empty() {
                line.push_str(&format!(", {}", u.roles.join("|")));
            }
            if u.deleted {
                line.push_str(", deleted");
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}
