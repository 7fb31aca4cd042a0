pub mod api;
pub mod cli;
pub mod commands;
pub mod coordinator;
pub mod directory;
pub mod error;
pub mod gate;
pub mod logging;
pub mod model;
pub mod output;
pub mod paginator;
pub mod resume;
pub mod settings;
pub mod slack;
pub mod threads;

#[cfg(test)]
pub(crate) mod testing;

use chrono::NaiveDate;

pub use api::{ConversationApi, EndpointFamily, HistoryWindow};
pub use cli::{Cli, Commands};
pub use coordinator::{ConversationOutcome, ExportCoordinator, ExportOptions, ExportReport};
pub use error::{AppError, FetchError, Result};
pub use model::{ExportResult, Message, Timestamp};

pub fn load_token() -> Result<String> {
    std::env::var("SLACK_TOKEN")
        .ok()
        .filter(|t| !t.trim().is_empty())
        .ok_or(AppError::MissingToken)
}

pub fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| AppError::InvalidDate(s.to_string()))
}

/// Slack timestamp of 00:00 UTC on `date`.
pub fn date_to_ts(date: NaiveDate) -> Timestamp {
    let secs = date.and_time(chrono::NaiveTime::MIN).and_utc().timestamp();
    Timestamp::new(u64::try_from(secs).unwrap_or(0), 0)
}

/// History bounds from `--from` / `--to`. `to` covers the whole day.
pub fn history_window(from: Option<&str>, to: Option<&str>) -> Result<HistoryWindow> {
    let from = from.map(parse_date).transpose()?;
    let to = to.map(parse_date).transpose()?;
    if let (Some(from), Some(to)) = (from, to)
        && from > to
    {
        return Err(AppError::InvalidDate(format!("{from} is after {to}")));
    }
    Ok(HistoryWindow {
        oldest: from.map(date_to_ts),
        latest: to.map(|d| date_to_ts(d.succ_opt().unwrap_or(d))),
    })
}
