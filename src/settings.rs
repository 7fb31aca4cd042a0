use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::gate::RetryPolicy;
use crate::{AppError, Result};

pub const SETTINGS_FILE: &str = "settings.toml";

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub export: ExportSettings,
    #[serde(default, rename = "rate-limit")]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub cache: CacheSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    #[serde(rename = "output-dir")]
    pub output_dir: PathBuf,
    #[serde(rename = "conversation-concurrency")]
    pub conversation_concurrency: usize,
    #[serde(rename = "thread-concurrency")]
    pub thread_concurrency: usize,
    #[serde(rename = "page-size")]
    pub page_size: u16,
    #[serde(rename = "include-archived")]
    pub include_archived: bool,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(".slack-backup"),
            conversation_concurrency: 4,
            thread_concurrency: 4,
            page_size: 200,
            include_archived: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    #[serde(rename = "max-rate-limit-retries")]
    pub max_rate_limit_retries: u32,
    #[serde(rename = "max-transport-retries")]
    pub max_transport_retries: u32,
    #[serde(rename = "backoff-base-ms")]
    pub backoff_base_ms: u64,
    #[serde(rename = "backoff-max-ms")]
    pub backoff_max_ms: u64,
    pub adaptive: bool,
    /// Requests per minute per endpoint family; 0 leaves it to the server.
    #[serde(rename = "max-rpm")]
    pub max_rpm: f64,
    #[serde(rename = "static-backoff-ms")]
    pub static_backoff_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_rate_limit_retries: 20,
            max_transport_retries: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            adaptive: true,
            max_rpm: 0.0,
            static_backoff_ms: 30_000,
        }
    }
}

impl RateLimitSettings {
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_rate_limit_retries: self.max_rate_limit_retries,
            max_transport_retries: self.max_transport_retries,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms.max(self.backoff_base_ms)),
            adaptive: self.adaptive,
            static_backoff: Duration::from_millis(self.static_backoff_ms),
            max_rpm: (self.max_rpm > 0.0).then_some(self.max_rpm),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub dir: PathBuf,
    /// Cache key override; normally the workspace id reported by the API.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".slack-cache"),
            workspace: None,
        }
    }
}

impl Settings {
    /// Missing file means defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| AppError::ReadFile {
            path: path.display().to_string(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| AppError::TomlParse(e.to_string()))
    }
}
