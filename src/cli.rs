use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::settings::SETTINGS_FILE;

#[derive(Parser)]
#[command(name = "slack-history-exporter")]
#[command(about = "Export the full history of Slack conversations you have access to")]
pub struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Settings file path
    #[arg(long, default_value = SETTINGS_FILE, global = true)]
    pub settings: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fetch and cache the channel and user directory
    Warm {
        /// Ignore the cached directory and fetch it again
        #[arg(short, long)]
        refresh: bool,
    },

    /// Export conversation history, threads included
    Export {
        /// Channel names, #names, conversation ids or DM peer names; all
        /// conversations you are a member of when omitted
        #[arg(short, long, value_delimiter = ',')]
        channels: Vec<String>,

        /// JSON file with an array of channel names
        #[arg(long)]
        channels_file: Option<PathBuf>,

        /// Oldest day to export (YYYY-MM-DD)
        #[arg(short, long)]
        from: Option<String>,

        /// Last day to export, inclusive (YYYY-MM-DD)
        #[arg(short, long)]
        to: Option<String>,

        /// Output directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Refresh the directory before exporting
        #[arg(long)]
        refresh: bool,

        /// Ignore checkpoints from interrupted runs
        #[arg(long)]
        restart: bool,

        /// Conversations exported in parallel
        #[arg(long)]
        concurrency: Option<usize>,

        /// Threads resolved in parallel per conversation
        #[arg(long)]
        thread_concurrency: Option<usize>,

        /// Client-side ceiling in requests per minute per endpoint
        #[arg(short = 'x', long)]
        max_rpm: Option<f64>,

        /// Disable adaptive delays and use the static backoff
        #[arg(short = 'A', long)]
        no_adaptive: bool,
    },

    /// List conversations from the directory
    Channels {
        /// Print raw JSON instead of text
        #[arg(long)]
        json: bool,

        /// Fetch the directory again
        #[arg(short, long)]
        refresh: bool,
    },

    /// List users from the directory
    Users {
        /// Print raw JSON instead of text
        #[arg(long)]
        json: bool,

        /// Fetch the directory again
        #[arg(short, long)]
        refresh: bool,
    },

    /// Show conversations left partial by earlier runs
    Pending,
}
