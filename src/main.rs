use clap::Parser;
use slack_history_exporter::commands::{self, ExportArgs};
use slack_history_exporter::settings::Settings;
use slack_history_exporter::{Cli, Commands, logging};
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    // more than one provider is compiled in through the Slack client
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, saving progress");
                cancel.cancel();
            }
        }
    });

    let result = match Settings::load_from(&cli.settings) {
        Ok(settings) => match cli.command {
            Commands::Warm { refresh } => commands::run_warm(&settings, cancel, refresh).await,
            Commands::Export {
                channels,
                channels_file,
                from,
                to,
                output,
                refresh,
                restart,
                concurrency,
                thread_concurrency,
                max_rpm,
                no_adaptive,
            } => {
                let args = ExportArgs {
                    channels,
                    channels_file,
                    from,
                    to,
                    output,
                    refresh,
                    restart,
                    concurrency,
                    thread_concurrency,
                    max_rpm,
                    no_adaptive,
                };
                commands::run_export(&settings, cancel, args).await
            }
            Commands::Channels { json, refresh } => {
                commands::run_channels(&settings, cancel, json, refresh).await
            }
            Commands::Users { json, refresh } => {
                commands::run_users(&settings, cancel, json, refresh).await
            }
            Commands::Pending => commands::run_pending(&settings),
        },
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
