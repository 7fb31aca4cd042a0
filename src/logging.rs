use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Default filter for `-v` repetitions. Progress is logged at info level,
/// so the exporter's own events show without any flag.
pub fn filter_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn,slack_history_exporter=info",
        1 => "info,slack_history_exporter=debug",
        2 => "debug",
        _ => "trace",
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over `verbosity`.
/// Output goes to stderr so listings on stdout stay machine readable.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(verbosity)));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .without_time()
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();
}
