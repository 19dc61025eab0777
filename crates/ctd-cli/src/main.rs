//! `ctdmate` - CTD section routing, linting, reference checks and drafting

mod cli;
mod commands;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Exit code for contract violations (bad rule file, unsupported format, bad config)
const EXIT_FATAL: i32 = 2;

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() {
    let matches = cli::build_cli().get_matches();
    init_tracing(matches.get_flag("log-json"));

    if let Err(err) = commands::dispatch(&matches).await {
        tracing::error!(error = %format!("{err:#}"), "ctdmate failed");
        let report = commands::error_report(&err);
        if let Ok(json) = serde_json::to_string_pretty(&report) {
            println!("{json}");
        }
        std::process::exit(EXIT_FATAL);
    }
}
