//! Herald command-line dispatcher.
//!
//! Sends one structured-mode event file through the dispatch pipeline and
//! prints the outcome. Useful for probing sinks and dead-letter setups.

use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::Parser;
use herald_core::{binding::from_structured_json, Addressable, Encoding, Event};
use herald_dispatch::{
    ClientPool, DispatchConfig, DispatchFailure, DispatchInfo, DispatchOptions, Dispatcher,
    ErrorCategory,
};
use tracing::{error, info};

/// Dispatch an event to a destination with retries, replies and dead
/// letters.
#[derive(Debug, Parser)]
#[command(name = "herald", version, about)]
struct Args {
    /// Structured-mode (JSON) event file.
    event: PathBuf,

    /// Destination URL.
    #[arg(long, short)]
    destination: String,

    /// Target for reply events returned by the destination.
    #[arg(long)]
    reply: Option<String>,

    /// Dead-letter sink for events that cannot be delivered.
    #[arg(long)]
    dead_letter: Option<String>,

    /// Extra request header as `name=value`. Repeatable.
    #[arg(long = "header", short = 'H', value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// PEM bundle trusted for the destination on top of the system roots.
    #[arg(long)]
    ca_certs: Option<PathBuf>,

    /// Send in structured mode instead of binary mode.
    #[arg(long)]
    structured: bool,

    /// Configuration file.
    #[arg(long, short, default_value = "herald.toml", env = "HERALD_CONFIG")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let config = DispatchConfig::load_from(&args.config)?;
    init_tracing(&config.rust_log)?;

    let event = read_event(&args.event)?;
    let destination = addressable(&args.destination, args.ca_certs.as_deref())?;
    let options = build_options(&args, &config)?;

    let pool = Arc::new(ClientPool::with_user_agent(config.user_agent.clone()));
    pool.reconfigure(Some(config.to_connection_args())).await;
    let dispatcher = Dispatcher::new(pool).with_settings(config.to_dispatcher_settings());

    info!(event_id = %event.id(), destination = %destination, "dispatching event");
    match dispatcher.dispatch(&event, &destination, options).await {
        Ok(dispatch_info) => {
            print_info(&dispatch_info);
            Ok(ExitCode::SUCCESS)
        },
        Err(DispatchFailure { info: dispatch_info, error: dispatch_error }) => {
            let category = ErrorCategory::from(&dispatch_error);
            error!(
                %category,
                failed_target = dispatch_error.target().unwrap_or("none"),
                "dispatch failed: {dispatch_error}"
            );
            print_info(&dispatch_info);
            Ok(ExitCode::FAILURE)
        },
    }
}

/// Initializes tracing, preferring `RUST_LOG` over the configured filter.
fn init_tracing(default_filter: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .context("Invalid log filter")?;

    let fmt_layer = fmt::layer().with_target(true).with_writer(std::io::stderr);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

fn read_event(path: &Path) -> Result<Event> {
    let body = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    from_structured_json(&body).with_context(|| format!("{} is not a valid event", path.display()))
}

fn addressable(url: &str, ca_certs: Option<&Path>) -> Result<Addressable> {
    let addressable = Addressable::parse(url).with_context(|| format!("Invalid URL {url}"))?;
    let Some(path) = ca_certs else {
        return Ok(addressable);
    };

    let pem = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read CA certs from {}", path.display()))?;
    Ok(addressable.with_ca_certs(pem))
}

fn build_options(args: &Args, config: &DispatchConfig) -> Result<DispatchOptions> {
    let mut builder = DispatchOptions::builder().retry_config(config.to_retry_config());

    if let Some(reply) = &args.reply {
        builder = builder.reply(addressable(reply, None)?);
    }
    if let Some(dead_letter) = &args.dead_letter {
        builder = builder.dead_letter_sink(addressable(dead_letter, None)?);
    }
    for (name, value) in &args.headers {
        builder = builder.header(name, value);
    }
    if args.structured {
        builder = builder.encoding(Encoding::Structured);
    }

    builder.build().context("Invalid dispatch options")
}

fn parse_header(raw: &str) -> std::result::Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got {raw:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in {raw:?}"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

fn print_info(info: &DispatchInfo) {
    match info.response_code {
        Some(status) => println!("status: {status}"),
        None => println!("status: none"),
    }
    if let Some(duration) = info.duration {
        println!("duration_ms: {}", duration.as_millis());
    }
    for (name, value) in &info.response_headers {
        println!("header {name}: {}", String::from_utf8_lossy(value.as_bytes()));
    }
    if !info.response_body.is_empty() {
        println!("body: {}", String::from_utf8_lossy(&info.response_body));
    }
}
