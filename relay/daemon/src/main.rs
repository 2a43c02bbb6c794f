//! Relay Daemon
//!
//! Serves a handful of demo patterns over a local socket and doubles as a
//! command-line client for any relay server.
//!
//! # Usage
//!
//! ```bash
//! # Serve with options from ~/.config/relay/relay.toml and RELAY_* variables
//! relay-daemon serve
//!
//! # Serve a specific ID with a hook timeout
//! relay-daemon --id worker serve --hook-timeout-ms 2000
//!
//! # Fire-and-forget an event
//! relay-daemon --id worker send echo '{"hello": "world"}'
//!
//! # Request and print the response
//! relay-daemon --id worker request sum '{"values": [1, 2, 3]}'
//!
//! # Verbose logging
//! RUST_LOG=debug relay-daemon serve
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown (removes the socket file)

mod components;
mod handlers;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info};

use relay_core::{
    default_config_path, events, load_options_from_path, ClientOptions, CorrelationMode,
    IpcModule, IpcOptions, IpcService, LoadedOptions, Payload, ResponseEvent, ServerOptions,
};

/// Relay Daemon - pattern-addressed messaging over local IPC
#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "RELAY_CONFIG", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Socket or service ID (overrides file and environment)
    #[arg(short = 'i', long, global = true)]
    id: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        short = 'l',
        long,
        env = "RELAY_LOG_LEVEL",
        default_value = "info",
        global = true
    )]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the daemon patterns until SIGINT or SIGTERM
    Serve {
        /// Upper bound for each lifecycle hook
        #[arg(long, value_name = "MS")]
        hook_timeout_ms: Option<u64>,
    },
    /// Emit an event without waiting for a response
    Send {
        /// Message pattern
        pattern: String,
        /// JSON payload
        #[arg(default_value = "null")]
        data: String,
    },
    /// Send a request and print the response
    Request {
        /// Message pattern
        pattern: String,
        /// JSON payload
        #[arg(default_value = "null")]
        data: String,
        /// How long to wait for the connection and for the response
        #[arg(long, value_name = "MS", default_value_t = 5000)]
        timeout_ms: u64,
    },
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("relay_daemon={level},relay_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Resolve options from the config file, the environment and `--id`
fn resolve_options(config: Option<PathBuf>, id: Option<String>) -> Result<LoadedOptions> {
    let path = config.or_else(default_config_path);
    let loaded = load_options_from_path(path.as_deref(), id).context("Failed to load options")?;
    info!(
        id = %loaded.options.id,
        endpoint = %loaded.options.endpoint(),
        source = %loaded.source,
        "Options resolved"
    );
    Ok(loaded)
}

fn parse_payload(data: &str) -> Result<Payload> {
    serde_json::from_str(data).with_context(|| format!("Payload is not valid JSON: {data}"))
}

/// Server and client agree on request IDs and pattern-tagged responses
fn build_module(
    options: IpcOptions,
    hook_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
) -> Result<IpcModule> {
    let module = IpcModule::new(options)?
        .with_server_options(ServerOptions {
            hook_timeout,
            response_event: ResponseEvent::Pattern,
            correlation: CorrelationMode::RequestId,
        })
        .with_client_options(ClientOptions {
            correlation: CorrelationMode::RequestId,
            request_timeout,
        });
    Ok(module)
}

async fn shutdown_signal() -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
        _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
    }
    Ok(())
}

async fn serve(options: IpcOptions, hook_timeout: Option<Duration>) -> Result<()> {
    let id = options.id.clone();
    let mut module = build_module(options, hook_timeout, None)?;

    let presence = components::register(module.instances(), &id)?;
    handlers::register(module.handlers_mut(), presence)?;

    let server = module.server()?;
    server
        .listen(|| info!("Ready to accept connections"))
        .await
        .context("Failed to start server")?;

    let waited = shutdown_signal().await;

    info!("Shutting down...");
    server.close().await.context("Shutdown failed")?;
    waited?;

    info!("Relay daemon stopped cleanly");
    Ok(())
}

/// Connect and wait until the channel reports `connect`
async fn connect(service: &IpcService, wait: Duration) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let emitter = service.channel().events();
    let connected_tx = tx.clone();
    let on_connect = emitter.on(events::CONNECT, move |_| {
        let _ = connected_tx.send(true);
    });
    let on_destroy = emitter.on(events::DESTROY, move |_| {
        let _ = tx.send(false);
    });

    service.connect().await?;
    let outcome = tokio::time::timeout(wait, rx.recv()).await;
    emitter.off(events::CONNECT, on_connect);
    emitter.off(events::DESTROY, on_destroy);

    match outcome {
        Ok(Some(true)) => Ok(()),
        Ok(_) => bail!("Gave up connecting to the server"),
        Err(_) => bail!("Timed out after {wait:?} connecting to the server"),
    }
}

async fn send(options: IpcOptions, pattern: String, data: &str) -> Result<()> {
    let payload = parse_payload(data)?;
    let service = build_module(options, None, None)?.service()?;
    connect(&service, Duration::from_secs(5)).await?;

    service.dispatch_event(pattern, payload).await;
    service.close().await?;
    Ok(())
}

async fn request(
    options: IpcOptions,
    pattern: String,
    data: &str,
    timeout: Duration,
) -> Result<()> {
    let payload = parse_payload(data)?;
    let service = build_module(options, None, Some(timeout))?.service()?;
    connect(&service, timeout).await?;

    let result = service.request(pattern, payload).await;
    service.close().await?;

    let response = result?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let loaded = resolve_options(args.config, args.id)?;
    let options = loaded.options;

    let result = match args.command {
        Command::Serve { hook_timeout_ms } => {
            info!("PID: {}", std::process::id());
            serve(options, hook_timeout_ms.map(Duration::from_millis)).await
        }
        Command::Send { pattern, data } => send(options, pattern, &data).await,
        Command::Request {
            pattern,
            data,
            timeout_ms,
        } => request(options, pattern, &data, Duration::from_millis(timeout_ms)).await,
    };

    if let Err(ref e) = result {
        error!(error = %e, "Relay daemon stopped with error");
    }
    result
}
