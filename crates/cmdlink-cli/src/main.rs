//! cmdlink command-line entry point.
//!
//! `cmdlink serve` runs the HTTP trigger, the dispatcher and the poll
//! reconciler. `cmdlink consume` runs the status consumer.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use cmdlink_api::{
    AuthState, ConsumerState, ServerState, create_consumer_router, create_router, serve,
    shutdown_signal,
};
use cmdlink_commands::{
    CommandDispatcher, DedupCache, ItemStoreClient, PollReconciler, StatusConsumer,
};
use cmdlink_core::{STATUS_TOPIC_PATTERN, Settings, env_vars};
use cmdlink_transport::{MqttTransport, Transport};

#[derive(Parser, Debug)]
#[command(name = "cmdlink")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP trigger, dispatcher and poll reconciler.
    Serve {
        /// Host to bind to.
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to bind to. Defaults to PORT.
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run the device status consumer.
    Consume {
        /// Host for the health endpoint.
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Health endpoint port. Defaults to STATUS_HEALTH_PORT.
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::from_env().context("Invalid configuration")?;
    init_logging(args.verbose, settings.log_json);

    match args.command {
        Command::Serve { host, port } => {
            let bind = bind_addr(&host, port.unwrap_or(settings.port))?;
            run_serve(settings, bind).await
        }
        Command::Consume { host, port } => {
            let bind = bind_addr(&host, port.unwrap_or(settings.status_health_port))?;
            run_consume(settings, bind).await
        }
    }
}

fn init_logging(verbose: bool, json_logging: bool) {
    let default_directive = if verbose { "warn,cmdlink=debug" } else { "warn,cmdlink=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .compact()
            .init();
    }
}

fn bind_addr(host: &str, port: u16) -> Result<SocketAddr> {
    format!("{host}:{port}")
        .parse()
        .with_context(|| format!("Invalid bind address {host}:{port}"))
}

async fn run_serve(settings: Settings, bind: SocketAddr) -> Result<()> {
    let transport = Arc::new(MqttTransport::new(settings.broker.clone(), "dispatcher"));
    transport.connect()?;

    let dispatcher = Arc::new(CommandDispatcher::new(transport.clone(), transport.qos()));
    let dedup = Arc::new(DedupCache::from_config(&settings.dedup));
    let cleanup = dedup.spawn_cleanup(settings.dedup.cleanup_interval);

    let reconciler = match &settings.store {
        Some(store) => {
            let client = Arc::new(ItemStoreClient::new(store)?);
            let reconciler = Arc::new(PollReconciler::new(
                client,
                dispatcher.clone(),
                dedup.clone(),
                settings.poll.clone(),
            ));
            reconciler.start();
            Some(reconciler)
        }
        None => {
            warn!(
                "{} not set, poll reconciler disabled (dispatch-only mode)",
                env_vars::STORE_TOKEN
            );
            None
        }
    };

    let auth = AuthState::new(settings.shared_secret.as_deref());
    if !auth.is_enabled() {
        warn!(
            "{} not set, /dispatch accepts unauthenticated requests",
            env_vars::DISPATCH_SHARED_SECRET
        );
    }

    info!(
        broker = %settings.broker.broker_addr(),
        polling = reconciler.is_some(),
        "Starting dispatcher"
    );
    let state = ServerState::new(dispatcher, dedup, reconciler.clone());
    let result = serve(bind, create_router(state, auth), shutdown_signal()).await;

    if let Some(reconciler) = &reconciler {
        reconciler.stop();
    }
    cleanup.abort();
    transport.disconnect().await;
    info!("Dispatcher shutdown complete");
    result
}

async fn run_consume(settings: Settings, bind: SocketAddr) -> Result<()> {
    let store = settings
        .require_store()
        .context("The status consumer needs item store access")?;
    let sink = Arc::new(ItemStoreClient::new(store)?);

    let transport = Arc::new(MqttTransport::new(settings.broker.clone(), "status"));
    transport
        .subscribe(STATUS_TOPIC_PATTERN, Arc::new(StatusConsumer::new(sink)))
        .await?;
    transport.connect()?;

    info!(
        broker = %settings.broker.broker_addr(),
        pattern = STATUS_TOPIC_PATTERN,
        "Starting status consumer"
    );
    let router = create_consumer_router(ConsumerState::new(transport.clone()));
    let result = serve(bind, router, shutdown_signal()).await;

    transport.disconnect().await;
    info!("Status consumer shutdown complete");
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serve() {
        let args = Args::try_parse_from(["cmdlink", "serve", "--port", "8080", "-v"]).unwrap();
        assert!(args.verbose);
        match args.command {
            Command::Serve { host, port } => {
                assert_eq!(host, "0.0.0.0");
                assert_eq!(port, Some(8080));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_consume_defaults() {
        let args = Args::try_parse_from(["cmdlink", "consume"]).unwrap();
        assert!(!args.verbose);
        assert!(matches!(args.command, Command::Consume { port: None, .. }));
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Args::try_parse_from(["cmdlink"]).is_err());
    }

    #[test]
    fn test_bind_addr() {
        assert_eq!(bind_addr("127.0.0.1", 3000).unwrap().port(), 3000);
        assert!(bind_addr("not a host", 3000).is_err());
    }
}
