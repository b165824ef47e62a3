//! sandbridge - Main entry point.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use sandbridge::{
    bridge::{ClaudeCliFactory, TurnController},
    config::{BridgeConfig, ProxyConfig, SyncConfig},
    proxy::CredentialProxy,
    secrets::store_from_config,
    sync::{HttpUploader, MetricSynchronizer},
};

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Parser, Debug)]
#[command(name = "sandbridge")]
#[command(about = "Sandbox bridge, credential proxy and metric synchronizer")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Relay stdin turns to a persistent Claude session (runs in the sandbox)
    Bridge,

    /// Run the credential-isolating proxy
    Proxy {
        /// Override PROXY_PORT
        #[arg(long)]
        port: Option<u16>,
    },

    /// Poll the metrics volume and upload changed files
    Sync {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs always go to stderr: the bridge's stdout is the protocol channel.
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sandbridge=info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_level(true),
        )
        .init();

    match args.command {
        Command::Bridge => run_bridge().await,
        Command::Proxy { port } => run_proxy(port).await,
        Command::Sync { once } => run_sync(once).await,
    }
}

async fn run_bridge() -> anyhow::Result<()> {
    let config = BridgeConfig::from_env()?;
    tracing::info!(
        model = %config.model,
        workdir = %config.workdir.display(),
        proxied = config.api_base_url.is_some(),
        "Starting bridge"
    );

    let announce = config.announce_ready;
    let factory = Arc::new(ClaudeCliFactory::new(config));
    let mut controller = TurnController::new(factory);

    let mut stdout = tokio::io::stdout();
    if announce {
        controller.announce_ready(&mut stdout).await?;
    }
    controller
        .serve(BufReader::new(tokio::io::stdin()), stdout)
        .await?;
    Ok(())
}

async fn run_proxy(port: Option<u16>) -> anyhow::Result<()> {
    let (mut config, secrets_config) = ProxyConfig::from_env()?;
    if let Some(port) = port {
        config.port = port;
    }

    let store = store_from_config(&secrets_config);
    let secret = store.get(&config.secret_name).await?;
    tracing::info!(secret = %config.secret_name, "Loaded upstream credential");

    CredentialProxy::start(&config, &secret)
        .await
        .map_err(|e| anyhow::anyhow!(e))
}

async fn run_sync(once: bool) -> anyhow::Result<()> {
    let (config, secrets_config) = SyncConfig::from_env()?;

    let store = store_from_config(&secrets_config);
    let token = store.get(&config.token_secret).await?;
    let uploader = Arc::new(HttpUploader::new(
        &config.dashboard_url,
        token,
        UPLOAD_TIMEOUT,
    )?);
    let mut synchronizer = MetricSynchronizer::from_config(&config, uploader);

    if once {
        let report = synchronizer.run_cycle().await?;
        tracing::info!(
            uploaded = report.uploaded.len(),
            failed = report.failed.len(),
            unchanged = report.unchanged,
            no_destination = report.no_destination,
            "Sync cycle finished"
        );
        return Ok(());
    }

    tokio::select! {
        _ = synchronizer.run(config.interval()) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, stopping synchronizer");
        }
    }
    Ok(())
}
