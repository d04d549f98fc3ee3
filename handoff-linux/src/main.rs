// Handoff Linux host: TCP transport, JSON task store and outbox-driven transfers.

mod config;
mod outbox;
mod store;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use handoff_core::{EngineEvent, LocalPeer, TransferEngine};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("handoff-linux {}", VERSION);
                return Ok(());
            }
            "--config" | "-c" => {
                config_path = Some(args.next().context("--config needs a path")?.into());
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load(config_path.as_deref())?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let local = LocalPeer::new(cfg.peer_id.clone(), cfg.name.clone());
    info!(peer = %local.id, name = %local.name, version = VERSION, "starting");

    let store = store::JsonTaskStore::open(&cfg.state_file)
        .await
        .with_context(|| format!("opening task store {}", cfg.state_file.display()))?;
    let transport = transport::TcpTransport::new(local.id.clone(), cfg.peer_addrs());
    let engine = TransferEngine::start(
        local,
        cfg.transfer.clone(),
        Arc::new(transport.clone()),
        Arc::new(cfg.directory()),
        Arc::new(store),
    )
    .await?;
    transport.attach(engine.clone());

    let port = cfg.listen_port;
    tokio::spawn(async move {
        if let Err(e) = transport.listen(port).await {
            warn!(port, error = %e, "transport listener stopped");
        }
    });
    tokio::spawn(outbox::run(
        engine.clone(),
        cfg.outbox.clone(),
        cfg.peer_ids(),
        cfg.encrypt,
    ));
    tokio::spawn(log_approvals(engine.clone()));

    shutdown_signal().await?;
    info!("shutting down");
    engine.shutdown().await?;
    Ok(())
}

/// There is no UI to answer approvals; they are logged and lapse into a timeout rejection.
async fn log_approvals(engine: TransferEngine) {
    let mut events = engine.subscribe();
    loop {
        match events.recv().await {
            Ok(EngineEvent::ApprovalRequested(request)) => info!(
                peer = %request.from_id,
                request = %request.request_id,
                files = request.files.len(),
                total = request.total_size,
                "approval requested; mark the peer trusted to accept automatically"
            ),
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
