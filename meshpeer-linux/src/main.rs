// meshpeer on Linux: multicast discovery, TCP links and a terminal chat.

mod chat;
mod config;
mod lan;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use meshpeer_core::{Role, SessionManager};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
/// How often pending invites and stale discovery entries are swept.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("meshpeer-linux {}", VERSION);
            return Ok(());
        }
    }

    let cfg = config::load();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log)))
        .with_writer(std::io::stderr)
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    let res = rt.block_on(run(cfg));
    // The stdin reader sits on a blocking thread; do not wait for it.
    rt.shutdown_timeout(Duration::from_millis(100));
    res
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let transport = lan::LanTransport::bind(lan::LanOptions {
        transport_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, cfg.transport_port)),
        discovery_port: cfg.discovery_port,
        invite_timeout: Duration::from_secs(cfg.invite_timeout_secs),
        download_dir: cfg.download_dir(),
    })
    .await
    .with_context(|| format!("binding transport port {}", cfg.transport_port))?;

    let sink = Arc::new(chat::ChatSink::new(cfg.auto_accept));
    let manager = SessionManager::new(cfg.session_config(), transport, sink.clone()).context("invalid session config")?;
    tracing::info!(peer = %manager.local_peer(), service = %cfg.service_type, "session ready");
    manager.start(Role::AllConnections);

    let sweeper = manager.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        loop {
            ticker.tick().await;
            for peer in sweeper.expire_invitations() {
                println!("* invitation to {peer} timed out");
            }
            sweeper.evict_stale_peers();
        }
    });

    tokio::select! {
        res = chat::run(manager.clone(), sink) => res?,
        res = shutdown_signal() => {
            res?;
            manager.stop(Role::AllConnections);
        }
    }
    // Let the goodbye beacon and leave frames go out.
    tokio::time::sleep(Duration::from_millis(200)).await;
    tracing::info!("shut down");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
