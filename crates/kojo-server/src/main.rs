//! kojo-server: session host for mobile-driven terminal sessions.
//!
//! Owns a set of named sessions, each an interactive CLI tool running in
//! a tmux session on this workstation. Network surfaces attach to the
//! manager through the `session` module; this binary wires configuration,
//! logging and graceful shutdown.

use clap::Parser;
use kojo_server::config::ServerConfig;
use kojo_server::session;
use std::path::PathBuf;
use tracing::{debug, error, info};

/// kojo-server: terminal session host
#[derive(Parser, Debug)]
#[command(name = "kojo-server", version, about = "Terminal session host")]
struct Cli {
    /// Config file path
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting kojo-server");

    let config = match ServerConfig::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    for (name, tool) in session::tool_availability() {
        debug!(tool = %name, available = tool.available, path = %tool.path, "tool availability");
    }

    // Restores persisted sessions and reattaches live tmux sessions.
    let manager = session::Manager::new(&config).await;

    // Notify once per session exit; push delivery hangs off this hook.
    manager.set_on_session_exit(|sess| {
        let info = sess.info();
        info!(
            id = %info.id,
            tool = %info.tool,
            exit_code = ?info.exit_code,
            "session exited, notifying observers"
        );
    });

    shutdown_signal().await;
    info!("received shutdown signal");

    // Detach tmux-backed sessions (they survive the restart), stop the
    // rest, and persist final state.
    manager.stop_all().await;
    manager.save_all().await;

    info!("kojo-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
