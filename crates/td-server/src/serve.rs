//! Server lifecycle: bind, publish the port, heartbeat, graceful shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use td_core::config::Config;
use td_core::portfile::PortFile;
use td_store::Store;
use td_sync::EventLog;

use crate::http_api::{api_router, ApiState};

/// How long in-flight requests get to drain after a shutdown signal.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("bind {addr}: {source}")]
    Bind { addr: String, source: std::io::Error },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("server: {0}")]
    Server(String),
}

#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub host: String,
    /// 0 = OS-assigned; the bound port is published to the serve-port file.
    pub port: u16,
    pub project_dir: PathBuf,
    pub project_id: String,
    pub auth_token: Option<String>,
    pub cors_origin: Option<String>,
    pub heartbeat: Duration,
}

impl ServeOptions {
    pub fn from_config(project_dir: PathBuf, project_id: impl Into<String>, config: &Config) -> Self {
        Self {
            host: config.server.host.clone(),
            port: config.server.port,
            project_dir,
            project_id: project_id.into(),
            auth_token: config.server.auth_token.clone().or_else(|| {
                std::env::var("TD_AUTH_KEY").ok().filter(|v| !v.trim().is_empty())
            }),
            cors_origin: config.server.cors_origin.clone(),
            heartbeat: Duration::from_secs(config.server.heartbeat_secs),
        }
    }
}

/// Run the server until SIGINT/SIGTERM, then drain within the deadline.
///
/// The bound port (possibly OS-assigned) is published to
/// `.todos/serve-port`; the file is removed on the way out.
pub async fn run(
    store: Arc<Store>,
    event_log: Arc<EventLog>,
    config: &Config,
    opts: ServeOptions,
) -> Result<(), ServeError> {
    let state = Arc::new(
        ApiState::new(store, event_log, opts.project_id.clone()).with_config(config),
    );
    let router = api_router(state.clone(), opts.auth_token.clone(), opts.cors_origin.clone());

    let addr = format!("{}:{}", opts.host, opts.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| ServeError::Bind { addr: addr.clone(), source })?;
    let bound = listener.local_addr()?;

    let port_file = PortFile::new(bound.port());
    port_file.write(&opts.project_dir)?;
    tracing::info!(%bound, project = %opts.project_id, "server listening");

    // Session heartbeat: periodic liveness breadcrumb while serving.
    let heartbeat_state = state.clone();
    let heartbeat_every = opts.heartbeat;
    let heartbeat = tokio::spawn(async move {
        let mut tick = tokio::time::interval(heartbeat_every);
        tick.tick().await; // skip the immediate first tick
        loop {
            tick.tick().await;
            match heartbeat_state.event_log.max_seq(&heartbeat_state.project_id).await {
                Ok(seq) => tracing::debug!(last_seq = seq, "heartbeat"),
                Err(e) => tracing::debug!(error = %e, "heartbeat probe failed"),
            }
        }
    });

    // Signal -> graceful shutdown, capped by the drain deadline.
    let (notify_tx, notify_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!(deadline_secs = SHUTDOWN_DEADLINE.as_secs(), "shutdown requested");
        let _ = notify_tx.send(true);
    });

    let mut graceful_rx = notify_rx.clone();
    let serve_future = axum::serve(listener, router).with_graceful_shutdown(async move {
        let _ = graceful_rx.changed().await;
    });

    let mut deadline_rx = notify_rx;
    let deadline = async move {
        let _ = deadline_rx.changed().await;
        tokio::time::sleep(SHUTDOWN_DEADLINE).await;
    };

    let result = tokio::select! {
        served = serve_future => served.map_err(|e| ServeError::Server(e.to_string())),
        _ = deadline => {
            tracing::warn!(secs = SHUTDOWN_DEADLINE.as_secs(), "drain deadline exceeded, aborting");
            Ok(())
        }
    };

    heartbeat.abort();
    PortFile::remove(&opts.project_dir);
    tracing::info!("server stopped");
    result
}

/// Resolves when SIGINT or SIGTERM arrives, whichever first. In-flight
/// requests then get [`SHUTDOWN_DEADLINE`] to finish before the process is
/// expected to exit.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
