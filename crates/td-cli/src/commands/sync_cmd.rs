//! Sync, serve, and the hidden webhook-send child command.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};

use td_core::DATA_DIR;
use td_server::{webhook, ServeOptions};
use td_sync::EventLog;

use super::CliContext;

pub async fn now(dir: &Path) -> Result<()> {
    let ctx = CliContext::open(dir).await?;
    let client = ctx.sync_client().await?;
    let summary = client.sync_once(&ctx.store).await?;
    println!(
        "pushed {}, pulled {}, applied {} (watermark {})",
        summary.pushed, summary.pulled, summary.applied, summary.last_server_seq
    );
    for failure in &summary.failed {
        eprintln!("event {} failed: {}", failure.server_seq, failure.reason);
    }
    Ok(())
}

pub async fn status(dir: &Path, json: bool) -> Result<()> {
    let ctx = CliContext::open(dir).await?;
    let state = ctx.store.sync_state(&ctx.project_id()).await?;
    let pending = ctx.store.pending_actions().await?.len();
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "state": state,
                "pending": pending,
            }))?
        );
        return Ok(());
    }
    println!("project: {}", state.project_id);
    println!("pending actions: {pending}");
    println!("last pushed action: {}", state.last_pushed_action_id);
    println!("last pulled seq: {}", state.last_pulled_server_seq);
    match state.last_sync_at {
        Some(at) => println!("last sync: {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("last sync: never"),
    }
    if state.sync_disabled {
        println!("sync is DISABLED for this project");
    }
    Ok(())
}

pub async fn pull_all(dir: &Path) -> Result<()> {
    let ctx = CliContext::open(dir).await?;
    let client = ctx.sync_client().await?;
    let summary = client.pull_all(&ctx.store).await?;
    println!(
        "replayed {} events, applied {} (watermark {})",
        summary.pulled, summary.applied, summary.last_server_seq
    );
    for failure in &summary.failed {
        eprintln!("event {} failed: {}", failure.server_seq, failure.reason);
    }
    Ok(())
}

pub async fn serve(
    dir: &Path,
    host: Option<String>,
    port: Option<u16>,
    token: Option<String>,
) -> Result<()> {
    let ctx = CliContext::open(dir).await?;
    let config = ctx.config.clone();

    let event_log_path = dir.join(DATA_DIR).join("sync.db");
    let event_log = Arc::new(EventLog::open(&event_log_path).await.context("open event log")?);

    let mut opts = ServeOptions::from_config(dir.to_path_buf(), ctx.project_id(), &config);
    if let Some(host) = host {
        opts.host = host;
    }
    if let Some(port) = port {
        opts.port = port;
    }
    if token.is_some() {
        opts.auth_token = token;
    }

    td_server::run(Arc::new(ctx.store), event_log, &config, opts)
        .await
        .context("server error")?;
    Ok(())
}

/// Child side of the fire-and-forget webhook: POST the payload file, clean
/// up, exit. Failures are logged and swallowed — the parent never waits.
pub async fn webhook_send(file: &str, url: &str, secret: Option<&str>) -> Result<()> {
    if let Err(e) = webhook::send_from_file(Path::new(file), url, secret).await {
        tracing::debug!(error = %e, url, "webhook delivery failed");
    }
    Ok(())
}
