//! Logs, comments, handoffs, dependencies, boards, and work sessions.

use std::path::Path;

use anyhow::{bail, Result};
use chrono::Utc;
use uuid::Uuid;

use td_core::types::{
    Board, Comment, DepKind, Dependency, FileRole, Handoff, IssueFile, LogEntry, LogType,
    WorkSession,
};
use td_store::query;

use super::CliContext;

pub async fn comment(dir: &Path, id: &str, text: &str) -> Result<()> {
    let ctx = CliContext::open(dir).await?;
    if ctx.store.get_issue(id).await?.is_none() {
        bail!("issue not found: {id}");
    }
    let comment = Comment {
        id: Uuid::new_v4().to_string(),
        issue_id: id.to_string(),
        session_id: ctx.session_id().to_string(),
        text: text.to_string(),
        created_at: Utc::now(),
    };
    ctx.store.create_comment_logged(&comment, ctx.session_id()).await?;
    println!("commented on {id}");
    ctx.after_mutation().await;
    Ok(())
}

pub async fn log(dir: &Path, message: &str, issue: Option<&str>, log_type: &str) -> Result<()> {
    let ctx = CliContext::open(dir).await?;
    let Some(log_type) = LogType::parse(log_type) else {
        bail!("unknown log type: {log_type}");
    };
    let mut entry = LogEntry::new(
        Uuid::new_v4().to_string(),
        ctx.session_id(),
        message,
        log_type,
    );
    if let Some(issue_id) = issue {
        if ctx.store.get_issue(issue_id).await?.is_none() {
            bail!("issue not found: {issue_id}");
        }
        entry.issue_id = Some(issue_id.to_string());
    }
    if let Some(active) = ctx.store.active_work_session(ctx.session_id()).await? {
        entry.work_session_id = Some(active.id);
    }
    ctx.store.create_log_logged(&entry, ctx.session_id()).await?;
    println!("logged [{}] {}", entry.log_type.as_str(), entry.message);
    ctx.after_mutation().await;
    Ok(())
}

pub async fn handoff(
    dir: &Path,
    id: &str,
    done: Vec<String>,
    remaining: Vec<String>,
    decisions: Vec<String>,
    uncertain: Vec<String>,
) -> Result<()> {
    let ctx = CliContext::open(dir).await?;
    if ctx.store.get_issue(id).await?.is_none() {
        bail!("issue not found: {id}");
    }
    let mut handoff = Handoff::new(Uuid::new_v4().to_string(), id, ctx.session_id());
    handoff.done = done;
    handoff.remaining = remaining;
    handoff.decisions = decisions;
    handoff.uncertain = uncertain;
    ctx.store.create_handoff_logged(&handoff, ctx.session_id()).await?;
    println!(
        "handoff recorded for {id} ({} done, {} remaining)",
        handoff.done.len(),
        handoff.remaining.len()
    );
    ctx.after_mutation().await;
    Ok(())
}

pub async fn file_link(dir: &Path, id: &str, path: &str, role: &str) -> Result<()> {
    let ctx = CliContext::open(dir).await?;
    let Some(role) = FileRole::parse(role) else {
        bail!("unknown file role: {role} (implementation, test, reference, config)");
    };
    if ctx.store.get_issue(id).await?.is_none() {
        bail!("issue not found: {id}");
    }
    let file = IssueFile {
        issue_id: id.to_string(),
        file_path: path.to_string(),
        role,
        linked_at: Utc::now(),
    };
    ctx.store.link_file_logged(&file, ctx.session_id()).await?;
    println!("linked {path} to {id}");
    ctx.after_mutation().await;
    Ok(())
}

pub async fn link(dir: &Path, from: &str, to: &str, kind: &str) -> Result<()> {
    let ctx = CliContext::open(dir).await?;
    let kind = match kind {
        "blocks" => DepKind::Blocks,
        "depends_on" => DepKind::DependsOn,
        other => bail!("unknown dependency kind: {other} (use blocks or depends_on)"),
    };
    for id in [from, to] {
        if ctx.store.get_issue(id).await?.is_none() {
            bail!("issue not found: {id}");
        }
    }
    let dep = Dependency { from_issue: from.to_string(), to_issue: to.to_string(), kind };
    ctx.store.add_dependency_logged(&dep, ctx.session_id()).await?;
    println!("{from} {} {to}", kind.as_str());
    ctx.after_mutation().await;
    Ok(())
}

pub async fn blocked(dir: &Path, id: &str, json: bool) -> Result<()> {
    let ctx = CliContext::open(dir).await?;
    let deps = ctx.store.list_dependencies().await?;
    let blocked = query::transitive_blocked(&deps, id);
    if json {
        println!("{}", serde_json::to_string_pretty(&blocked)?);
    } else if blocked.is_empty() {
        println!("{id} blocks nothing");
    } else {
        println!("{id} transitively blocks:");
        for issue in blocked {
            println!("  {issue}");
        }
    }
    Ok(())
}

pub async fn critical(dir: &Path, json: bool) -> Result<()> {
    let ctx = CliContext::open(dir).await?;
    let deps = ctx.store.list_dependencies().await?;
    let ranked = query::critical_path(&deps);
    if json {
        println!("{}", serde_json::to_string_pretty(&ranked)?);
    } else if ranked.is_empty() {
        println!("no dependency edges recorded");
    } else {
        for (id, count) in ranked {
            println!("{id}: blocks {count}");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Boards
// ---------------------------------------------------------------------------

pub async fn board_create(dir: &Path, name: &str, query: Option<String>) -> Result<()> {
    let ctx = CliContext::open(dir).await?;
    let board = Board {
        id: Uuid::new_v4().to_string(),
        name: name.to_string(),
        query,
        created_at: Utc::now(),
    };
    ctx.store.create_board_logged(&board, ctx.session_id()).await?;
    println!("created board {} ({})", board.name, board.id);
    ctx.after_mutation().await;
    Ok(())
}

pub async fn board_list(dir: &Path, json: bool) -> Result<()> {
    let ctx = CliContext::open(dir).await?;
    let boards = ctx.store.list_boards().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&boards)?);
    } else {
        for board in boards {
            println!("{}  {}", board.id, board.name);
        }
    }
    Ok(())
}

pub async fn board_add(dir: &Path, board: &str, issue: &str, position: Option<i64>) -> Result<()> {
    let ctx = CliContext::open(dir).await?;
    if ctx.store.get_issue(issue).await?.is_none() {
        bail!("issue not found: {issue}");
    }
    let placed = ctx
        .store
        .set_board_position_logged(board, issue, position, ctx.session_id())
        .await?;
    println!("{} placed on {} at {}", placed.issue_id, placed.board_id, placed.position);
    ctx.after_mutation().await;
    Ok(())
}

pub async fn board_show(dir: &Path, board: &str, json: bool) -> Result<()> {
    let ctx = CliContext::open(dir).await?;
    let positions = ctx.store.board_positions(board).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&positions)?);
        return Ok(());
    }
    for position in positions {
        let title = ctx
            .store
            .get_issue(&position.issue_id)
            .await?
            .map(|i| i.title)
            .unwrap_or_else(|| "(missing)".into());
        println!("{:>10}  {}  {}", position.position, position.issue_id, title);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Work sessions
// ---------------------------------------------------------------------------

pub async fn work_start(dir: &Path, name: &str, sha: Option<String>) -> Result<()> {
    let ctx = CliContext::open(dir).await?;
    if let Some(active) = ctx.store.active_work_session(ctx.session_id()).await? {
        bail!("work session {} ({}) is still active; end it first", active.id, active.name);
    }
    let mut work = WorkSession::new(Uuid::new_v4().to_string(), name, ctx.session_id());
    work.start_sha = sha;
    ctx.store.start_work_session_logged(&work, ctx.session_id()).await?;
    println!("work session {} started ({})", work.name, work.id);
    ctx.after_mutation().await;
    Ok(())
}

pub async fn work_end(dir: &Path, sha: Option<String>) -> Result<()> {
    let ctx = CliContext::open(dir).await?;
    let Some(active) = ctx.store.active_work_session(ctx.session_id()).await? else {
        bail!("no active work session for {}", ctx.session_id());
    };
    let ended = ctx
        .store
        .end_work_session_logged(&active.id, sha, ctx.session_id())
        .await?;
    println!("work session {} ended", ended.name);
    ctx.after_mutation().await;
    Ok(())
}
