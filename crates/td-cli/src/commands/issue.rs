//! Issue lifecycle commands: init, create, list, show, delete, undo,
//! reviewable, status.

use std::path::Path;

use anyhow::{bail, Result};

use td_core::review::ReviewableByOptions;
use td_core::types::{Issue, IssueStatus, IssueType, Priority};
use td_store::{DateRange, IssueFilter, PointsFilter};

use super::CliContext;

pub struct CreateArgs {
    pub title: String,
    pub issue_type: String,
    pub priority: String,
    pub description: Option<String>,
    pub labels: Vec<String>,
    pub points: Option<i64>,
    pub parent: Option<String>,
    pub due: Option<String>,
    pub minor: bool,
}

pub struct ListArgs {
    pub status: Option<String>,
    pub issue_type: Option<String>,
    pub labels: Vec<String>,
    pub text: Option<String>,
    pub points: Option<String>,
    pub due: Option<String>,
    pub defer: Option<String>,
    pub deleted: bool,
}

pub async fn init(dir: &Path) -> Result<()> {
    let ctx = CliContext::initialize(dir).await?;
    println!("initialized td project in {}", ctx.dir.join(td_core::DATA_DIR).display());
    println!("session: {}", ctx.session_id());
    Ok(())
}

pub async fn create(dir: &Path, args: CreateArgs, json: bool) -> Result<()> {
    let ctx = CliContext::open(dir).await?;

    let Some(issue_type) = IssueType::parse(&args.issue_type) else {
        bail!("unknown issue type: {}", args.issue_type);
    };
    let Some(priority) = Priority::parse(&args.priority) else {
        bail!("unknown priority: {}", args.priority);
    };

    let id = ctx.store.next_issue_id().await?;
    let mut issue = Issue::new(id, args.title, ctx.session_id());
    issue.issue_type = issue_type;
    issue.priority = priority;
    issue.description = args.description;
    issue.points = args.points.unwrap_or(0);
    issue.parent_id = args.parent;
    issue.minor = args.minor;
    issue.created_branch = Some(super::current_branch(dir));
    for label in args.labels {
        issue.add_label(label);
    }
    if let Some(due) = &args.due {
        let range = DateRange::parse(due)?;
        issue.due_date = range.start.or(range.end);
    }

    ctx.store.create_issue_logged(&issue, ctx.session_id()).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&issue)?);
    } else {
        println!("created {} [{}] {}", issue.id, issue.priority.as_str(), issue.title);
    }
    ctx.after_mutation().await;
    Ok(())
}

pub async fn list(dir: &Path, args: ListArgs, json: bool) -> Result<()> {
    let ctx = CliContext::open(dir).await?;

    let mut filter = IssueFilter {
        labels: args.labels,
        text: args.text,
        include_deleted: args.deleted,
        ..Default::default()
    };
    if let Some(raw) = &args.status {
        for part in raw.split(',') {
            match IssueStatus::parse(part.trim()) {
                Some(status) => filter.statuses.push(status),
                None => bail!("unknown status: {part}"),
            }
        }
    }
    if let Some(raw) = &args.issue_type {
        for part in raw.split(',') {
            match IssueType::parse(part.trim()) {
                Some(t) => filter.types.push(t),
                None => bail!("unknown issue type: {part}"),
            }
        }
    }
    if let Some(points) = &args.points {
        filter.points = Some(PointsFilter::parse(points)?);
    }
    if let Some(due) = &args.due {
        filter.due = Some(DateRange::parse(due)?);
    }
    if let Some(defer) = &args.defer {
        filter.defer = Some(DateRange::parse(defer)?);
    }

    let issues = ctx.store.list_issues(&filter).await?;
    print_issues(&issues, json)?;
    Ok(())
}

pub async fn show(dir: &Path, id: &str, json: bool) -> Result<()> {
    let ctx = CliContext::open(dir).await?;
    let Some(issue) = ctx.store.get_issue(id).await? else {
        bail!("issue not found: {id}");
    };
    let logs = ctx.store.list_logs(Some(id)).await?;
    let handoff = ctx.store.latest_handoff(id).await?;
    let files = ctx.store.list_issue_files(id).await?;
    let comments = ctx.store.list_comments(id).await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "issue": issue,
                "logs": logs,
                "comments": comments,
                "handoff": handoff,
                "files": files,
            }))?
        );
        return Ok(());
    }

    println!("{} [{}] {} ({})", issue.id, issue.priority.as_str(), issue.title, issue.status);
    if let Some(description) = &issue.description {
        println!("  {description}");
    }
    if !issue.labels.is_empty() {
        println!("  labels: {}", issue.labels.join(", "));
    }
    println!("  creator: {}", issue.creator_session);
    if let Some(implementer) = &issue.implementer_session {
        println!("  implementer: {implementer}");
    }
    if let Some(reviewer) = &issue.reviewer_session {
        println!("  reviewer: {reviewer}");
    }
    for log in &logs {
        println!("  [{}] {} — {}", log.log_type.as_str(), log.timestamp.format("%Y-%m-%d %H:%M"), log.message);
    }
    for comment in &comments {
        println!("  comment ({}): {}", comment.session_id, comment.text);
    }
    if let Some(handoff) = &handoff {
        println!("  handoff from {}:", handoff.session_id);
        for item in &handoff.done {
            println!("    done: {item}");
        }
        for item in &handoff.remaining {
            println!("    remaining: {item}");
        }
        for item in &handoff.decisions {
            println!("    decision: {item}");
        }
        for item in &handoff.uncertain {
            println!("    uncertain: {item}");
        }
    }
    for file in &files {
        println!("  file: {} ({:?})", file.file_path, file.role);
    }
    Ok(())
}

pub async fn delete(dir: &Path, id: &str, hard: bool) -> Result<()> {
    let ctx = CliContext::open(dir).await?;
    if hard {
        ctx.store.delete_issue_logged(id, ctx.session_id()).await?;
        println!("deleted {id}");
    } else {
        ctx.store.soft_delete_issue_logged(id, ctx.session_id()).await?;
        println!("soft-deleted {id} (recoverable; replicates as a tombstone)");
    }
    ctx.after_mutation().await;
    Ok(())
}

pub async fn undo(dir: &Path) -> Result<()> {
    let ctx = CliContext::open(dir).await?;
    let Some(last) = ctx.store.last_action(ctx.session_id()).await? else {
        bail!("nothing to undo for session {}", ctx.session_id());
    };
    ctx.store.undo_action(&last).await?;
    println!(
        "undid {} on {} {} (action #{})",
        last.action_type.as_str(),
        last.entity_type,
        last.entity_id,
        last.rowid
    );
    Ok(())
}

/// Defer an issue: push `defer_until` out and count the deferral.
pub async fn defer(dir: &Path, id: &str, until: &str) -> Result<()> {
    let ctx = CliContext::open(dir).await?;
    let Some(issue) = ctx.store.get_issue(id).await? else {
        bail!("issue not found: {id}");
    };
    let range = DateRange::parse(until)?;
    let Some(until_at) = range.start.or(range.end) else {
        bail!("defer needs a concrete date");
    };

    let mut updated = issue;
    updated.defer_until = Some(until_at);
    updated.defer_count += 1;
    let stored = ctx
        .store
        .update_issue_logged(&updated, ctx.session_id(), td_store::ActionType::Update)
        .await?;
    println!(
        "{} deferred until {} (deferral #{})",
        stored.id,
        until_at.format("%Y-%m-%d"),
        stored.defer_count
    );
    ctx.after_mutation().await;
    Ok(())
}

pub async fn reviewable(dir: &Path, strict: bool, json: bool) -> Result<()> {
    let ctx = CliContext::open(dir).await?;
    let opts = ReviewableByOptions { balanced: !strict };
    let issues = ctx.store.reviewable_by(ctx.session_id(), opts).await?;
    if issues.is_empty() && !json {
        println!("nothing awaiting your review");
        return Ok(());
    }
    print_issues(&issues, json)?;
    Ok(())
}

pub async fn status(dir: &Path, json: bool) -> Result<()> {
    let ctx = CliContext::open(dir).await?;
    let counts = ctx.store.status_counts().await?;
    let server = td_core::portfile::PortFile::read_valid(dir);
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "counts": counts,
                "server": server,
            }))?
        );
        return Ok(());
    }
    println!("project: {}", ctx.project_id());
    println!("session: {}", ctx.session_id());
    println!(
        "open {}  in_progress {}  blocked {}  in_review {}  closed {}  (total {})",
        counts.open, counts.in_progress, counts.blocked, counts.in_review, counts.closed, counts.total
    );
    match server {
        Some(server) => println!("server: {} (pid {})", server.base_url(), server.pid),
        None => println!("server: not running"),
    }
    Ok(())
}

fn print_issues(issues: &[Issue], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(issues)?);
        return Ok(());
    }
    for issue in issues {
        let labels = if issue.labels.is_empty() {
            String::new()
        } else {
            format!("  [{}]", issue.labels.join(","))
        };
        println!(
            "{:<8} {:<12} {:<3} {}{}",
            issue.id,
            issue.status.to_string(),
            issue.priority.as_str(),
            issue.title,
            labels
        );
    }
    Ok(())
}
