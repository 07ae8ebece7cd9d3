//! Status transition commands, wired through the workflow engine and the
//! review policy.

use std::path::Path;

use anyhow::{bail, Result};
use chrono::Utc;

use td_core::review::evaluate_approve_eligibility;
use td_core::security_log::SecurityLog;
use td_core::types::{GitEvent, Issue, IssueStatus};
use td_core::workflow::{
    EnforcementMode, Transition, TransitionContext, WorkflowEngine,
};
use td_store::ActionType;

use super::CliContext;

fn engine_for(ctx: &CliContext) -> WorkflowEngine {
    let mode = match ctx.config.review.enforcement.as_str() {
        "strict" => EnforcementMode::Strict,
        "advisory" => EnforcementMode::Advisory,
        _ => EnforcementMode::Liberal,
    };
    WorkflowEngine::new(mode)
}

/// Shared transition driver: validate, run guards, mutate, journal.
async fn transition(
    ctx: &CliContext,
    id: &str,
    to: IssueStatus,
    transition: Transition,
    action: ActionType,
    force: bool,
    mutate: impl FnOnce(&mut Issue),
) -> Result<Issue> {
    let Some(issue) = ctx.store.get_issue(id).await? else {
        bail!("issue not found: {id}");
    };

    let engine = engine_for(ctx);
    let outcome = engine.check(&TransitionContext {
        issue: &issue,
        from: issue.status,
        to,
        transition,
        session_id: ctx.session_id(),
        force,
    })?;
    for advisory in outcome.advisories.iter().filter(|a| !a.passed) {
        eprintln!("advisory ({}): {}", advisory.guard, advisory.message);
    }

    let mut updated = issue;
    updated.status = to;
    mutate(&mut updated);
    let stored = ctx.store.update_issue_logged(&updated, ctx.session_id(), action).await?;
    println!("{} -> {} ({})", stored.id, stored.status, transition);
    ctx.after_mutation().await;
    Ok(stored)
}

pub async fn start(dir: &Path, id: &str, force: bool) -> Result<()> {
    let ctx = CliContext::open(dir).await?;
    let session = ctx.session_id().to_string();
    transition(
        &ctx,
        id,
        IssueStatus::InProgress,
        Transition::Start,
        ActionType::Start,
        force,
        |issue| {
            // First start stamps the implementer; later sessions leave it.
            if issue.implementer_session.as_deref().unwrap_or("").is_empty() {
                issue.implementer_session = Some(session);
            }
        },
    )
    .await?;
    ctx.record_git_snapshot(id, GitEvent::Start).await;
    Ok(())
}

pub async fn block(dir: &Path, id: &str) -> Result<()> {
    let ctx = CliContext::open(dir).await?;
    transition(&ctx, id, IssueStatus::Blocked, Transition::Block, ActionType::Block, false, |_| {})
        .await?;
    Ok(())
}

pub async fn unblock(dir: &Path, id: &str, force: bool) -> Result<()> {
    let ctx = CliContext::open(dir).await?;
    transition(&ctx, id, IssueStatus::Open, Transition::Unblock, ActionType::Unblock, force, |_| {})
        .await?;
    Ok(())
}

pub async fn review(dir: &Path, id: &str) -> Result<()> {
    let ctx = CliContext::open(dir).await?;
    transition(&ctx, id, IssueStatus::InReview, Transition::Review, ActionType::Review, false, |_| {})
        .await?;
    ctx.record_git_snapshot(id, GitEvent::Review).await;
    Ok(())
}

pub async fn reject(dir: &Path, id: &str) -> Result<()> {
    let ctx = CliContext::open(dir).await?;
    transition(
        &ctx,
        id,
        IssueStatus::InProgress,
        Transition::Reject,
        ActionType::Reject,
        false,
        |_| {},
    )
    .await?;
    Ok(())
}

/// Approve a reviewed issue. The review policy decides eligibility; the
/// creator exception demands a reason and is audited to the security log.
pub async fn approve(dir: &Path, id: &str, reason: Option<String>) -> Result<()> {
    let ctx = CliContext::open(dir).await?;
    let Some(issue) = ctx.store.get_issue(id).await? else {
        bail!("issue not found: {id}");
    };

    let session = ctx.session_id().to_string();
    let (involved, impl_involved) = ctx.store.session_involvement(id, &session).await?;
    let eligibility = evaluate_approve_eligibility(
        Some(&issue),
        &session,
        involved,
        impl_involved,
        ctx.config.review.balanced,
    );
    if !eligibility.allowed {
        bail!(
            "approval blocked: {}",
            eligibility.rejection.unwrap_or_else(|| "not permitted".into())
        );
    }
    if eligibility.requires_reason {
        let Some(reason) = reason.as_deref().filter(|r| !r.trim().is_empty()) else {
            bail!("creator-exception approval requires --reason");
        };
        SecurityLog::for_project(&ctx.dir).record_approval_bypass(
            id,
            &session,
            &ctx.session.agent_type,
            reason,
        )?;
    }

    transition(
        &ctx,
        id,
        IssueStatus::Closed,
        Transition::Approve,
        ActionType::Approve,
        false,
        |issue| {
            issue.reviewer_session = Some(session);
            issue.closed_at = Some(Utc::now());
        },
    )
    .await?;
    ctx.record_git_snapshot(id, GitEvent::Close).await;
    Ok(())
}

pub async fn close(dir: &Path, id: &str, force: bool) -> Result<()> {
    let ctx = CliContext::open(dir).await?;
    transition(&ctx, id, IssueStatus::Closed, Transition::Close, ActionType::Close, force, |issue| {
        issue.closed_at = Some(Utc::now());
    })
    .await?;
    ctx.record_git_snapshot(id, GitEvent::Close).await;
    Ok(())
}

pub async fn reopen(dir: &Path, id: &str) -> Result<()> {
    let ctx = CliContext::open(dir).await?;
    transition(&ctx, id, IssueStatus::Open, Transition::Reopen, ActionType::Reopen, false, |issue| {
        issue.closed_at = None;
    })
    .await?;
    Ok(())
}
