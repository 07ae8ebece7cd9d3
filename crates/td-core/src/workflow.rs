use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{Issue, IssueStatus};

// ---------------------------------------------------------------------------
// Transition
// ---------------------------------------------------------------------------

/// Named workflow transitions. The name is what lands in logs and the
/// action_log; the status pair is what the state machine validates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Start,
    Block,
    Unblock,
    Review,
    Approve,
    Reject,
    Close,
    Reopen,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Start => "start",
            Transition::Block => "block",
            Transition::Unblock => "unblock",
            Transition::Review => "review",
            Transition::Approve => "approve",
            Transition::Reject => "reject",
            Transition::Close => "close",
            Transition::Reopen => "reopen",
        }
    }

    /// Approval-shaped transitions are the ones the review policy gates.
    pub fn is_approval(&self) -> bool {
        matches!(self, Transition::Approve | Transition::Close)
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Returns `true` iff `(from, to)` is in the workflow transition set.
pub fn is_valid_transition(from: IssueStatus, to: IssueStatus) -> bool {
    from.can_transition_to(&to)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// An invalid status transition was attempted.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: IssueStatus, to: IssueStatus },
    /// A guard rejected the transition in strict mode.
    #[error("transition blocked by {guard}: {message}")]
    GuardFailed { guard: &'static str, message: String },
}

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

/// Everything a guard can see about the transition under evaluation.
#[derive(Debug, Clone)]
pub struct TransitionContext<'a> {
    pub issue: &'a Issue,
    pub from: IssueStatus,
    pub to: IssueStatus,
    pub transition: Transition,
    pub session_id: &'a str,
    pub force: bool,
}

/// Outcome of a single guard evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuardResult {
    pub guard: &'static str,
    pub passed: bool,
    pub message: String,
}

impl GuardResult {
    fn pass(guard: &'static str) -> Self {
        Self { guard, passed: true, message: String::new() }
    }

    fn fail(guard: &'static str, message: impl Into<String>) -> Self {
        Self { guard, passed: false, message: message.into() }
    }
}

/// A named predicate over a [`TransitionContext`].
pub trait Guard: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, ctx: &TransitionContext<'_>) -> GuardResult;
}

/// Fails when leaving `blocked` without `--force`.
pub struct BlockedGuard;

impl Guard for BlockedGuard {
    fn name(&self) -> &'static str {
        "blocked_guard"
    }

    fn check(&self, ctx: &TransitionContext<'_>) -> GuardResult {
        if ctx.from == IssueStatus::Blocked && !ctx.force {
            GuardResult::fail(
                self.name(),
                format!("issue {} is blocked; use force to override", ctx.issue.id),
            )
        } else {
            GuardResult::pass(self.name())
        }
    }
}

/// Fails approve/close transitions when the acting session implemented the
/// issue, unless the issue is flagged minor.
pub struct DifferentReviewerGuard;

impl Guard for DifferentReviewerGuard {
    fn name(&self) -> &'static str {
        "different_reviewer_guard"
    }

    fn check(&self, ctx: &TransitionContext<'_>) -> GuardResult {
        if !ctx.transition.is_approval() || ctx.issue.minor {
            return GuardResult::pass(self.name());
        }
        let is_implementer = ctx
            .issue
            .implementer_session
            .as_deref()
            .is_some_and(|s| !s.is_empty() && s == ctx.session_id);
        if is_implementer {
            GuardResult::fail(
                self.name(),
                format!(
                    "session {} implemented {} and cannot approve it",
                    ctx.session_id, ctx.issue.id
                ),
            )
        } else {
            GuardResult::pass(self.name())
        }
    }
}

// ---------------------------------------------------------------------------
// Enforcement
// ---------------------------------------------------------------------------

/// How guard failures are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMode {
    /// Guards are bypassed entirely.
    #[default]
    Liberal,
    /// Guards run and their results are surfaced, but never block.
    Advisory,
    /// The first failing guard aborts the transition.
    Strict,
}

/// Result of a checked transition: the new status plus any advisory guard
/// output.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub to: IssueStatus,
    pub advisories: Vec<GuardResult>,
}

/// The workflow engine: a transition table plus a guard stack.
pub struct WorkflowEngine {
    guards: Vec<Box<dyn Guard>>,
    mode: EnforcementMode,
}

impl WorkflowEngine {
    /// Engine with the standard guard set.
    pub fn new(mode: EnforcementMode) -> Self {
        Self {
            guards: vec![Box::new(BlockedGuard), Box::new(DifferentReviewerGuard)],
            mode,
        }
    }

    /// Engine with a caller-supplied guard stack.
    pub fn with_guards(mode: EnforcementMode, guards: Vec<Box<dyn Guard>>) -> Self {
        Self { guards, mode }
    }

    pub fn mode(&self) -> EnforcementMode {
        self.mode
    }

    /// Validate a transition and run the guard stack per the enforcement
    /// mode. Invalid `(from, to)` pairs fail regardless of mode.
    pub fn check(
        &self,
        ctx: &TransitionContext<'_>,
    ) -> Result<TransitionOutcome, WorkflowError> {
        if !is_valid_transition(ctx.from, ctx.to) {
            return Err(WorkflowError::InvalidTransition { from: ctx.from, to: ctx.to });
        }

        let mut advisories = Vec::new();
        if self.mode != EnforcementMode::Liberal {
            for guard in &self.guards {
                let result = guard.check(ctx);
                if !result.passed {
                    tracing::debug!(
                        guard = result.guard,
                        issue = %ctx.issue.id,
                        transition = %ctx.transition,
                        "guard failed"
                    );
                    if self.mode == EnforcementMode::Strict {
                        return Err(WorkflowError::GuardFailed {
                            guard: result.guard,
                            message: result.message,
                        });
                    }
                }
                advisories.push(result);
            }
        }

        tracing::debug!(
            issue = %ctx.issue.id,
            from = %ctx.from,
            to = %ctx.to,
            transition = %ctx.transition,
            "status transition"
        );
        Ok(TransitionOutcome { to: ctx.to, advisories })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
