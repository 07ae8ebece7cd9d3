//! Review and approval policy.
//!
//! Approval eligibility is a pure function of the issue's session roles and
//! the acting session's involvement. Two policies exist: strict (nobody who
//! touched the issue may approve) and balanced (the creator may approve work
//! implemented by someone else, with a recorded reason).

use serde::{Deserialize, Serialize};

use crate::types::Issue;

// ---------------------------------------------------------------------------
// ApproveEligibility
// ---------------------------------------------------------------------------

/// Result of evaluating whether a session may approve an issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproveEligibility {
    pub allowed: bool,
    /// Approval is allowed only via the balanced-policy creator exception.
    pub creator_exception: bool,
    /// The caller must supply a reason (and a SecurityEvent is recorded).
    pub requires_reason: bool,
    /// Human-readable rejection when `allowed` is false.
    pub rejection: Option<String>,
}

impl ApproveEligibility {
    fn allowed() -> Self {
        Self { allowed: true, creator_exception: false, requires_reason: false, rejection: None }
    }

    fn creator_exception() -> Self {
        Self { allowed: true, creator_exception: true, requires_reason: true, rejection: None }
    }

    fn rejected(message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            creator_exception: false,
            requires_reason: false,
            rejection: Some(message.into()),
        }
    }
}

/// Options carried into listing queries so `reviewable_by` and
/// [`evaluate_approve_eligibility`] enforce the same rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReviewableByOptions {
    pub balanced: bool,
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Decide whether `session` may approve `issue`.
///
/// `was_involved` is true when the session has any recorded activity on the
/// issue; `was_implementation_involved` when that activity includes
/// implementation work. Rules are evaluated strictly in order:
///
/// 1. No issue -> not allowed.
/// 2. Minor issues bypass every check.
/// 3. Strict policy: any involvement (creator, implementer, or recorded
///    activity) rejects.
/// 4. Balanced policy: the implementer can never self-approve; the creator
///    may approve when a different session implemented (reason required);
///    other involvement rejects.
pub fn evaluate_approve_eligibility(
    issue: Option<&Issue>,
    session: &str,
    was_involved: bool,
    was_implementation_involved: bool,
    balanced: bool,
) -> ApproveEligibility {
    let Some(issue) = issue else {
        return ApproveEligibility::rejected("issue not found");
    };

    if issue.minor {
        return ApproveEligibility::allowed();
    }

    let is_creator = !session.is_empty() && issue.creator_session == session;
    let implementer = issue.implementer_session.as_deref().unwrap_or("");
    let is_implementer = !session.is_empty() && implementer == session;

    if !balanced {
        if was_involved || is_creator || is_implementer {
            return ApproveEligibility::rejected(format!(
                "strict policy: session {session} was involved with {} and cannot approve it",
                issue.id
            ));
        }
        return ApproveEligibility::allowed();
    }

    if is_implementer || was_implementation_involved {
        return ApproveEligibility::rejected(format!(
            "session {session} implemented {} and can never self-approve",
            issue.id
        ));
    }

    if is_creator && !implementer.is_empty() && implementer != session {
        return ApproveEligibility::creator_exception();
    }

    if was_involved {
        return ApproveEligibility::rejected(format!(
            "session {session} was involved with {} and cannot approve it",
            issue.id
        ));
    }

    ApproveEligibility::allowed()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Issue;

    fn issue(creator: &str, implementer: Option<&str>, minor: bool) -> Issue {
        let mut issue = Issue::new("td-1", "x", creator);
        issue.implementer_session = implementer.map(String::from);
        issue.minor = minor;
        issue
    }

    #[test]
    fn missing_issue_rejected() {
        let e = evaluate_approve_eligibility(None, "s1", false, false, true);
        assert!(!e.allowed);
    }

    #[test]
    fn minor_bypasses_everything() {
        // Even the implementer may approve a minor issue, under both policies.
        let i = issue("s1", Some("s1"), true);
        for balanced in [false, true] {
            let e = evaluate_approve_eligibility(Some(&i), "s1", true, true, balanced);
            assert!(e.allowed);
            assert!(!e.requires_reason);
        }
    }

    #[test]
    fn strict_rejects_any_involvement() {
        let i = issue("s1", Some("s2"), false);
        assert!(!evaluate_approve_eligibility(Some(&i), "s1", false, false, false).allowed); // creator
        assert!(!evaluate_approve_eligibility(Some(&i), "s2", false, false, false).allowed); // implementer
        assert!(!evaluate_approve_eligibility(Some(&i), "s3", true, false, false).allowed); // involved
        assert!(evaluate_approve_eligibility(Some(&i), "s3", false, false, false).allowed); // outsider
    }

    #[test]
    fn balanced_implementer_hard_block() {
        let i = issue("s1", Some("s2"), false);
        let e = evaluate_approve_eligibility(Some(&i), "s2", false, false, true);
        assert!(!e.allowed);
        // Implementation involvement blocks even a non-implementer session.
        let e = evaluate_approve_eligibility(Some(&i), "s3", true, true, true);
        assert!(!e.allowed);
    }

    #[test]
    fn balanced_creator_exception_requires_reason() {
        let i = issue("s1", Some("s2"), false);
        let e = evaluate_approve_eligibility(Some(&i), "s1", true, false, true);
        assert!(e.allowed);
        assert!(e.creator_exception);
        assert!(e.requires_reason);
    }

    #[test]
    fn balanced_creator_without_implementer_is_just_involved() {
        // No implementer set: the creator exception does not apply, and the
        // creator's involvement rejects.
        let i = issue("s1", None, false);
        let e = evaluate_approve_eligibility(Some(&i), "s1", true, false, true);
        assert!(!e.allowed);
    }

    #[test]
    fn balanced_creator_who_also_implemented_rejected() {
        let i = issue("s1", Some("s1"), false);
        let e = evaluate_approve_eligibility(Some(&i), "s1", true, true, true);
        assert!(!e.allowed);
        assert!(!e.creator_exception);
    }

    #[test]
    fn balanced_uninvolved_outsider_allowed() {
        let i = issue("s1", Some("s2"), false);
        let e = evaluate_approve_eligibility(Some(&i), "s3", false, false, true);
        assert!(e.allowed);
        assert!(!e.creator_exception);
        assert!(!e.requires_reason);
    }

    #[test]
    fn balanced_involved_non_implementer_rejected() {
        let i = issue("s1", Some("s2"), false);
        let e = evaluate_approve_eligibility(Some(&i), "s3", true, false, true);
        assert!(!e.allowed);
    }

    #[test]
    fn empty_session_never_matches_roles() {
        // An empty acting session must not match an empty creator field.
        let mut i = issue("", None, false);
        i.creator_session = String::new();
        let e = evaluate_approve_eligibility(Some(&i), "", false, false, true);
        assert!(e.allowed);
    }

    /// Full truth table over the balanced-policy inputs.
    #[test]
    fn balanced_truth_table() {
        for is_creator in [false, true] {
            for implementer_set in [false, true] {
                for was_involved in [false, true] {
                    for was_impl_involved in [false, true] {
                        let creator = if is_creator { "me" } else { "other" };
                        let implementer = implementer_set.then_some("impl");
                        let i = issue(creator, implementer, false);
                        let e = evaluate_approve_eligibility(
                            Some(&i),
                            "me",
                            was_involved,
                            was_impl_involved,
                            true,
                        );
                        let expected = if was_impl_involved {
                            false
                        } else if is_creator && implementer_set {
                            true // creator exception: implementer is someone else
                        } else {
                            !was_involved
                        };
                        assert_eq!(
                            e.allowed, expected,
                            "creator={is_creator} impl={implementer_set} involved={was_involved} impl_involved={was_impl_involved}"
                        );
                    }
                }
            }
        }
    }
}
