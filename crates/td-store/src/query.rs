//! Structured queries: the filter DSL over issues and the derived
//! dependency-graph queries.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::types::Value as SqlValue;

use td_core::types::{DepKind, Dependency, IssueStatus, IssueType, Priority};

use crate::error::StoreError;

// ---------------------------------------------------------------------------
// DateRange
// ---------------------------------------------------------------------------

/// A half-open `[start, end)` window over a date column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DateRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl DateRange {
    /// Parse the range operators: `after:D`, `before:D`, `D1..`, `..D2`,
    /// `D1..D2`, and bare `D` (which expands to `[D, D+1d)`).
    pub fn parse(input: &str) -> Result<DateRange, StoreError> {
        let input = input.trim();
        if let Some(rest) = input.strip_prefix("after:") {
            return Ok(DateRange { start: Some(parse_day(rest)?), end: None });
        }
        if let Some(rest) = input.strip_prefix("before:") {
            return Ok(DateRange { start: None, end: Some(parse_day(rest)?) });
        }
        if let Some((lhs, rhs)) = input.split_once("..") {
            let start = if lhs.is_empty() { None } else { Some(parse_day(lhs)?) };
            let end = if rhs.is_empty() { None } else { Some(parse_day(rhs)?) };
            if start.is_none() && end.is_none() {
                return Err(StoreError::Invalid(format!("empty date range: {input:?}")));
            }
            return Ok(DateRange { start, end });
        }
        let day = parse_day(input)?;
        Ok(DateRange { start: Some(day), end: Some(day + Duration::days(1)) })
    }
}

fn parse_day(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let midnight = date.and_hms_opt(0, 0, 0).expect("midnight is valid");
        return Ok(DateTime::from_naive_utc_and_offset(midnight, Utc));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StoreError::Invalid(format!("unparseable date: {raw:?}")))
}

// ---------------------------------------------------------------------------
// PointsFilter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointsFilter {
    Exact(i64),
    AtLeast(i64),
    AtMost(i64),
    Range(i64, i64),
}

impl PointsFilter {
    /// Parse `N`, `>=N`, `<=N`, or `N-M`.
    pub fn parse(input: &str) -> Result<PointsFilter, StoreError> {
        let input = input.trim();
        let invalid = || StoreError::Invalid(format!("unparseable points filter: {input:?}"));
        if let Some(rest) = input.strip_prefix(">=") {
            return rest.trim().parse().map(PointsFilter::AtLeast).map_err(|_| invalid());
        }
        if let Some(rest) = input.strip_prefix("<=") {
            return rest.trim().parse().map(PointsFilter::AtMost).map_err(|_| invalid());
        }
        if let Some((lo, hi)) = input.split_once('-') {
            if !lo.is_empty() && !hi.is_empty() {
                let lo: i64 = lo.trim().parse().map_err(|_| invalid())?;
                let hi: i64 = hi.trim().parse().map_err(|_| invalid())?;
                return Ok(PointsFilter::Range(lo, hi));
            }
        }
        input.parse().map(PointsFilter::Exact).map_err(|_| invalid())
    }
}

// ---------------------------------------------------------------------------
// IssueFilter
// ---------------------------------------------------------------------------

/// Structured listing filter. Empty vectors and `None`s match everything.
#[derive(Debug, Clone, Default)]
pub struct IssueFilter {
    pub statuses: Vec<IssueStatus>,
    pub types: Vec<IssueType>,
    pub priority: Option<Priority>,
    /// All listed labels must be present (intersection semantics).
    pub labels: Vec<String>,
    pub implementer: Option<String>,
    pub creator: Option<String>,
    pub reviewer: Option<String>,
    pub parent: Option<String>,
    /// Matched against title, description, log messages, and handoff text.
    pub text: Option<String>,
    pub due: Option<DateRange>,
    pub defer: Option<DateRange>,
    pub points: Option<PointsFilter>,
    pub include_deleted: bool,
}

impl IssueFilter {
    /// Assemble WHERE clauses and positional bindings.
    pub(crate) fn to_sql(&self) -> (Vec<String>, Vec<SqlValue>) {
        let mut clauses = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();
        let mut idx = 0usize;
        let mut next = || {
            idx += 1;
            format!("?{idx}")
        };

        if !self.include_deleted {
            clauses.push("deleted_at IS NULL".to_string());
        }
        if !self.statuses.is_empty() {
            let marks: Vec<String> = self.statuses.iter().map(|_| next()).collect();
            clauses.push(format!("status IN ({})", marks.join(",")));
            params.extend(self.statuses.iter().map(|s| SqlValue::from(s.as_str().to_string())));
        }
        if !self.types.is_empty() {
            let marks: Vec<String> = self.types.iter().map(|_| next()).collect();
            clauses.push(format!("issue_type IN ({})", marks.join(",")));
            params.extend(self.types.iter().map(|t| SqlValue::from(t.as_str().to_string())));
        }
        if let Some(priority) = self.priority {
            clauses.push(format!("priority = {}", next()));
            params.push(SqlValue::from(priority.as_str().to_string()));
        }
        for label in &self.labels {
            // Labels are stored as a JSON array; match the quoted element.
            clauses.push(format!("labels LIKE {}", next()));
            params.push(SqlValue::from(format!("%\"{label}\"%")));
        }
        if let Some(implementer) = &self.implementer {
            clauses.push(format!("implementer_session = {}", next()));
            params.push(SqlValue::from(implementer.clone()));
        }
        if let Some(creator) = &self.creator {
            clauses.push(format!("creator_session = {}", next()));
            params.push(SqlValue::from(creator.clone()));
        }
        if let Some(reviewer) = &self.reviewer {
            clauses.push(format!("reviewer_session = {}", next()));
            params.push(SqlValue::from(reviewer.clone()));
        }
        if let Some(parent) = &self.parent {
            clauses.push(format!("parent_id = {}", next()));
            params.push(SqlValue::from(parent.clone()));
        }
        if let Some(text) = &self.text {
            let needle = format!("%{text}%");
            let (a, b, c, d) = (next(), next(), next(), next());
            clauses.push(format!(
                "(title LIKE {a} OR description LIKE {b}
                  OR EXISTS(SELECT 1 FROM logs WHERE logs.issue_id = issues.id AND logs.message LIKE {c})
                  OR EXISTS(SELECT 1 FROM handoffs WHERE handoffs.issue_id = issues.id
                            AND handoffs.done || handoffs.remaining || handoffs.decisions || handoffs.uncertain LIKE {d}))"
            ));
            for _ in 0..4 {
                params.push(SqlValue::from(needle.clone()));
            }
        }
        if let Some(due) = &self.due {
            if let Some(start) = due.start {
                clauses.push(format!("due_date >= {}", next()));
                params.push(SqlValue::from(start.to_rfc3339()));
            }
            if let Some(end) = due.end {
                clauses.push(format!("due_date < {}", next()));
                params.push(SqlValue::from(end.to_rfc3339()));
            }
        }
        if let Some(defer) = &self.defer {
            if let Some(start) = defer.start {
                clauses.push(format!("defer_until >= {}", next()));
                params.push(SqlValue::from(start.to_rfc3339()));
            }
            if let Some(end) = defer.end {
                clauses.push(format!("defer_until < {}", next()));
                params.push(SqlValue::from(end.to_rfc3339()));
            }
        }
        match self.points {
            Some(PointsFilter::Exact(n)) => {
                clauses.push(format!("points = {}", next()));
                params.push(SqlValue::from(n));
            }
            Some(PointsFilter::AtLeast(n)) => {
                clauses.push(format!("points >= {}", next()));
                params.push(SqlValue::from(n));
            }
            Some(PointsFilter::AtMost(n)) => {
                clauses.push(format!("points <= {}", next()));
                params.push(SqlValue::from(n));
            }
            Some(PointsFilter::Range(lo, hi)) => {
                let (a, b) = (next(), next());
                clauses.push(format!("points >= {a} AND points <= {b}"));
                params.push(SqlValue::from(lo));
                params.push(SqlValue::from(hi));
            }
            None => {}
        }

        (clauses, params)
    }
}

// ---------------------------------------------------------------------------
// Dependency graph queries
// ---------------------------------------------------------------------------

/// Normalize edges to blocker -> blocked adjacency.
fn blocking_adjacency(deps: &[Dependency]) -> HashMap<&str, Vec<&str>> {
    let mut adj: HashMap<&str, Vec<&str>> = HashMap::new();
    for dep in deps {
        let (blocker, blocked) = match dep.kind {
            DepKind::Blocks => (dep.from_issue.as_str(), dep.to_issue.as_str()),
            DepKind::DependsOn => (dep.to_issue.as_str(), dep.from_issue.as_str()),
        };
        adj.entry(blocker).or_default().push(blocked);
    }
    adj
}

/// All issues transitively blocked by `root`, via DFS with a visited set.
/// Cycles terminate; `root` itself is not included.
pub fn transitive_blocked(deps: &[Dependency], root: &str) -> Vec<String> {
    let adj = blocking_adjacency(deps);
    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack: Vec<&str> = vec![root];
    let mut out = Vec::new();
    while let Some(node) = stack.pop() {
        if let Some(next) = adj.get(node) {
            for blocked in next {
                if visited.insert(blocked) {
                    out.push(blocked.to_string());
                    stack.push(blocked);
                }
            }
        }
    }
    out.retain(|id| id.as_str() != root);
    out.sort();
    out
}

/// Issues ranked by how many others they transitively block, descending.
/// Ties break by id for stable output.
pub fn critical_path(deps: &[Dependency]) -> Vec<(String, usize)> {
    let mut roots: Vec<&str> = Vec::new();
    let mut seen = HashSet::new();
    for dep in deps {
        for id in [dep.from_issue.as_str(), dep.to_issue.as_str()] {
            if seen.insert(id) {
                roots.push(id);
            }
        }
    }
    let mut ranked: Vec<(String, usize)> = roots
        .into_iter()
        .map(|id| (id.to_string(), transitive_blocked(deps, id).len()))
        .filter(|(_, count)| *count > 0)
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
