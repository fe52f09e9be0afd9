//! Sync run lifecycle and statistics.
//!
//! This module holds the pure state of a sync run: the state machine, the
//! per-kind reports and the serializable summary. It performs no I/O; the
//! [`orchestrator`](crate::orchestrator) drives it.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::EntityKind;
use crate::reconcile::{FailureDetail, ReconcileReport};

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Scheduled,
    Manual,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Scheduled => "scheduled",
            Trigger::Manual => "manual",
        }
    }
}

/// Company, kinds and voucher date range covered by one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncScope {
    pub company: String,
    pub kinds: Vec<EntityKind>,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub trigger: Trigger,
}

/// Lifecycle state of a [`SyncRun`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "kind", rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Fetching(EntityKind),
    Normalizing(EntityKind),
    Reconciling(EntityKind),
    Aggregating,
    Completed,
    PartiallyFailed,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::PartiallyFailed | RunState::Failed
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        match (*self, next) {
            (Idle, Fetching(_)) | (Idle, Aggregating) | (Idle, Failed) => true,
            (Fetching(a), Normalizing(b)) => a == b,
            // a kind whose fetch failed moves straight on
            (Fetching(_), Fetching(_)) | (Fetching(_), Aggregating) => true,
            (Normalizing(a), Reconciling(b)) => a == b,
            (Reconciling(_), Fetching(_)) | (Reconciling(_), Aggregating) => true,
            (Aggregating, Completed) | (Aggregating, PartiallyFailed) => true,
            (Fetching(_), Failed) | (Normalizing(_), Failed) | (Reconciling(_), Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => f.write_str("idle"),
            RunState::Fetching(kind) => write!(f, "fetching({})", kind),
            RunState::Normalizing(kind) => write!(f, "normalizing({})", kind),
            RunState::Reconciling(kind) => write!(f, "reconciling({})", kind),
            RunState::Aggregating => f.write_str("aggregating"),
            RunState::Completed => f.write_str("completed"),
            RunState::PartiallyFailed => f.write_str("partially_failed"),
            RunState::Failed => f.write_str("failed"),
        }
    }
}

/// Statistics for one entity kind within a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityKindReport {
    pub kind: EntityKind,
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub duplicates_skipped: usize,
    pub malformed: usize,
    pub failed: usize,
    pub fetch_errors: usize,
    /// Most recent failures, oldest first.
    pub recent_failures: VecDeque<FailureDetail>,
    /// Set when the kind could not be synced at all.
    pub error: Option<String>,
    #[serde(skip)]
    failure_limit: usize,
}

impl EntityKindReport {
    pub fn new(kind: EntityKind, failure_limit: usize) -> Self {
        Self {
            kind,
            fetched: 0,
            inserted: 0,
            updated: 0,
            duplicates_skipped: 0,
            malformed: 0,
            failed: 0,
            fetch_errors: 0,
            recent_failures: VecDeque::new(),
            error: None,
            failure_limit: failure_limit.max(1),
        }
    }

    fn push_failure(&mut self, detail: FailureDetail) {
        if self.recent_failures.len() == self.failure_limit {
            self.recent_failures.pop_front();
        }
        self.recent_failures.push_back(detail);
    }

    pub fn absorb(&mut self, report: ReconcileReport) {
        self.inserted += report.inserted;
        self.updated += report.updated;
        self.duplicates_skipped += report.duplicates_skipped;
        self.malformed += report.malformed;
        self.failed += report.failed;
        for detail in report.failed_details {
            self.push_failure(detail);
        }
    }

    /// Records a fetch that failed after the client exhausted its retries.
    pub fn fetch_failed(&mut self, request: &str, error: &AppError) {
        self.fetch_errors += 1;
        self.error = Some(error.to_string());
        self.push_failure(FailureDetail::fetch(request, error));
    }

    /// Records a kind that was never attempted.
    pub fn abandon(&mut self, reason: impl Into<String>) {
        self.error = Some(reason.into());
    }

    /// Whether the kind failed outright. Individual write failures only
    /// count towards `failed`.
    pub fn is_failed(&self) -> bool {
        self.error.is_some() || self.fetch_errors > 0
    }
}

/// One execution of the pipeline over a [`SyncScope`].
#[derive(Debug, Clone)]
pub struct SyncRun {
    pub run_id: Uuid,
    pub scope: SyncScope,
    state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub reports: Vec<EntityKindReport>,
    pub error: Option<String>,
    failure_limit: usize,
}

impl SyncRun {
    pub fn new(scope: SyncScope, failure_limit: usize) -> Self {
        let reports = scope
            .kinds
            .iter()
            .map(|kind| EntityKindReport::new(*kind, failure_limit))
            .collect();
        Self {
            run_id: Uuid::new_v4(),
            scope,
            state: RunState::Idle,
            started_at: Utc::now(),
            finished_at: None,
            reports,
            error: None,
            failure_limit,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Moves to `next`, rejecting illegal transitions and terminal mutation.
    pub fn transition(&mut self, next: RunState) -> Result<(), AppError> {
        if !self.state.can_transition_to(next) {
            return Err(AppError::Generic(format!(
                "illegal run transition {} -> {}",
                self.state, next
            )));
        }
        self.state = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn report_mut(&mut self, kind: EntityKind) -> &mut EntityKindReport {
        if let Some(pos) = self.reports.iter().position(|r| r.kind == kind) {
            &mut self.reports[pos]
        } else {
            self.reports.push(EntityKindReport::new(kind, self.failure_limit));
            let last = self.reports.len() - 1;
            &mut self.reports[last]
        }
    }

    /// Aborts the run. Kinds already reconciled keep their counts.
    pub fn fail(&mut self, error: &AppError) -> Result<(), AppError> {
        self.transition(RunState::Failed)?;
        self.error = Some(error.to_string());
        Ok(())
    }

    /// Aggregates the per-kind reports into the terminal state.
    pub fn finish(&mut self) -> Result<RunState, AppError> {
        self.transition(RunState::Aggregating)?;
        let terminal = if self.reports.iter().any(EntityKindReport::is_failed) {
            RunState::PartiallyFailed
        } else {
            RunState::Completed
        };
        self.transition(terminal)?;
        Ok(terminal)
    }

    pub fn summary(&self) -> SyncRunSummary {
        let total = |f: fn(&EntityKindReport) -> usize| -> usize { self.reports.iter().map(f).sum() };
        SyncRunSummary {
            run_id: self.run_id,
            scope: self.scope.clone(),
            state: self.state,
            started_at: self.started_at,
            finished_at: self.finished_at,
            fetched: total(|r| r.fetched),
            inserted: total(|r| r.inserted),
            updated: total(|r| r.updated),
            duplicates_skipped: total(|r| r.duplicates_skipped),
            malformed: total(|r| r.malformed),
            failed: total(|r| r.failed),
            reports: self.reports.clone(),
            error: self.error.clone(),
        }
    }
}

/// Serializable snapshot of a [`SyncRun`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub scope: SyncScope,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub duplicates_skipped: usize,
    pub malformed: usize,
    pub failed: usize,
    pub reports: Vec<EntityKindReport>,
    pub error: Option<String>,
}

impl SyncRunSummary {
    pub fn report(&self, kind: EntityKind) -> Option<&EntityKindReport> {
        self.reports.iter().find(|r| r.kind == kind)
    }

    pub fn is_success(&self) -> bool {
        self.state == RunState::Completed
    }
}

/// Aggregated results of syncing several companies in one pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSyncSummary {
    pub runs: Vec<SyncRunSummary>,
}

impl BatchSyncSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, summary: SyncRunSummary) {
        self.runs.push(summary);
    }

    pub fn successful_count(&self) -> usize {
        self.runs.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.runs.iter().filter(|r| !r.is_success()).count()
    }

    /// Total records written across all runs.
    pub fn total_records(&self) -> usize {
        self.runs
            .iter()
            .map(|r| r.inserted + r.updated + r.duplicates_skipped)
            .sum()
    }

    pub fn total_companies(&self) -> usize {
        self.runs.len()
    }
}
