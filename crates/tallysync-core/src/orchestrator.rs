//! Sync orchestrator: drives one [`SyncRun`] from fetch to summary.
//!
//! Entity kinds are processed one after another, masters before vouchers.
//! A kind that cannot be fetched is reported and skipped. Configuration
//! errors fail the whole run, whether found before the first fetch or
//! returned by the source.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{Days, Local, NaiveDate, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::AppError;
use crate::models::{EntityKind, FiscalYear, SourceBatch};
use crate::parse::{self, parse_date, NormalizeContext};
use crate::reconcile::{ConflictPolicy, Reconciler};
use crate::source::{TallyRequest, TallySource};
use crate::store::RecordStore;
use crate::sync::{BatchSyncSummary, RunState, SyncRun, SyncRunSummary, SyncScope, Trigger};

/// How the voucher date range of a run is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMode {
    /// The last `scheduled_voucher_days` days up to today.
    Scheduled,
    /// An operator-supplied range, clamped to `max_days`.
    Manual {
        from: NaiveDate,
        to: NaiveDate,
        max_days: Option<u32>,
    },
}

/// Input of [`SyncOrchestrator::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub company: String,
    /// Kinds to sync; empty means all of them.
    pub kinds: Vec<EntityKind>,
    pub mode: SyncMode,
    pub policy: ConflictPolicy,
}

impl SyncRequest {
    pub fn scheduled(company: impl Into<String>, kinds: Vec<EntityKind>) -> Self {
        Self {
            company: company.into(),
            kinds,
            mode: SyncMode::Scheduled,
            policy: ConflictPolicy::default(),
        }
    }

    /// A voucher-only manual run.
    pub fn manual(company: impl Into<String>, from: NaiveDate, to: NaiveDate) -> Self {
        Self {
            company: company.into(),
            kinds: vec![EntityKind::Voucher],
            mode: SyncMode::Manual {
                from,
                to,
                max_days: None,
            },
            policy: ConflictPolicy::default(),
        }
    }

    /// Builds a manual run from operator date strings such as `20240401`.
    pub fn manual_from_tokens(
        company: impl Into<String>,
        from: &str,
        to: &str,
        max_days: Option<u32>,
    ) -> Result<Self, AppError> {
        let parse = |raw: &str| {
            parse_date(raw)
                .ok_or_else(|| AppError::ConfigurationError(format!("invalid date '{}'", raw)))
        };
        let mut request = Self::manual(company, parse(from)?, parse(to)?);
        request = request.with_max_days(max_days);
        Ok(request)
    }

    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_kinds(mut self, kinds: Vec<EntityKind>) -> Self {
        self.kinds = kinds;
        self
    }

    pub fn with_max_days(mut self, limit: Option<u32>) -> Self {
        if let SyncMode::Manual { max_days, .. } = &mut self.mode {
            *max_days = limit;
        }
        self
    }
}

/// Per-company exclusive locks, keyed by the company name as written to the
/// identity key.
#[derive(Default)]
struct RunLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RunLocks {
    fn get(&self, company: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(company.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// Runs the fetch → normalize → reconcile pipeline for one company at a time.
pub struct SyncOrchestrator {
    source: Arc<dyn TallySource>,
    store: Arc<dyn RecordStore>,
    config: SyncConfig,
    locks: RunLocks,
    cancel: CancellationToken,
}

impl SyncOrchestrator {
    pub fn new(source: Arc<dyn TallySource>, store: Arc<dyn RecordStore>, config: SyncConfig) -> Self {
        Self {
            source,
            store,
            config,
            locks: RunLocks::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Uses `token` for cooperative cancellation instead of a private one.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Runs `request` with today's local date as the scheduling anchor.
    pub async fn run(&self, request: SyncRequest) -> SyncRunSummary {
        self.run_at(request, Local::now().date_naive()).await
    }

    /// Runs each request in turn.
    pub async fn run_many(&self, requests: Vec<SyncRequest>) -> BatchSyncSummary {
        let mut batch = BatchSyncSummary::new();
        for request in requests {
            batch.add(self.run(request).await);
        }
        batch
    }

    /// Runs `request` as if today were `today`.
    pub async fn run_at(&self, request: SyncRequest, today: NaiveDate) -> SyncRunSummary {
        let scope = match self.resolve_scope(&request, today) {
            Ok(scope) => scope,
            Err(e) => return self.reject(&request, today, e).await,
        };

        let lock = self.locks.get(&scope.company);
        let _guard = lock.lock_owned().await;

        let mut run = SyncRun::new(scope, self.config.recent_failure_limit);
        info!(
            run_id = %run.run_id,
            company = %run.scope.company,
            from = %run.scope.from,
            to = %run.scope.to,
            "Starting sync run"
        );

        if let Err(e) = self.execute(&mut run, request.policy).await {
            error!(run_id = %run.run_id, state = %run.state(), error = %e, "Sync run aborted");
            if let Err(err) = run.fail(&e) {
                error!(run_id = %run.run_id, error = %err, "Could not fail sync run");
            }
        }
        if !run.state().is_terminal() {
            if let Err(e) = run.finish() {
                error!(run_id = %run.run_id, error = %e, "Could not finish sync run");
            }
        }

        self.complete(run).await
    }

    /// Validates the request and fixes the date range of the run.
    fn resolve_scope(&self, request: &SyncRequest, today: NaiveDate) -> Result<SyncScope, AppError> {
        self.config.validate()?;

        let company = request.company.trim();
        if company.is_empty() {
            return Err(AppError::ConfigurationError("company name is empty".to_string()));
        }

        let mut kinds = if request.kinds.is_empty() {
            EntityKind::ALL.to_vec()
        } else {
            request.kinds.clone()
        };
        kinds.sort_by_key(EntityKind::sync_order);
        kinds.dedup();

        let (from, to, trigger) = match request.mode {
            SyncMode::Scheduled => {
                let back = u64::from(self.config.scheduled_voucher_days.saturating_sub(1));
                let from = today.checked_sub_days(Days::new(back)).unwrap_or(today);
                (from, today, Trigger::Scheduled)
            }
            SyncMode::Manual { from, to, max_days } => {
                if from > to {
                    return Err(AppError::ConfigurationError(format!(
                        "date range starts after it ends ({} > {})",
                        from, to
                    )));
                }
                let max_days = max_days.unwrap_or(self.config.manual_max_days);
                if max_days == 0 {
                    return Err(AppError::ConfigurationError(
                        "max days must be at least 1".to_string(),
                    ));
                }
                let last = from
                    .checked_add_days(Days::new(u64::from(max_days - 1)))
                    .unwrap_or(to);
                let clamped = to.min(last);
                if clamped < to {
                    warn!(
                        company = %company,
                        requested_to = %to,
                        clamped_to = %clamped,
                        max_days,
                        "Manual voucher range exceeds the limit, clamping"
                    );
                }
                (from, clamped, Trigger::Manual)
            }
        };

        Ok(SyncScope {
            company: company.to_string(),
            kinds,
            from,
            to,
            trigger,
        })
    }

    async fn reject(&self, request: &SyncRequest, today: NaiveDate, e: AppError) -> SyncRunSummary {
        let (from, to, trigger) = match request.mode {
            SyncMode::Scheduled => (today, today, Trigger::Scheduled),
            SyncMode::Manual { from, to, .. } => (from, to, Trigger::Manual),
        };
        let scope = SyncScope {
            company: request.company.clone(),
            kinds: request.kinds.clone(),
            from,
            to,
            trigger,
        };
        let mut run = SyncRun::new(scope, self.config.recent_failure_limit);
        if let Err(err) = run.fail(&e) {
            error!(run_id = %run.run_id, error = %err, "Could not fail sync run");
        }
        error!(company = %request.company, error = %e, "Sync run rejected");
        self.complete(run).await
    }

    async fn execute(&self, run: &mut SyncRun, policy: ConflictPolicy) -> Result<(), AppError> {
        let kinds = run.scope.kinds.clone();
        for (index, kind) in kinds.iter().copied().enumerate() {
            if self.cancel.is_cancelled() {
                warn!(run_id = %run.run_id, kind = %kind, "Sync run cancelled");
                for skipped in &kinds[index..] {
                    run.report_mut(*skipped).abandon("cancelled before fetch");
                }
                break;
            }
            for request in self.requests_for(kind, &run.scope) {
                self.sync_request(run, &request, policy).await?;
            }
        }
        Ok(())
    }

    /// One request per kind, or one per date window for vouchers.
    fn requests_for(&self, kind: EntityKind, scope: &SyncScope) -> Vec<TallyRequest> {
        let base = TallyRequest::new(kind);
        let base = if kind.is_company_scoped() {
            base.company(scope.company.clone())
        } else {
            base
        };
        if kind != EntityKind::Voucher {
            return vec![base];
        }
        date_windows(scope.from, scope.to, self.config.voucher_window_days)
            .into_iter()
            .map(|(from, to)| base.clone().range(from, to))
            .collect()
    }

    async fn sync_request(
        &self,
        run: &mut SyncRun,
        request: &TallyRequest,
        policy: ConflictPolicy,
    ) -> Result<(), AppError> {
        let kind = request.kind;
        let label = request.describe();
        run.transition(RunState::Fetching(kind))?;

        let raw = match self.source.fetch(request).await {
            Ok(raw) => raw,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(run_id = %run.run_id, request = %label, error = %e, "Fetch failed");
                run.report_mut(kind).fetch_failed(&label, &e);
                return Ok(());
            }
        };
        debug!(request = %label, bytes = raw.len(), "Fetched response");

        run.transition(RunState::Normalizing(kind))?;
        let anchor = request.to.unwrap_or(run.scope.to);
        let ctx = NormalizeContext {
            company: run.scope.company.clone(),
            fiscal_year: FiscalYear::containing(anchor, self.config.fiscal_year_start_month),
            fiscal_year_start_month: self.config.fiscal_year_start_month,
            source: SourceBatch::new(Uuid::new_v4(), Utc::now()),
        };

        let mut fetched = 0usize;
        let mut xml_error = None;
        let records = parse::records(&raw, kind, ctx)
            .map_while(|item| match item {
                Ok(record) => Some(record),
                Err(e) => {
                    xml_error = Some(e);
                    None
                }
            })
            .inspect(|_| fetched += 1);

        run.transition(RunState::Reconciling(kind))?;
        let reconciler = Reconciler::new(self.store.clone(), &self.config);
        let report = reconciler.reconcile(records, policy).await;

        info!(
            run_id = %run.run_id,
            request = %label,
            fetched,
            inserted = report.inserted,
            updated = report.updated,
            duplicates = report.duplicates_skipped,
            malformed = report.malformed,
            failed = report.failed,
            written = report.written(),
            "Reconciled"
        );

        let kind_report = run.report_mut(kind);
        kind_report.fetched += fetched;
        kind_report.absorb(report);
        if let Some(e) = xml_error {
            warn!(request = %label, error = %e, "Response could not be read to the end");
            kind_report.fetch_failed(&label, &e);
        }
        Ok(())
    }

    async fn complete(&self, run: SyncRun) -> SyncRunSummary {
        let summary = run.summary();
        let elapsed = summary
            .finished_at
            .map(|end| (end - summary.started_at).num_milliseconds())
            .unwrap_or_default();
        info!(
            run_id = %summary.run_id,
            company = %summary.scope.company,
            state = %summary.state,
            fetched = summary.fetched,
            inserted = summary.inserted,
            updated = summary.updated,
            duplicates = summary.duplicates_skipped,
            malformed = summary.malformed,
            failed = summary.failed,
            elapsed_ms = elapsed,
            "Sync run finished"
        );
        if let Err(e) = self.store.record_run(&summary).await {
            warn!(run_id = %summary.run_id, error = %e, "Failed to persist run summary");
        }
        summary
    }
}

/// Splits `[from, to]` into consecutive windows of at most `days` days.
pub fn date_windows(from: NaiveDate, to: NaiveDate, days: u32) -> Vec<(NaiveDate, NaiveDate)> {
    let span = Days::new(u64::from(days.max(1) - 1));
    let mut windows = Vec::new();
    let mut start = from;
    while start <= to {
        let end = start.checked_add_days(span).map_or(to, |end| end.min(to));
        windows.push((start, end));
        match end.succ_opt() {
            Some(next) => start = next,
            None => break,
        }
    }
    windows
}
