//! Reconciliation of canonical records against a [`RecordStore`].
//!
//! Records are pulled lazily from the normalizer, grouped into batches and
//! written with bounded concurrency. Every record is accounted for in the
//! [`ReconcileReport`]; flagged records count as malformed on top of their
//! write outcome.

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::error::AppError;
use crate::models::{CanonicalRecord, IdentityKey};
use crate::store::{RecordStore, StoredRecord, WriteOp, WriteOutcome, WriteResult};

/// Upper bound on failure details carried by one report.
pub const MAX_FAILURE_DETAILS: usize = 1000;

/// How an incoming record is applied when its identity key is already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    SkipIfExists,
    OverwriteIfExists,
    /// Replace only when the incoming provenance is newer.
    UpdateIfNewer,
}

impl std::str::FromStr for ConflictPolicy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "skip" | "skip_if_exists" => Ok(ConflictPolicy::SkipIfExists),
            "overwrite" | "overwrite_if_exists" => Ok(ConflictPolicy::OverwriteIfExists),
            "newer" | "update_if_newer" => Ok(ConflictPolicy::UpdateIfNewer),
            other => Err(AppError::ConfigurationError(format!(
                "unknown conflict policy '{}'",
                other
            ))),
        }
    }
}

/// Result of conflict resolution for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictDecision {
    /// Whether the incoming record replaces what is stored
    pub write: bool,
    pub outcome: WriteOutcome,
    /// Human-readable reason for the decision
    pub reason: &'static str,
}

/// Decides what a write of `incoming` does given the stored row, if any.
///
/// Stores that cannot express the policy in a single statement call this
/// under their own lock; [`MemoryStore`](crate::store::MemoryStore) does.
pub fn resolve_conflict(
    policy: ConflictPolicy,
    existing: Option<&StoredRecord>,
    incoming: &StoredRecord,
) -> ConflictDecision {
    let Some(existing) = existing else {
        return ConflictDecision {
            write: true,
            outcome: WriteOutcome::Inserted,
            reason: "new record",
        };
    };

    let unchanged = existing.content_hash == incoming.content_hash;
    match policy {
        ConflictPolicy::SkipIfExists => ConflictDecision {
            write: false,
            outcome: WriteOutcome::Duplicate,
            reason: "identity key exists",
        },
        ConflictPolicy::OverwriteIfExists if unchanged => ConflictDecision {
            write: false,
            outcome: WriteOutcome::Duplicate,
            reason: "content hash matches",
        },
        ConflictPolicy::OverwriteIfExists => ConflictDecision {
            write: true,
            outcome: WriteOutcome::Updated,
            reason: "content hash changed",
        },
        ConflictPolicy::UpdateIfNewer => {
            let newer = incoming
                .source()
                .is_newer_than(existing.fetched_at, existing.alter_id);
            if newer && !unchanged {
                ConflictDecision {
                    write: true,
                    outcome: WriteOutcome::Updated,
                    reason: "incoming record is newer",
                }
            } else if newer {
                ConflictDecision {
                    write: false,
                    outcome: WriteOutcome::Duplicate,
                    reason: "content hash matches",
                }
            } else {
                ConflictDecision {
                    write: false,
                    outcome: WriteOutcome::Duplicate,
                    reason: "stored record is newer",
                }
            }
        }
    }
}

/// Category of a [`FailureDetail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Malformed,
    WriteFailure,
    Fetch,
}

/// One record (or request) that did not make it through cleanly.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureDetail {
    /// `None` when the record had no usable identity.
    pub identity: Option<String>,
    pub kind: FailureKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

impl FailureDetail {
    pub fn malformed(record: &CanonicalRecord) -> Self {
        let message = record
            .malformed
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Self {
            identity: record
                .is_persistable()
                .then(|| record.identity.to_string()),
            kind: FailureKind::Malformed,
            message,
            raw: record.raw.clone(),
        }
    }

    pub fn write(key: &IdentityKey, error: &AppError, raw: Option<String>) -> Self {
        Self {
            identity: Some(key.to_string()),
            kind: FailureKind::WriteFailure,
            message: error.to_string(),
            raw,
        }
    }

    pub fn fetch(request: impl Into<String>, error: &AppError) -> Self {
        Self {
            identity: None,
            kind: FailureKind::Fetch,
            message: format!("{}: {}", request.into(), error),
            raw: None,
        }
    }
}

/// Outcome counters of one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub inserted: usize,
    pub updated: usize,
    pub duplicates_skipped: usize,
    pub failed: usize,
    /// Records carrying at least one malformed flag, written or not.
    pub malformed: usize,
    pub failed_details: Vec<FailureDetail>,
}

impl ReconcileReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Inserted => self.inserted += 1,
            WriteOutcome::Updated => self.updated += 1,
            WriteOutcome::Duplicate => self.duplicates_skipped += 1,
        }
    }

    pub fn push_detail(&mut self, detail: FailureDetail) {
        if self.failed_details.len() < MAX_FAILURE_DETAILS {
            self.failed_details.push(detail);
        }
    }

    pub fn merge(&mut self, other: ReconcileReport) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.duplicates_skipped += other.duplicates_skipped;
        self.failed += other.failed;
        self.malformed += other.malformed;
        for detail in other.failed_details {
            self.push_detail(detail);
        }
    }

    /// Records that reached the store successfully.
    pub fn written(&self) -> usize {
        self.inserted + self.updated + self.duplicates_skipped
    }
}

/// Lazily groups a record iterator into write batches.
///
/// Records without identity and repeats of an identity key already seen in
/// this stream never reach a batch; they are counted into `report` here.
struct Batches<I> {
    records: I,
    policy: ConflictPolicy,
    batch_size: usize,
    seen: HashSet<IdentityKey>,
    report: ReconcileReport,
}

impl<I: Iterator<Item = CanonicalRecord>> Iterator for Batches<I> {
    type Item = Vec<WriteOp>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut batch = Vec::with_capacity(self.batch_size);
        for record in self.records.by_ref() {
            if record.is_malformed() {
                self.report.malformed += 1;
                self.report.push_detail(FailureDetail::malformed(&record));
            }
            if !record.is_persistable() {
                continue;
            }
            if !self.seen.insert(record.identity.clone()) {
                debug!(key = %record.identity, "Repeated identity key in stream");
                self.report.duplicates_skipped += 1;
                continue;
            }
            batch.push(WriteOp::new(self.policy, record));
            if batch.len() >= self.batch_size {
                break;
            }
        }
        (!batch.is_empty()).then_some(batch)
    }
}

/// Writes canonical records to a store with bounded concurrency.
pub struct Reconciler {
    store: Arc<dyn RecordStore>,
    batch_size: usize,
    max_in_flight: usize,
}

impl Reconciler {
    pub fn new(store: Arc<dyn RecordStore>, config: &SyncConfig) -> Self {
        Self::with_limits(store, config.batch_size, config.in_flight())
    }

    pub fn with_limits(store: Arc<dyn RecordStore>, batch_size: usize, max_in_flight: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            max_in_flight: max_in_flight.clamp(1, 4),
        }
    }

    /// Reconciles every record of `records` under `policy`.
    ///
    /// Never fails as a whole: store errors end up in the report.
    pub async fn reconcile<I>(&self, records: I, policy: ConflictPolicy) -> ReconcileReport
    where
        I: IntoIterator<Item = CanonicalRecord>,
    {
        let mut batches = Batches {
            records: records.into_iter(),
            policy,
            batch_size: self.batch_size,
            seen: HashSet::new(),
            report: ReconcileReport::new(),
        };

        let written = stream::iter(&mut batches)
            .map(|batch| self.write_batch(batch))
            .buffer_unordered(self.max_in_flight)
            .fold(ReconcileReport::new(), |mut acc, report| async move {
                acc.merge(report);
                acc
            })
            .await;

        let mut report = batches.report;
        report.merge(written);
        report
    }

    async fn write_batch(&self, ops: Vec<WriteOp>) -> ReconcileReport {
        debug!(ops = ops.len(), "Writing batch");
        match self.store.bulk_write(&ops).await {
            Ok(results) if results.len() == ops.len() => tally(&ops, results),
            Ok(results) => {
                warn!(
                    expected = ops.len(),
                    got = results.len(),
                    "Bulk write returned a short result list, retrying per record"
                );
                self.write_each(&ops).await
            }
            Err(e) => {
                warn!(error = %e, ops = ops.len(), "Bulk write failed, retrying per record");
                self.write_each(&ops).await
            }
        }
    }

    async fn write_each(&self, ops: &[WriteOp]) -> ReconcileReport {
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            let result = match self.store.bulk_write(std::slice::from_ref(op)).await {
                Ok(mut single) if single.len() == 1 => single.remove(0),
                Ok(_) => Err(AppError::Generic("store returned no result".to_string())),
                Err(e) => Err(e),
            };
            results.push(result);
        }
        tally(ops, results)
    }
}

fn tally(ops: &[WriteOp], results: Vec<WriteResult>) -> ReconcileReport {
    let mut report = ReconcileReport::new();
    for (op, result) in ops.iter().zip(results) {
        match result {
            Ok(outcome) => report.record(outcome),
            Err(e) => {
                let record = op.record();
                warn!(key = %record.identity, error = %e, "Record write failed");
                report.failed += 1;
                report.push_detail(FailureDetail::write(&record.identity, &e, record.raw.clone()));
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityKind, FieldValue, FiscalYear, MalformedReason, SourceBatch};
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone, Utc};
    use uuid::Uuid;

    fn ledger(name: &str) -> CanonicalRecord {
        let key = IdentityKey::new(EntityKind::Ledger, "Acme", FiscalYear(2024), name);
        let mut record = CanonicalRecord::new(key, SourceBatch::new(Uuid::new_v4(), Utc::now()));
        record.set("parent", FieldValue::Text("Sundry Debtors".to_string()));
        record
    }

    fn stored(hash: &str, alter_id: Option<i64>, offset_secs: i64) -> StoredRecord {
        let at = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap() + Duration::seconds(offset_secs);
        let mut record = StoredRecord::from_record(&ledger("Cash"), at);
        record.content_hash = hash.to_string();
        record.fetched_at = at;
        record.alter_id = alter_id;
        record
    }

    #[test]
    fn test_resolve_new_record() {
        let decision = resolve_conflict(ConflictPolicy::SkipIfExists, None, &stored("a", None, 0));
        assert!(decision.write);
        assert_eq!(decision.outcome, WriteOutcome::Inserted);
        assert_eq!(decision.reason, "new record");
    }

    #[test]
    fn test_resolve_skip_if_exists() {
        let existing = stored("a", None, 0);
        let decision = resolve_conflict(ConflictPolicy::SkipIfExists, Some(&existing), &stored("b", None, 10));
        assert!(!decision.write);
        assert_eq!(decision.outcome, WriteOutcome::Duplicate);
    }

    #[test]
    fn test_resolve_overwrite_compares_hash() {
        let existing = stored("a", None, 0);
        let same = resolve_conflict(ConflictPolicy::OverwriteIfExists, Some(&existing), &stored("a", None, 10));
        let changed = resolve_conflict(ConflictPolicy::OverwriteIfExists, Some(&existing), &stored("b", None, 10));
        assert_eq!(same.outcome, WriteOutcome::Duplicate);
        assert_eq!(changed.outcome, WriteOutcome::Updated);
        assert!(changed.write);
    }

    #[test]
    fn test_resolve_update_if_newer() {
        let existing = stored("a", Some(5), 0);
        let older_alter = resolve_conflict(ConflictPolicy::UpdateIfNewer, Some(&existing), &stored("b", Some(4), 60));
        let newer_alter = resolve_conflict(ConflictPolicy::UpdateIfNewer, Some(&existing), &stored("b", Some(6), -60));
        let later_fetch = resolve_conflict(ConflictPolicy::UpdateIfNewer, Some(&existing), &stored("b", None, 60));

        assert_eq!(older_alter.reason, "stored record is newer");
        assert!(newer_alter.write);
        assert_eq!(later_fetch.outcome, WriteOutcome::Updated);
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("skip".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::SkipIfExists);
        assert_eq!(
            "update-if-newer".parse::<ConflictPolicy>().unwrap(),
            ConflictPolicy::UpdateIfNewer
        );
        assert!("merge".parse::<ConflictPolicy>().is_err());
    }

    #[test]
    fn test_report_merge_caps_details() {
        let mut report = ReconcileReport::new();
        let mut other = ReconcileReport::new();
        other.failed = MAX_FAILURE_DETAILS + 5;
        other.failed_details = (0..MAX_FAILURE_DETAILS + 5)
            .map(|i| FailureDetail {
                identity: Some(i.to_string()),
                kind: FailureKind::WriteFailure,
                message: "boom".to_string(),
                raw: None,
            })
            .collect();
        report.merge(other);
        assert_eq!(report.failed, MAX_FAILURE_DETAILS + 5);
        assert_eq!(report.failed_details.len(), MAX_FAILURE_DETAILS);
    }

    #[tokio::test]
    async fn test_reconcile_batches_and_counts() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::with_limits(store.clone(), 2, 3);
        let records: Vec<_> = (0..5).map(|i| ledger(&format!("Party {}", i))).collect();

        let report = reconciler.reconcile(records, ConflictPolicy::SkipIfExists).await;

        assert_eq!(report.inserted, 5);
        assert_eq!(report.written(), 5);
        assert_eq!(store.len(), 5);
        assert_eq!(store.bulk_calls(), 3);
    }

    #[tokio::test]
    async fn test_repeated_key_in_stream_is_duplicate() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::with_limits(store.clone(), 1, 4);

        let report = reconciler
            .reconcile(vec![ledger("Cash"), ledger("Cash")], ConflictPolicy::OverwriteIfExists)
            .await;

        assert_eq!(report.inserted, 1);
        assert_eq!(report.duplicates_skipped, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_identity_is_not_written() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::with_limits(store.clone(), 10, 1);
        let mut nameless = ledger("");
        nameless.flag(MalformedReason::MissingIdentity {
            field: "NAME".to_string(),
        });
        nameless.raw = Some("<LEDGER></LEDGER>".to_string());

        let report = reconciler
            .reconcile(vec![ledger("Cash"), nameless], ConflictPolicy::SkipIfExists)
            .await;

        assert_eq!(report.inserted, 1);
        assert_eq!(report.malformed, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.failed_details.len(), 1);
        assert_eq!(report.failed_details[0].identity, None);
        assert_eq!(report.failed_details[0].raw.as_deref(), Some("<LEDGER></LEDGER>"));
    }

    #[tokio::test]
    async fn test_bulk_failure_falls_back_to_single_writes() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_bulk_writes(1);
        let reconciler = Reconciler::with_limits(store.clone(), 10, 1);

        let report = reconciler
            .reconcile(vec![ledger("Cash"), ledger("Bank")], ConflictPolicy::SkipIfExists)
            .await;

        assert_eq!(report.inserted, 2);
        assert_eq!(report.failed, 0);
        // one failed bulk call plus one call per record
        assert_eq!(store.bulk_calls(), 3);
    }
}
