use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use super::{KindStats, RecordFilter, RecordStore, StoredRecord, WriteOp, WriteOutcome, WriteResult};
use crate::error::AppError;
use crate::models::IdentityKey;
use crate::reconcile::resolve_conflict;
use crate::sync::SyncRunSummary;

#[derive(Default)]
struct Inner {
    records: HashMap<IdentityKey, StoredRecord>,
    runs: Vec<SyncRunSummary>,
    failing_keys: HashSet<String>,
    fail_next_bulk: usize,
    bulk_calls: usize,
}

/// In-process [`RecordStore`] used by tests and `--dry-run`.
///
/// Failures can be injected per identity key, or for whole `bulk_write`
/// calls, to exercise the reconciler's error paths.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every later write of `key` fails with a `WriteFailure`.
    pub fn fail_writes_for(&self, key: &IdentityKey) {
        self.lock().failing_keys.insert(key.to_string());
    }

    /// The next `calls` invocations of `bulk_write` fail as a whole.
    pub fn fail_next_bulk_writes(&self, calls: usize) {
        self.lock().fail_next_bulk = calls;
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &IdentityKey) -> Option<StoredRecord> {
        self.lock().records.get(key).cloned()
    }

    pub fn runs(&self) -> Vec<SyncRunSummary> {
        self.lock().runs.clone()
    }

    pub fn bulk_calls(&self) -> usize {
        self.lock().bulk_calls
    }

    fn apply(inner: &mut Inner, op: &WriteOp) -> WriteResult {
        let record = op.record();
        let key = &record.identity;
        if inner.failing_keys.contains(&key.to_string()) {
            return Err(AppError::WriteFailure {
                key: key.to_string(),
                message: "injected write failure".to_string(),
            });
        }

        let now = Utc::now();
        let incoming = StoredRecord::from_record(record, now);
        let decision = resolve_conflict(op.policy(), inner.records.get(key), &incoming);
        if decision.write {
            let first_seen_at = inner
                .records
                .get(key)
                .map(|existing| existing.first_seen_at)
                .unwrap_or(now);
            inner.records.insert(
                key.clone(),
                StoredRecord {
                    first_seen_at,
                    ..incoming
                },
            );
        }
        Ok(decision.outcome)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn find_one(&self, key: &IdentityKey) -> Result<Option<StoredRecord>, AppError> {
        Ok(self.get(key))
    }

    async fn bulk_write(&self, ops: &[WriteOp]) -> Result<Vec<WriteResult>, AppError> {
        let mut inner = self.lock();
        inner.bulk_calls += 1;
        if inner.fail_next_bulk > 0 {
            inner.fail_next_bulk -= 1;
            return Err(AppError::Generic("injected bulk write failure".to_string()));
        }
        Ok(ops.iter().map(|op| Self::apply(&mut inner, op)).collect())
    }

    async fn count_documents(&self, filter: &RecordFilter) -> Result<u64, AppError> {
        let inner = self.lock();
        Ok(inner.records.values().filter(|r| filter.matches(r)).count() as u64)
    }

    async fn aggregate(&self, company: Option<&str>) -> Result<Vec<KindStats>, AppError> {
        let inner = self.lock();
        let mut grouped: BTreeMap<(String, usize), KindStats> = BTreeMap::new();
        for record in inner.records.values() {
            let key = &record.identity;
            if company.is_some_and(|c| c != key.company) {
                continue;
            }
            let entry = grouped
                .entry((key.company.clone(), key.kind.sync_order()))
                .or_insert_with(|| KindStats {
                    company: key.company.clone(),
                    kind: key.kind,
                    records: 0,
                    malformed: 0,
                    last_update: None,
                });
            entry.records += 1;
            if record.malformed {
                entry.malformed += 1;
            }
            entry.last_update = entry.last_update.max(Some(record.last_updated_at));
        }
        Ok(grouped.into_values().collect())
    }

    async fn record_run(&self, summary: &SyncRunSummary) -> Result<(), AppError> {
        self.lock().runs.push(summary.clone());
        Ok(())
    }
}
