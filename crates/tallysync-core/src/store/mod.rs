//! Persistent store contract consumed by the reconciliation engine.
//!
//! The store is a document store keyed by [`IdentityKey`]. The reconciler
//! only needs `bulk_write`; the remaining calls serve statistics, operator
//! lookups and run bookkeeping.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{CanonicalRecord, EntityKind, FiscalYear, IdentityKey, SourceBatch};
use crate::reconcile::ConflictPolicy;
use crate::sync::SyncRunSummary;

/// One write in a bulk request. Mirrors the reconciler's conflict policy.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Insert, or leave an existing row alone.
    InsertIfAbsent(CanonicalRecord),
    /// Insert, or replace an existing row whose content differs.
    Replace(CanonicalRecord),
    /// Insert, or replace an existing row with older provenance.
    ReplaceIfNewer(CanonicalRecord),
}

impl WriteOp {
    pub fn new(policy: ConflictPolicy, record: CanonicalRecord) -> Self {
        match policy {
            ConflictPolicy::SkipIfExists => WriteOp::InsertIfAbsent(record),
            ConflictPolicy::OverwriteIfExists => WriteOp::Replace(record),
            ConflictPolicy::UpdateIfNewer => WriteOp::ReplaceIfNewer(record),
        }
    }

    pub fn record(&self) -> &CanonicalRecord {
        match self {
            WriteOp::InsertIfAbsent(r) | WriteOp::Replace(r) | WriteOp::ReplaceIfNewer(r) => r,
        }
    }

    pub fn policy(&self) -> ConflictPolicy {
        match self {
            WriteOp::InsertIfAbsent(_) => ConflictPolicy::SkipIfExists,
            WriteOp::Replace(_) => ConflictPolicy::OverwriteIfExists,
            WriteOp::ReplaceIfNewer(_) => ConflictPolicy::UpdateIfNewer,
        }
    }
}

/// What a single successful write did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    Updated,
    /// The identity key was already stored and the policy kept the old row.
    Duplicate,
}

/// Per-op result of a bulk write, in op order.
pub type WriteResult = Result<WriteOutcome, AppError>;

/// A persisted record as the store returns it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRecord {
    pub identity: IdentityKey,
    pub document: serde_json::Value,
    pub content_hash: String,
    pub malformed: bool,
    pub batch_id: Uuid,
    pub fetched_at: DateTime<Utc>,
    pub alter_id: Option<i64>,
    pub first_seen_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl StoredRecord {
    pub fn from_record(record: &CanonicalRecord, now: DateTime<Utc>) -> Self {
        Self {
            identity: record.identity.clone(),
            document: record.document(),
            content_hash: record.content_hash(),
            malformed: record.is_malformed(),
            batch_id: record.source.batch_id,
            fetched_at: record.source.fetched_at,
            alter_id: record.source.alter_id,
            first_seen_at: now,
            last_updated_at: now,
        }
    }

    pub fn source(&self) -> SourceBatch {
        SourceBatch {
            batch_id: self.batch_id,
            fetched_at: self.fetched_at,
            alter_id: self.alter_id,
        }
    }
}

/// Filter for counting stored records.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub kind: Option<EntityKind>,
    pub company: Option<String>,
    pub fiscal_year: Option<FiscalYear>,
    pub malformed_only: bool,
}

impl RecordFilter {
    pub fn kind(kind: EntityKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn with_company(mut self, company: impl Into<String>) -> Self {
        self.company = Some(company.into());
        self
    }

    pub fn with_fiscal_year(mut self, fiscal_year: FiscalYear) -> Self {
        self.fiscal_year = Some(fiscal_year);
        self
    }

    pub fn malformed(mut self) -> Self {
        self.malformed_only = true;
        self
    }

    pub fn matches(&self, record: &StoredRecord) -> bool {
        self.kind.is_none_or(|k| k == record.identity.kind)
            && self
                .company
                .as_deref()
                .is_none_or(|c| c == record.identity.company)
            && self
                .fiscal_year
                .is_none_or(|fy| fy == record.identity.fiscal_year)
            && (!self.malformed_only || record.malformed)
    }
}

/// Aggregated counts per company and entity kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KindStats {
    pub company: String,
    pub kind: EntityKind,
    pub records: i64,
    pub malformed: i64,
    pub last_update: Option<DateTime<Utc>>,
}

/// Document store used by the sync pipeline.
///
/// Implementations must treat `bulk_write` as unordered: one failing op must
/// not prevent the others from being applied, and each op reports its own
/// result. An `Err` from `bulk_write` itself means nothing is known about the
/// batch; the reconciler then retries the ops one by one.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn find_one(&self, key: &IdentityKey) -> Result<Option<StoredRecord>, AppError>;

    async fn bulk_write(&self, ops: &[WriteOp]) -> Result<Vec<WriteResult>, AppError>;

    async fn count_documents(&self, filter: &RecordFilter) -> Result<u64, AppError>;

    /// Statistics only; never called on the reconciliation path.
    async fn aggregate(&self, company: Option<&str>) -> Result<Vec<KindStats>, AppError>;

    /// Persists the summary of a finished run.
    async fn record_run(&self, summary: &SyncRunSummary) -> Result<(), AppError>;
}
