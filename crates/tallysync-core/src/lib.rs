//! Tallysync Core - Canonical model, parsing, reconciliation and sync orchestration.

pub mod config;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod parse;
pub mod reconcile;
pub mod source;
pub mod store;
pub mod sync;

pub use config::{
    default_config_path, load_companies_config, CompaniesConfig, CompanyEntry, DbConfig,
    HttpConfig, SyncConfig, TallyConfig,
};
pub use error::AppError;
pub use models::{
    CanonicalRecord, CostAllocation, EntityKind, FieldValue, FiscalYear, IdentityKey, LedgerEntry,
    MalformedReason, SourceBatch,
};
pub use orchestrator::{SyncMode, SyncOrchestrator, SyncRequest};
pub use reconcile::{ConflictPolicy, FailureDetail, FailureKind, ReconcileReport, Reconciler};
pub use source::{TallyRequest, TallySource};
pub use store::{KindStats, MemoryStore, RecordFilter, RecordStore, StoredRecord, WriteOp, WriteOutcome};
pub use sync::{
    BatchSyncSummary, EntityKindReport, RunState, SyncRun, SyncRunSummary, SyncScope, Trigger,
};
