//! Tallysync DB - PostgreSQL record store for synchronized Tally data.
//!
//! # Overview
//!
//! [`PgRecordStore`] implements [`tallysync_core::store::RecordStore`]:
//!
//! - canonical records live in `tally_records`, unique on the identity key
//!   `(entity_kind, company, fiscal_year, natural_key)`
//! - each finished run is logged to `sync_runs`
//!
//! The schema ships in `migrations/` and is applied by
//! [`PgRecordStore::migrate`].

pub mod store;

pub use store::{PgRecordStore, RunRecord};
