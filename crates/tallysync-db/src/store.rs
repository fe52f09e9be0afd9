//! PostgreSQL implementation of [`RecordStore`].
//!
//! A bulk write becomes one multi-row `INSERT ... ON CONFLICT` statement on
//! the identity key index per conflict policy present in the batch. A
//! statement is atomic, so when one fails the whole call errors and the
//! reconciler falls back to writing the batch op by op; a failing single-op
//! call reports the failure against that op.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres, QueryBuilder};
use tallysync_core::config::DbConfig;
use tallysync_core::error::AppError;
use tallysync_core::models::{EntityKind, FiscalYear, IdentityKey};
use tallysync_core::reconcile::ConflictPolicy;
use tallysync_core::store::{
    KindStats, RecordFilter, RecordStore, StoredRecord, WriteOp, WriteOutcome, WriteResult,
};
use tallysync_core::sync::SyncRunSummary;
use tracing::{info, warn};
use uuid::Uuid;

/// Column list for SELECT queries. Must remain a const literal to ensure SQL safety
/// since format!() bypasses sqlx compile-time validation.
const RECORD_COLUMNS: &str = "entity_kind, company, fiscal_year, natural_key, document, content_hash, malformed, batch_id, fetched_at, alter_id, first_seen_at, last_updated_at";

const INSERT_RECORDS: &str = r#"
        INSERT INTO tally_records (
            entity_kind,
            company,
            fiscal_year,
            natural_key,
            document,
            content_hash,
            malformed,
            batch_id,
            fetched_at,
            alter_id
        )
        "#;

/// Bind parameters per inserted row.
const RECORD_BINDS: usize = 10;

/// Rows per statement, under the protocol limit of 65535 bind parameters.
const MAX_ROWS_PER_STATEMENT: usize = u16::MAX as usize / RECORD_BINDS;

const ON_IDENTITY: &str = " ON CONFLICT (entity_kind, company, fiscal_year, natural_key) ";

const REPLACE_COLUMNS: &str = r#"
        DO UPDATE SET
            document = EXCLUDED.document,
            content_hash = EXCLUDED.content_hash,
            malformed = EXCLUDED.malformed,
            batch_id = EXCLUDED.batch_id,
            fetched_at = EXCLUDED.fetched_at,
            alter_id = EXCLUDED.alter_id,
            last_updated_at = NOW()
        WHERE tally_records.content_hash IS DISTINCT FROM EXCLUDED.content_hash
        "#;

const IF_NEWER: &str = r#"
        AND CASE
            WHEN tally_records.alter_id IS NOT NULL
                AND EXCLUDED.alter_id IS NOT NULL
                AND tally_records.alter_id <> EXCLUDED.alter_id
            THEN EXCLUDED.alter_id > tally_records.alter_id
            ELSE EXCLUDED.fetched_at > tally_records.fetched_at
        END
        "#;

// A row comes back only for tuples the statement wrote. `xmax = 0` only
// holds for a freshly inserted tuple.
const RETURNING: &str =
    " RETURNING entity_kind, company, fiscal_year, natural_key, (xmax = 0) AS inserted";

/// Builds one multi-row upsert for ops sharing `policy`.
///
/// Identity keys must be distinct: Postgres refuses to update the same row
/// twice in one statement.
fn upsert_statement<'a>(
    policy: ConflictPolicy,
    ops: impl IntoIterator<Item = &'a WriteOp>,
) -> QueryBuilder<'a, Postgres> {
    let mut builder = QueryBuilder::new(INSERT_RECORDS);
    builder.push_values(ops, |mut row, op| {
        let record = op.record();
        let key = &record.identity;
        row.push_bind(key.kind.as_str())
            .push_bind(&key.company)
            .push_bind(key.fiscal_year.start_year())
            .push_bind(&key.natural_key)
            .push_bind(Json(record.document()))
            .push_bind(record.content_hash())
            .push_bind(record.is_malformed())
            .push_bind(record.source.batch_id)
            .push_bind(record.source.fetched_at)
            .push_bind(record.source.alter_id);
    });
    builder.push(ON_IDENTITY);
    match policy {
        ConflictPolicy::SkipIfExists => {
            builder.push("DO NOTHING");
        }
        ConflictPolicy::OverwriteIfExists => {
            builder.push(REPLACE_COLUMNS);
        }
        ConflictPolicy::UpdateIfNewer => {
            builder.push(REPLACE_COLUMNS).push(IF_NEWER);
        }
    }
    builder.push(RETURNING);
    builder
}

/// Record store backed by PostgreSQL.
///
/// # Examples
///
/// ```no_run
/// use sqlx::postgres::PgPoolOptions;
/// use tallysync_db::PgRecordStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = PgPoolOptions::new()
///     .max_connections(5)
///     .connect("postgresql://localhost/tallysync")
///     .await?;
///
/// let store = PgRecordStore::new(pool);
/// store.migrate().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PgRecordStore {
    pool: Pool<Postgres>,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a connection pool sized from `config`.
    pub async fn connect(database_url: &str, config: &DbConfig) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(database_url)
            .await
            .map_err(AppError::DatabaseError)?;
        Ok(Self::new(pool))
    }

    /// Applies pending schema migrations.
    pub async fn migrate(&self) -> Result<(), AppError> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.into()))?;
        info!("Migrations completed successfully");
        Ok(())
    }

    /// Writes ops sharing `policy` in statements of up to
    /// [`MAX_ROWS_PER_STATEMENT`] rows; `outcomes` is indexed like `ops`.
    async fn write_group(
        &self,
        policy: ConflictPolicy,
        ops: &[(usize, &WriteOp)],
        outcomes: &mut [WriteOutcome],
    ) -> Result<(), sqlx::Error> {
        for chunk in ops.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut statement = upsert_statement(policy, chunk.iter().map(|(_, op)| *op));
            let rows: Vec<UpsertRow> = statement
                .build_query_as::<UpsertRow>()
                .fetch_all(&self.pool)
                .await?;

            let mut written: HashMap<IdentityKey, bool> = HashMap::with_capacity(rows.len());
            for row in rows {
                let inserted = row.inserted;
                match row.identity() {
                    Ok(key) => {
                        written.insert(key, inserted);
                    }
                    Err(e) => warn!(error = %e, "Upsert returned an unreadable identity"),
                }
            }

            for (index, op) in chunk {
                // No row back: the conflict left the stored row untouched.
                outcomes[*index] = match written.get(&op.record().identity) {
                    Some(true) => WriteOutcome::Inserted,
                    Some(false) => WriteOutcome::Updated,
                    None => WriteOutcome::Duplicate,
                };
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn find_one(&self, key: &IdentityKey) -> Result<Option<StoredRecord>, AppError> {
        let query = format!(
            "SELECT {} FROM tally_records WHERE entity_kind = $1 AND company = $2 AND fiscal_year = $3 AND natural_key = $4",
            RECORD_COLUMNS
        );
        let row = sqlx::query_as::<_, RecordRow>(&query)
            .bind(key.kind.as_str())
            .bind(&key.company)
            .bind(key.fiscal_year.start_year())
            .bind(&key.natural_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;

        row.map(RecordRow::into_stored).transpose()
    }

    async fn bulk_write(&self, ops: &[WriteOp]) -> Result<Vec<WriteResult>, AppError> {
        let mut outcomes = vec![WriteOutcome::Duplicate; ops.len()];
        for policy in [
            ConflictPolicy::SkipIfExists,
            ConflictPolicy::OverwriteIfExists,
            ConflictPolicy::UpdateIfNewer,
        ] {
            let group: Vec<(usize, &WriteOp)> = ops
                .iter()
                .enumerate()
                .filter(|(_, op)| op.policy() == policy)
                .collect();
            if group.is_empty() {
                continue;
            }

            if let Err(e) = self.write_group(policy, &group, &mut outcomes).await {
                // A single op's failure belongs to that op; for a larger
                // batch the caller retries op by op.
                if let [op] = ops {
                    return Ok(vec![Err(AppError::WriteFailure {
                        key: op.record().identity.to_string(),
                        message: e.to_string(),
                    })]);
                }
                return Err(AppError::DatabaseError(e));
            }
        }
        Ok(outcomes.into_iter().map(Ok).collect())
    }

    async fn count_documents(&self, filter: &RecordFilter) -> Result<u64, AppError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM tally_records
            WHERE ($1::TEXT IS NULL OR entity_kind = $1)
              AND ($2::TEXT IS NULL OR company = $2)
              AND ($3::INTEGER IS NULL OR fiscal_year = $3)
              AND (NOT $4 OR malformed)
            "#,
        )
        .bind(filter.kind.map(|k| k.as_str()))
        .bind(filter.company.as_deref())
        .bind(filter.fiscal_year.map(|fy| fy.start_year()))
        .bind(filter.malformed_only)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(count.max(0) as u64)
    }

    async fn aggregate(&self, company: Option<&str>) -> Result<Vec<KindStats>, AppError> {
        let rows: Vec<StatsRow> = sqlx::query_as(
            r#"
            SELECT
                company,
                entity_kind,
                COUNT(*) as records,
                COUNT(*) FILTER (WHERE malformed) as malformed,
                MAX(last_updated_at) as last_update
            FROM tally_records
            WHERE ($1::TEXT IS NULL OR company = $1)
            GROUP BY company, entity_kind
            "#,
        )
        .bind(company)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        let mut stats: Vec<KindStats> = rows
            .into_iter()
            .filter_map(|row| match EntityKind::from_str(&row.entity_kind) {
                Ok(kind) => Some(KindStats {
                    company: row.company,
                    kind,
                    records: row.records.unwrap_or(0),
                    malformed: row.malformed.unwrap_or(0),
                    last_update: row.last_update,
                }),
                Err(_) => {
                    warn!(entity_kind = %row.entity_kind, "Skipping unknown entity kind in statistics");
                    None
                }
            })
            .collect();
        stats.sort_by(|a, b| {
            a.company
                .cmp(&b.company)
                .then(a.kind.sync_order().cmp(&b.kind.sync_order()))
        });
        Ok(stats)
    }

    async fn record_run(&self, summary: &SyncRunSummary) -> Result<(), AppError> {
        let document = serde_json::to_value(summary)?;

        sqlx::query(
            r#"
            INSERT INTO sync_runs (
                run_id,
                company,
                trigger,
                state,
                range_from,
                range_to,
                started_at,
                finished_at,
                inserted,
                updated,
                duplicates_skipped,
                malformed,
                failed,
                summary
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (run_id)
            DO UPDATE SET
                state = EXCLUDED.state,
                finished_at = EXCLUDED.finished_at,
                inserted = EXCLUDED.inserted,
                updated = EXCLUDED.updated,
                duplicates_skipped = EXCLUDED.duplicates_skipped,
                malformed = EXCLUDED.malformed,
                failed = EXCLUDED.failed,
                summary = EXCLUDED.summary
            "#,
        )
        .bind(summary.run_id)
        .bind(&summary.scope.company)
        .bind(summary.scope.trigger.as_str())
        .bind(summary.state.to_string())
        .bind(summary.scope.from)
        .bind(summary.scope.to)
        .bind(summary.started_at)
        .bind(summary.finished_at)
        .bind(summary.inserted as i64)
        .bind(summary.updated as i64)
        .bind(summary.duplicates_skipped as i64)
        .bind(summary.malformed as i64)
        .bind(summary.failed as i64)
        .bind(Json(document))
        .execute(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(())
    }
}

impl PgRecordStore {
    /// Most recent runs, newest first.
    pub async fn recent_runs(
        &self,
        company: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RunRecord>, AppError> {
        let runs = sqlx::query_as::<_, RunRecord>(
            r#"
            SELECT run_id, company, trigger, state, range_from, range_to, started_at, finished_at,
                   inserted, updated, duplicates_skipped, malformed, failed
            FROM sync_runs
            WHERE ($1::TEXT IS NULL OR company = $1)
            ORDER BY started_at DESC
            LIMIT $2
            "#,
        )
        .bind(company)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(runs)
    }
}

/// Row of the `sync_runs` table without the full JSON summary.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub company: String,
    pub trigger: String,
    pub state: String,
    pub range_from: NaiveDate,
    pub range_to: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub inserted: i64,
    pub updated: i64,
    pub duplicates_skipped: i64,
    pub malformed: i64,
    pub failed: i64,
}

/// Helper struct for deserializing record rows
#[derive(sqlx::FromRow)]
struct RecordRow {
    entity_kind: String,
    company: String,
    fiscal_year: i32,
    natural_key: String,
    document: Json<serde_json::Value>,
    content_hash: String,
    malformed: bool,
    batch_id: Uuid,
    fetched_at: DateTime<Utc>,
    alter_id: Option<i64>,
    first_seen_at: DateTime<Utc>,
    last_updated_at: DateTime<Utc>,
}

impl RecordRow {
    fn into_stored(self) -> Result<StoredRecord, AppError> {
        let kind = EntityKind::from_str(&self.entity_kind)?;
        Ok(StoredRecord {
            identity: IdentityKey::new(
                kind,
                self.company,
                FiscalYear(self.fiscal_year),
                self.natural_key,
            ),
            document: self.document.0,
            content_hash: self.content_hash,
            malformed: self.malformed,
            batch_id: self.batch_id,
            fetched_at: self.fetched_at,
            alter_id: self.alter_id,
            first_seen_at: self.first_seen_at,
            last_updated_at: self.last_updated_at,
        })
    }
}

/// Helper struct for deserializing upsert results
#[derive(sqlx::FromRow)]
struct UpsertRow {
    entity_kind: String,
    company: String,
    fiscal_year: i32,
    natural_key: String,
    inserted: bool,
}

impl UpsertRow {
    fn identity(self) -> Result<IdentityKey, AppError> {
        Ok(IdentityKey::new(
            EntityKind::from_str(&self.entity_kind)?,
            self.company,
            FiscalYear(self.fiscal_year),
            self.natural_key,
        ))
    }
}

/// Helper struct for deserializing stats query results
#[derive(sqlx::FromRow)]
struct StatsRow {
    company: String,
    entity_kind: String,
    records: Option<i64>,
    malformed: Option<i64>,
    last_update: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tallysync_core::models::{CanonicalRecord, SourceBatch};

    fn row(kind: &str) -> RecordRow {
        let now = Utc::now();
        RecordRow {
            entity_kind: kind.to_string(),
            company: "Acme Traders".to_string(),
            fiscal_year: 2024,
            natural_key: "Sales/42".to_string(),
            document: Json(json!({"voucher_number": "42"})),
            content_hash: "ab".repeat(32),
            malformed: false,
            batch_id: Uuid::new_v4(),
            fetched_at: now,
            alter_id: Some(7),
            first_seen_at: now,
            last_updated_at: now,
        }
    }

    #[test]
    fn test_row_into_stored_record() {
        let stored = row("voucher").into_stored().unwrap();
        assert_eq!(stored.identity.kind, EntityKind::Voucher);
        assert_eq!(stored.identity.fiscal_year, FiscalYear(2024));
        assert_eq!(
            stored.identity.to_string(),
            "voucher|Acme Traders|2024-25|Sales/42"
        );
        assert_eq!(stored.document["voucher_number"], "42");
        assert_eq!(stored.source().alter_id, Some(7));
    }

    #[test]
    fn test_row_with_unknown_kind_is_rejected() {
        assert!(row("budget").into_stored().is_err());
    }

    fn ledger_op(policy: ConflictPolicy, name: &str) -> WriteOp {
        let key = IdentityKey::new(EntityKind::Ledger, "Acme Traders", FiscalYear(2024), name);
        WriteOp::new(policy, CanonicalRecord::new(key, SourceBatch::new(Uuid::new_v4(), Utc::now())))
    }

    #[test]
    fn test_upsert_row_identity() {
        let row = UpsertRow {
            entity_kind: "ledger".to_string(),
            company: "Acme Traders".to_string(),
            fiscal_year: 2024,
            natural_key: "Cash".to_string(),
            inserted: true,
        };
        assert_eq!(
            row.identity().unwrap().to_string(),
            "ledger|Acme Traders|2024-25|Cash"
        );
    }

    #[test]
    fn test_bulk_statement_has_one_row_per_op() {
        let ops = [
            ledger_op(ConflictPolicy::SkipIfExists, "Cash"),
            ledger_op(ConflictPolicy::SkipIfExists, "HDFC Bank"),
            ledger_op(ConflictPolicy::SkipIfExists, "Suspense"),
        ];
        let builder = upsert_statement(ConflictPolicy::SkipIfExists, &ops);
        let sql = builder.sql();

        assert_eq!(sql.matches("INSERT INTO tally_records").count(), 1);
        assert!(sql.contains("$30"));
        assert!(!sql.contains("$31"));
        assert!(sql.contains("ON CONFLICT (entity_kind, company, fiscal_year, natural_key) DO NOTHING"));
        assert!(sql.trim_end().ends_with("(xmax = 0) AS inserted"));
    }

    #[test]
    fn test_statement_per_policy() {
        let ops = [ledger_op(ConflictPolicy::OverwriteIfExists, "Cash")];
        let replace = upsert_statement(ConflictPolicy::OverwriteIfExists, &ops);
        assert!(replace.sql().contains("IS DISTINCT FROM EXCLUDED.content_hash"));
        assert!(!replace.sql().contains("EXCLUDED.alter_id >"));
        assert!(!replace.sql().contains("DO NOTHING"));

        let ops = [ledger_op(ConflictPolicy::UpdateIfNewer, "Cash")];
        let newer = upsert_statement(ConflictPolicy::UpdateIfNewer, &ops);
        assert!(newer.sql().contains("IS DISTINCT FROM EXCLUDED.content_hash"));
        assert!(newer.sql().contains("THEN EXCLUDED.alter_id > tally_records.alter_id"));
        assert!(newer.sql().contains("$10"));
        assert!(!newer.sql().contains("$11"));
    }

    #[test]
    fn test_rows_per_statement_fit_bind_limit() {
        assert!(MAX_ROWS_PER_STATEMENT * RECORD_BINDS <= u16::MAX as usize);
    }
}
