//! End-to-end pipeline scenarios against the in-memory store.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tallysync_core::{
    AppError, CanonicalRecord, ConflictPolicy, EntityKind, FieldValue, FiscalYear, IdentityKey,
    MemoryStore, Reconciler, RecordFilter, RecordStore, RunState, SourceBatch, SyncConfig,
    SyncOrchestrator, SyncRequest, TallyRequest, TallySource,
};
use uuid::Uuid;

const COMPANY: &str = "Acme Traders";

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 4, 10).unwrap()
}

fn voucher_xml(number: &str, amount: &str) -> String {
    format!(
        r#"<VOUCHER VCHTYPE="Sales" ACTION="Create">
  <DATE>20240405</DATE>
  <VOUCHERTYPENAME>Sales</VOUCHERTYPENAME>
  <VOUCHERNUMBER>{number}</VOUCHERNUMBER>
  <PARTYLEDGERNAME>Customer A</PARTYLEDGERNAME>
  <ALLLEDGERENTRIES.LIST><LEDGERNAME>Customer A</LEDGERNAME><ISDEEMEDPOSITIVE>Yes</ISDEEMEDPOSITIVE><AMOUNT>-{amount}</AMOUNT></ALLLEDGERENTRIES.LIST>
  <ALLLEDGERENTRIES.LIST><LEDGERNAME>Sales</LEDGERNAME><ISDEEMEDPOSITIVE>No</ISDEEMEDPOSITIVE><AMOUNT>{amount}</AMOUNT></ALLLEDGERENTRIES.LIST>
</VOUCHER>"#
    )
}

fn day_book(vouchers: &[String]) -> String {
    format!(
        "<ENVELOPE><HEADER><TALLYREQUEST>Import Data</TALLYREQUEST></HEADER><BODY><IMPORTDATA><REQUESTDATA>{}</REQUESTDATA></IMPORTDATA></BODY></ENVELOPE>",
        vouchers
            .iter()
            .map(|v| format!("<TALLYMESSAGE>{}</TALLYMESSAGE>", v))
            .collect::<String>()
    )
}

fn three_vouchers() -> String {
    day_book(&[
        voucher_xml("S-1", "1180.00"),
        voucher_xml("S-2", "500.00"),
        voucher_xml("S-3", "42.50"),
    ])
}

fn groups_xml() -> String {
    r#"<ENVELOPE><BODY><DATA><COLLECTION>
  <GROUP NAME="Sundry Debtors"><PARENT>Current Assets</PARENT></GROUP>
  <GROUP NAME="Sales Accounts"><PARENT/></GROUP>
</COLLECTION></DATA></BODY></ENVELOPE>"#
        .to_string()
}

/// Answers requests from a per-kind script; every call is logged.
#[derive(Default)]
struct ScriptedSource {
    responses: Mutex<HashMap<EntityKind, VecDeque<Result<String, AppError>>>>,
    calls: Mutex<Vec<TallyRequest>>,
}

impl ScriptedSource {
    fn respond(&self, kind: EntityKind, response: Result<String, AppError>) {
        self.responses
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .push_back(response);
    }

    fn calls(&self) -> Vec<TallyRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TallySource for ScriptedSource {
    async fn fetch(&self, request: &TallyRequest) -> Result<String, AppError> {
        self.calls.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .get_mut(&request.kind)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok("<ENVELOPE><BODY><DATA/></BODY></ENVELOPE>".to_string()))
    }
}

/// A [`ScriptedSource`] that takes a while to answer and tracks how many
/// fetches overlap.
#[derive(Default)]
struct SlowSource {
    inner: ScriptedSource,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

#[async_trait]
impl TallySource for SlowSource {
    async fn fetch(&self, request: &TallyRequest) -> Result<String, AppError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let response = self.inner.fetch(request).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        response
    }
}

fn ledgers_xml(names: &[&str]) -> String {
    format!(
        "<ENVELOPE><BODY><DATA><COLLECTION>{}</COLLECTION></DATA></BODY></ENVELOPE>",
        names
            .iter()
            .map(|name| format!(r#"<LEDGER NAME="{}"><PARENT>Sundry Debtors</PARENT></LEDGER>"#, name))
            .collect::<String>()
    )
}

fn orchestrator(source: Arc<ScriptedSource>, store: Arc<MemoryStore>) -> SyncOrchestrator {
    SyncOrchestrator::new(source, store, SyncConfig::default())
}

fn vouchers_only() -> SyncRequest {
    SyncRequest::scheduled(COMPANY, vec![EntityKind::Voucher])
}

#[tokio::test]
async fn test_fresh_sync_inserts_every_voucher() {
    let source = Arc::new(ScriptedSource::default());
    let store = Arc::new(MemoryStore::new());
    source.respond(EntityKind::Voucher, Ok(three_vouchers()));

    let summary = orchestrator(source, store.clone())
        .run_at(vouchers_only(), today())
        .await;

    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(summary.fetched, 3);
    assert_eq!(summary.inserted, 3);
    assert_eq!(summary.duplicates_skipped, 0);
    assert_eq!(summary.malformed, 0);
    assert_eq!(store.len(), 3);
    assert_eq!(store.runs().len(), 1);
}

#[tokio::test]
async fn test_resubmission_is_idempotent() {
    let source = Arc::new(ScriptedSource::default());
    let store = Arc::new(MemoryStore::new());
    source.respond(EntityKind::Voucher, Ok(three_vouchers()));
    source.respond(EntityKind::Voucher, Ok(three_vouchers()));
    let orchestrator = orchestrator(source, store.clone());

    orchestrator.run_at(vouchers_only(), today()).await;
    let second = orchestrator.run_at(vouchers_only(), today()).await;

    assert_eq!(second.state, RunState::Completed);
    assert_eq!(second.inserted, 0);
    assert_eq!(second.duplicates_skipped, 3);
    assert_eq!(store.len(), 3);
}

#[tokio::test]
async fn test_record_without_identity_is_reported_with_raw() {
    let source = Arc::new(ScriptedSource::default());
    let store = Arc::new(MemoryStore::new());
    let nameless = r#"<VOUCHER VCHTYPE="Payment"><DATE>20240405</DATE><NARRATION>lost number</NARRATION></VOUCHER>"#;
    source.respond(
        EntityKind::Voucher,
        Ok(day_book(&[
            voucher_xml("S-1", "10.00"),
            voucher_xml("S-2", "20.00"),
            nameless.to_string(),
            voucher_xml("S-3", "30.00"),
        ])),
    );

    let summary = orchestrator(source, store.clone())
        .run_at(vouchers_only(), today())
        .await;

    assert_eq!(summary.fetched, 4);
    assert_eq!(summary.inserted, 3);
    assert_eq!(summary.malformed, 1);
    assert_eq!(store.len(), 3);

    let report = summary.report(EntityKind::Voucher).unwrap();
    let detail = report
        .recent_failures
        .iter()
        .find(|d| d.identity.is_none())
        .unwrap();
    assert!(detail.message.contains("VOUCHERNUMBER"));
    assert!(detail.raw.as_deref().unwrap().contains("lost number"));
}

#[tokio::test]
async fn test_unbalanced_voucher_is_stored_and_counted() {
    let source = Arc::new(ScriptedSource::default());
    let store = Arc::new(MemoryStore::new());
    let lopsided = voucher_xml("J-1", "100.00").replace("<AMOUNT>100.00</AMOUNT>", "<AMOUNT>90.00</AMOUNT>");
    source.respond(
        EntityKind::Voucher,
        Ok(day_book(&[voucher_xml("S-1", "10.00"), lopsided])),
    );

    let summary = orchestrator(source, store.clone())
        .run_at(vouchers_only(), today())
        .await;

    assert_eq!(summary.inserted, 2);
    assert_eq!(summary.malformed, 1);
    let flagged = store
        .count_documents(&RecordFilter::kind(EntityKind::Voucher).malformed())
        .await
        .unwrap();
    assert_eq!(flagged, 1);
}

#[tokio::test]
async fn test_one_failing_write_does_not_block_the_rest() {
    let store = Arc::new(MemoryStore::new());
    let records: Vec<CanonicalRecord> = (1..=100)
        .map(|i| {
            let key = IdentityKey::new(EntityKind::Ledger, COMPANY, FiscalYear(2024), format!("Party {}", i));
            let mut record = CanonicalRecord::new(key, SourceBatch::new(Uuid::new_v4(), Utc::now()));
            record.set("parent", FieldValue::Text("Sundry Debtors".to_string()));
            record
        })
        .collect();
    store.fail_writes_for(&records[49].identity);

    let report = Reconciler::with_limits(store.clone(), 16, 3)
        .reconcile(records, ConflictPolicy::SkipIfExists)
        .await;

    assert_eq!(report.inserted, 99);
    assert_eq!(report.failed, 1);
    assert_eq!(
        report.failed_details[0].identity.as_deref(),
        Some("ledger|Acme Traders|2024-25|Party 50")
    );
    assert_eq!(store.len(), 99);
}

#[tokio::test]
async fn test_failed_write_is_reported_but_run_completes() {
    let source = Arc::new(ScriptedSource::default());
    let store = Arc::new(MemoryStore::new());
    source.respond(
        EntityKind::Ledger,
        Ok(ledgers_xml(&["Cash", "Suspense", "HDFC Bank"])),
    );
    store.fail_writes_for(&IdentityKey::new(
        EntityKind::Ledger,
        COMPANY,
        FiscalYear(2024),
        "Suspense",
    ));

    let summary = orchestrator(source, store.clone())
        .run_at(SyncRequest::scheduled(COMPANY, vec![EntityKind::Ledger]), today())
        .await;

    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(summary.inserted, 2);
    assert_eq!(summary.failed, 1);
    assert!(summary.error.is_none());
    let ledgers = summary.report(EntityKind::Ledger).unwrap();
    assert_eq!(ledgers.fetch_errors, 0);
    assert_eq!(
        ledgers.recent_failures[0].identity.as_deref(),
        Some("ledger|Acme Traders|2024-25|Suspense")
    );
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn test_configuration_error_from_source_fails_run() {
    let source = Arc::new(ScriptedSource::default());
    let store = Arc::new(MemoryStore::new());
    source.respond(EntityKind::Group, Ok(groups_xml()));
    source.respond(
        EntityKind::Ledger,
        Err(AppError::ConfigurationError("company 'Acme Traders' is not open".to_string())),
    );
    let request = SyncRequest::scheduled(
        COMPANY,
        vec![EntityKind::Group, EntityKind::Ledger, EntityKind::Voucher],
    );

    let summary = orchestrator(source.clone(), store.clone())
        .run_at(request, today())
        .await;

    assert_eq!(summary.state, RunState::Failed);
    assert!(summary.error.as_deref().unwrap().contains("is not open"));
    assert!(summary.finished_at.is_some());
    // groups went in before the ledger fetch; nothing after it was tried
    assert_eq!(summary.inserted, 2);
    let kinds: Vec<_> = source.calls().iter().map(|c| c.kind).collect();
    assert_eq!(kinds, vec![EntityKind::Group, EntityKind::Ledger]);
    assert_eq!(store.runs().len(), 1);
}

#[tokio::test]
async fn test_fetch_failure_marks_kind_and_continues() {
    let source = Arc::new(ScriptedSource::default());
    let store = Arc::new(MemoryStore::new());
    source.respond(
        EntityKind::Group,
        Err(AppError::TransportError("connection refused".to_string())),
    );
    source.respond(EntityKind::Voucher, Ok(three_vouchers()));

    let request = SyncRequest::scheduled(COMPANY, vec![EntityKind::Voucher, EntityKind::Group]);
    let summary = orchestrator(source.clone(), store.clone())
        .run_at(request, today())
        .await;

    assert_eq!(summary.state, RunState::PartiallyFailed);
    let groups = summary.report(EntityKind::Group).unwrap();
    assert_eq!(groups.fetch_errors, 1);
    assert!(groups.error.as_deref().unwrap().contains("connection refused"));
    assert_eq!(summary.report(EntityKind::Voucher).unwrap().inserted, 3);

    // masters are fetched before vouchers whatever order was asked for
    let kinds: Vec<_> = source.calls().iter().map(|c| c.kind).collect();
    assert_eq!(kinds, vec![EntityKind::Group, EntityKind::Voucher]);
}

#[tokio::test]
async fn test_masters_sync() {
    let source = Arc::new(ScriptedSource::default());
    let store = Arc::new(MemoryStore::new());
    source.respond(EntityKind::Group, Ok(groups_xml()));

    let request = SyncRequest::scheduled(COMPANY, vec![EntityKind::Group]);
    let summary = orchestrator(source.clone(), store.clone())
        .run_at(request, today())
        .await;

    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(summary.inserted, 2);
    let key = IdentityKey::new(EntityKind::Group, COMPANY, FiscalYear(2024), "Sundry Debtors");
    let stored = store.find_one(&key).await.unwrap().unwrap();
    assert_eq!(stored.document["fields"]["parent"], "Current Assets");
    assert_eq!(source.calls()[0].company.as_deref(), Some(COMPANY));
}

#[tokio::test]
async fn test_empty_company_fails_run_before_fetch() {
    let source = Arc::new(ScriptedSource::default());
    let store = Arc::new(MemoryStore::new());

    let summary = orchestrator(source.clone(), store.clone())
        .run_at(SyncRequest::scheduled("  ", vec![]), today())
        .await;

    assert_eq!(summary.state, RunState::Failed);
    assert!(summary.error.as_deref().unwrap().contains("company"));
    assert!(source.calls().is_empty());
    assert_eq!(store.runs().len(), 1);
}

#[tokio::test]
async fn test_inverted_manual_range_fails_run() {
    let source = Arc::new(ScriptedSource::default());
    let store = Arc::new(MemoryStore::new());
    let request = SyncRequest::manual_from_tokens(COMPANY, "20240410", "20240401", None).unwrap();

    let summary = orchestrator(source.clone(), store)
        .run_at(request, today())
        .await;

    assert_eq!(summary.state, RunState::Failed);
    assert!(source.calls().is_empty());
}

#[tokio::test]
async fn test_manual_range_is_clamped_and_windowed() {
    let source = Arc::new(ScriptedSource::default());
    let store = Arc::new(MemoryStore::new());
    let request =
        SyncRequest::manual_from_tokens(COMPANY, "20240401", "20240630", Some(10)).unwrap();

    let summary = orchestrator(source.clone(), store)
        .run_at(request, today())
        .await;

    assert_eq!(summary.scope.to, NaiveDate::from_ymd_opt(2024, 4, 10).unwrap());
    let ranges: Vec<_> = source
        .calls()
        .iter()
        .map(|c| (c.from.unwrap().to_string(), c.to.unwrap().to_string()))
        .collect();
    assert_eq!(
        ranges,
        vec![
            ("2024-04-01".to_string(), "2024-04-07".to_string()),
            ("2024-04-08".to_string(), "2024-04-10".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_scheduled_run_covers_yesterday_and_today() {
    let source = Arc::new(ScriptedSource::default());
    let store = Arc::new(MemoryStore::new());

    let summary = orchestrator(source.clone(), store)
        .run_at(vouchers_only(), today())
        .await;

    let yesterday = today().pred_opt().unwrap();
    assert_eq!(summary.scope.from, yesterday);
    assert_eq!(summary.scope.to, today());
    let calls = source.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].from, Some(yesterday));
    assert_eq!(calls[0].to, Some(today()));
}

#[tokio::test]
async fn test_scheduled_window_follows_config() {
    let source = Arc::new(ScriptedSource::default());
    let store = Arc::new(MemoryStore::new());
    let config = SyncConfig {
        scheduled_voucher_days: 1,
        ..SyncConfig::default()
    };

    SyncOrchestrator::new(source.clone(), store, config)
        .run_at(vouchers_only(), today())
        .await;

    let calls = source.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].from, Some(today()));
    assert_eq!(calls[0].to, Some(today()));
}

#[tokio::test]
async fn test_concurrent_runs_for_one_company_are_serialized() {
    let source = Arc::new(SlowSource::default());
    let store = Arc::new(MemoryStore::new());
    source.inner.respond(EntityKind::Voucher, Ok(three_vouchers()));
    source.inner.respond(EntityKind::Voucher, Ok(three_vouchers()));
    let orchestrator = SyncOrchestrator::new(source.clone(), store.clone(), SyncConfig::default());

    let (a, b) = tokio::join!(
        orchestrator.run_at(vouchers_only(), today()),
        orchestrator.run_at(vouchers_only(), today()),
    );

    assert_eq!(source.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(source.inner.calls().len(), 2);
    assert_eq!(a.state, RunState::Completed);
    assert_eq!(b.state, RunState::Completed);
    let mut inserted = vec![(a.inserted, a.duplicates_skipped), (b.inserted, b.duplicates_skipped)];
    inserted.sort();
    assert_eq!(inserted, vec![(0, 3), (3, 0)]);
    assert_eq!(store.len(), 3);
}

#[tokio::test]
async fn test_runs_for_different_companies_overlap() {
    let source = Arc::new(SlowSource::default());
    let store = Arc::new(MemoryStore::new());
    let orchestrator = SyncOrchestrator::new(source.clone(), store, SyncConfig::default());

    tokio::join!(
        orchestrator.run_at(SyncRequest::scheduled("Acme Traders", vec![EntityKind::Group]), today()),
        orchestrator.run_at(SyncRequest::scheduled("Globex", vec![EntityKind::Group]), today()),
    );

    assert_eq!(source.max_active.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_company_name_is_trimmed_for_identity_and_lock() {
    let source = Arc::new(ScriptedSource::default());
    let store = Arc::new(MemoryStore::new());
    source.respond(EntityKind::Voucher, Ok(three_vouchers()));
    source.respond(EntityKind::Voucher, Ok(three_vouchers()));
    source.respond(EntityKind::Voucher, Ok(three_vouchers()));
    let orchestrator = orchestrator(source, store.clone());

    orchestrator.run_at(vouchers_only(), today()).await;
    let padded = orchestrator
        .run_at(
            SyncRequest::scheduled("  Acme Traders ", vec![EntityKind::Voucher]),
            today(),
        )
        .await;
    assert_eq!(padded.scope.company, COMPANY);
    assert_eq!(padded.duplicates_skipped, 3);
    assert_eq!(padded.inserted, 0);

    // Tally company names are case sensitive
    let lower = orchestrator
        .run_at(
            SyncRequest::scheduled("acme traders", vec![EntityKind::Voucher]),
            today(),
        )
        .await;
    assert_eq!(lower.inserted, 3);
    assert_eq!(store.len(), 6);
}

#[tokio::test]
async fn test_cancelled_run_skips_remaining_kinds() {
    let source = Arc::new(ScriptedSource::default());
    let store = Arc::new(MemoryStore::new());
    let orchestrator = orchestrator(source.clone(), store);
    orchestrator.cancel_token().cancel();

    let summary = orchestrator
        .run_at(SyncRequest::scheduled(COMPANY, vec![]), today())
        .await;

    assert_eq!(summary.state, RunState::PartiallyFailed);
    assert!(source.calls().is_empty());
    assert!(summary
        .reports
        .iter()
        .all(|r| r.error.as_deref() == Some("cancelled before fetch")));
}

#[tokio::test]
async fn test_broken_xml_keeps_records_read_so_far() {
    let source = Arc::new(ScriptedSource::default());
    let store = Arc::new(MemoryStore::new());
    let mut truncated = three_vouchers();
    truncated.truncate(truncated.find("S-3").unwrap());
    truncated.push_str("</VOUCHERTYPENAME></ENVELOPE>");
    source.respond(EntityKind::Voucher, Ok(truncated));

    let summary = orchestrator(source, store.clone())
        .run_at(vouchers_only(), today())
        .await;

    assert_eq!(summary.state, RunState::PartiallyFailed);
    assert_eq!(summary.inserted, 2);
    assert_eq!(summary.report(EntityKind::Voucher).unwrap().fetch_errors, 1);
}
