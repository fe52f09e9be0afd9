use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use dotenvy::dotenv;
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

use tallysync::{Command, Config};
use tallysync_client::TallyClient;
use tallysync_core::config::{
    default_config_path, load_companies_config, DbConfig, HttpConfig, SyncConfig,
};
use tallysync_core::models::{EntityKind, FiscalYear};
use tallysync_core::reconcile::ConflictPolicy;
use tallysync_core::store::{MemoryStore, RecordFilter, RecordStore};
use tallysync_core::sync::BatchSyncSummary;
use tallysync_core::{SyncOrchestrator, SyncRequest};
use tallysync_db::PgRecordStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv().ok();

    // Parse command line arguments
    let config = Config::parse();

    // Setup logging (stderr to keep stdout clean for summaries)
    let level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to install tracing subscriber")?;

    let sync_config = SyncConfig::from_env().context("Invalid sync settings")?;
    let client = TallyClient::new(
        &config.tally(),
        HttpConfig::from_env().context("Invalid HTTP settings")?,
    )
    .context("Invalid Tally endpoint")?
    .with_fiscal_year_start_month(sync_config.fiscal_year_start_month);

    // Execute command
    match &config.command {
        Command::Sync {
            company,
            config: companies_file,
            kinds,
            policy,
            dry_run,
        } => {
            let requests = scheduled_requests(
                company.as_deref(),
                companies_file.as_deref(),
                kinds,
                *policy,
            )?;
            let store = open_store(&config, *dry_run).await?;
            let orchestrator = SyncOrchestrator::new(Arc::new(client), store, sync_config);
            let batch = orchestrator.run_many(requests).await;
            print_json(&batch)?;
            check_batch(&batch)?;
        }
        Command::Vouchers {
            company,
            from,
            to,
            max_days,
            policy,
            dry_run,
        } => {
            let request = SyncRequest::manual_from_tokens(company.as_str(), from, to, *max_days)
                .context("Invalid voucher range")?
                .with_policy(*policy);
            let store = open_store(&config, *dry_run).await?;
            let orchestrator = SyncOrchestrator::new(Arc::new(client), store, sync_config);
            let summary = orchestrator.run(request).await;
            print_json(&summary)?;
            if !summary.is_success() {
                bail!("Voucher sync for '{}' ended {}", company, summary.state);
            }
        }
        Command::Daemon {
            config: companies_file,
            interval_hours,
            policy,
        } => {
            if *interval_hours == 0 {
                bail!("--interval-hours must be at least 1");
            }
            let store = open_store(&config, false).await?;
            let orchestrator = SyncOrchestrator::new(Arc::new(client), store, sync_config);
            daemon(
                &orchestrator,
                companies_file.as_deref(),
                Duration::from_secs(interval_hours * 3600),
                *policy,
            )
            .await?;
        }
        Command::Companies => {
            let companies = match client.list_companies().await {
                Ok(companies) => companies,
                Err(e) => bail!("{}", e.user_message()),
            };
            if companies.is_empty() {
                eprintln!("No companies are open in Tally.");
            }
            for name in companies {
                println!("{}", name);
            }
        }
        Command::Stats {
            company,
            fiscal_year,
            runs,
        } => {
            let store = connect_db(&config).await?;
            show_stats(&store, company.as_deref(), *fiscal_year, *runs).await?;
        }
    }

    Ok(())
}

/// Builds one scheduled request per company to sync.
fn scheduled_requests(
    company: Option<&str>,
    companies_file: Option<&Path>,
    kinds: &[EntityKind],
    policy: ConflictPolicy,
) -> anyhow::Result<Vec<SyncRequest>> {
    if let Some(name) = company {
        return Ok(vec![
            SyncRequest::scheduled(name, kinds.to_vec()).with_policy(policy),
        ]);
    }

    let companies = load_companies_config(companies_file).context("Failed to load companies")?;
    let requests: Vec<SyncRequest> = companies
        .enabled()
        .map(|entry| {
            let request = SyncRequest::scheduled(entry.name.as_str(), entry.kinds());
            // --kinds overrides the per-company list
            let request = if kinds.is_empty() {
                request
            } else {
                request.with_kinds(kinds.to_vec())
            };
            request.with_policy(policy)
        })
        .collect();

    if requests.is_empty() {
        let path = companies_file
            .map(Path::to_path_buf)
            .or_else(default_config_path)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "companies.toml".to_string());
        bail!(
            "No companies to sync. Pass --company or add [[companies]] entries to {}",
            path
        );
    }

    Ok(requests)
}

async fn connect_db(config: &Config) -> anyhow::Result<PgRecordStore> {
    let Some(url) = config.database_url.as_deref() else {
        bail!("DATABASE_URL is required unless --dry-run is given");
    };

    info!("Connecting to database...");
    let db_config = DbConfig::from_env().context("Invalid database settings")?;
    let store = match PgRecordStore::connect(url, &db_config).await {
        Ok(store) => store,
        Err(e) => bail!("{}", e.user_message()),
    };
    store.migrate().await.context("Failed to migrate database")?;
    Ok(store)
}

async fn open_store(config: &Config, dry_run: bool) -> anyhow::Result<Arc<dyn RecordStore>> {
    if dry_run {
        warn!("Dry run: records are reconciled in memory and discarded");
        return Ok(Arc::new(MemoryStore::new()));
    }
    Ok(Arc::new(connect_db(config).await?))
}

/// Runs scheduled passes every `interval` until Ctrl-C.
///
/// Ctrl-C lets the entity kind in progress finish; later kinds and passes
/// are skipped.
async fn daemon(
    orchestrator: &SyncOrchestrator,
    companies_file: Option<&Path>,
    interval: Duration,
    policy: ConflictPolicy,
) -> anyhow::Result<()> {
    let cancel: CancellationToken = orchestrator.cancel_token();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping after the current entity kind");
            signal.cancel();
        }
    });

    info!(interval_secs = interval.as_secs(), "Sync daemon started");
    loop {
        // Re-read the file so edits apply without a restart
        match scheduled_requests(None, companies_file, &[], policy) {
            Ok(requests) => {
                let batch = orchestrator.run_many(requests).await;
                info!(
                    successful = batch.successful_count(),
                    failed = batch.failed_count(),
                    records = batch.total_records(),
                    "Sync pass finished"
                );
                print_json(&batch)?;
            }
            Err(e) => error!("Skipping sync pass: {:#}", e),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    info!("Sync daemon stopped");
    Ok(())
}

/// Prints a summary as one JSON document on stdout.
fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{}", json);
    Ok(())
}

fn check_batch(batch: &BatchSyncSummary) -> anyhow::Result<()> {
    let failed = batch.failed_count();
    if failed > 0 {
        bail!(
            "{} of {} company runs did not complete cleanly",
            failed,
            batch.total_companies()
        );
    }
    Ok(())
}

/// Show record counts per company and kind, then the latest runs
async fn show_stats(
    store: &PgRecordStore,
    company: Option<&str>,
    fiscal_year: Option<FiscalYear>,
    runs: usize,
) -> anyhow::Result<()> {
    let stats = store.aggregate(company).await?;

    println!("\nRecord Statistics\n");
    if stats.is_empty() {
        println!("  No records stored yet.");
    }
    for row in &stats {
        let last = row
            .last_update
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!(
            "  {:<28} {:<14} {:>8} records {:>6} malformed  {}",
            row.company,
            row.kind.to_string(),
            row.records,
            row.malformed,
            last
        );
    }

    if let Some(fiscal_year) = fiscal_year {
        println!("\nFiscal Year {}\n", fiscal_year);
        for kind in EntityKind::ALL {
            let mut filter = RecordFilter::kind(kind).with_fiscal_year(fiscal_year);
            if let Some(name) = company {
                filter = filter.with_company(name);
            }
            let records = store.count_documents(&filter).await?;
            let malformed = store.count_documents(&filter.malformed()).await?;
            println!(
                "  {:<14} {:>8} records {:>6} malformed",
                kind.to_string(),
                records,
                malformed
            );
        }
    }

    let recent = store.recent_runs(company, runs).await?;
    if !recent.is_empty() {
        println!("\nRecent Runs\n");
        for run in &recent {
            println!(
                "  {}  {:<28} {:<9} {:<16} +{} ~{} ={} !{} ?{}",
                run.started_at.format("%Y-%m-%d %H:%M"),
                run.company,
                run.trigger,
                run.state,
                run.inserted,
                run.updated,
                run.duplicates_skipped,
                run.failed,
                run.malformed
            );
        }
    }
    println!();

    Ok(())
}
