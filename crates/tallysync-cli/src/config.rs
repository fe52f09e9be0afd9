use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tallysync_core::config::TallyConfig;
use tallysync_core::models::{EntityKind, FiscalYear};
use tallysync_core::reconcile::ConflictPolicy;

/// CLI configuration parsed from command line arguments and environment variables
#[derive(Parser, Debug)]
#[command(name = "tallysync")]
#[command(
    author,
    version,
    about = "Synchronize Tally accounting data into PostgreSQL"
)]
#[command(after_help = "Examples:
  tallysync sync
  tallysync sync --company \"Acme Traders\" --kinds ledger,voucher
  tallysync vouchers --company \"Acme Traders\" --from 20240401 --to 20240430
  tallysync daemon --interval-hours 6
  tallysync companies
  tallysync stats")]
pub struct Config {
    /// PostgreSQL database connection URL (not needed with --dry-run)
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    /// Host running the Tally HTTP server
    #[arg(long, env = "TALLY_HOST", default_value = "localhost", global = true)]
    pub tally_host: String,

    /// Port of the Tally HTTP server
    #[arg(long, env = "TALLY_PORT", default_value_t = 9000, global = true)]
    pub tally_port: u16,

    /// Log at DEBUG level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Config {
    pub fn tally(&self) -> TallyConfig {
        TallyConfig {
            host: self.tally_host.clone(),
            port: self.tally_port,
        }
    }
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one scheduled pass: masters plus recent vouchers (yesterday and today)
    #[command(after_help = "Examples:
  tallysync sync                              # All enabled companies from config
  tallysync sync --company \"Acme Traders\"     # A single company
  tallysync sync --config ~/custom.toml       # Use custom config file
  tallysync sync --dry-run                    # Fetch and reconcile in memory only")]
    Sync {
        /// Sync a single company instead of the configured list
        #[arg(short, long, value_name = "NAME")]
        company: Option<String>,

        /// Custom path to companies.toml configuration file
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Entity kinds to sync (comma separated); all kinds when omitted
        #[arg(short, long, value_delimiter = ',')]
        kinds: Vec<EntityKind>,

        /// What to do when a record is already stored: skip, overwrite, newer
        #[arg(short, long, default_value = "skip")]
        policy: ConflictPolicy,

        /// Use an in-memory store; nothing is persisted
        #[arg(long)]
        dry_run: bool,
    },
    /// Sync vouchers for an explicit date range
    #[command(after_help = "Example: tallysync vouchers --company \"Acme Traders\" --from 20240401 --to 20240430")]
    Vouchers {
        /// Company name exactly as Tally shows it
        #[arg(short, long, value_name = "NAME")]
        company: String,

        /// First day of the range (YYYYMMDD or YYYY-MM-DD)
        #[arg(long)]
        from: String,

        /// Last day of the range, inclusive
        #[arg(long)]
        to: String,

        /// Longest range allowed; longer ranges are truncated
        #[arg(long)]
        max_days: Option<u32>,

        /// What to do when a record is already stored: skip, overwrite, newer
        #[arg(short, long, default_value = "skip")]
        policy: ConflictPolicy,

        /// Use an in-memory store; nothing is persisted
        #[arg(long)]
        dry_run: bool,
    },
    /// Repeat the scheduled pass until interrupted with Ctrl-C
    Daemon {
        /// Custom path to companies.toml configuration file
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Hours between passes
        #[arg(long, env = "SYNC_INTERVAL_HOURS", default_value_t = 24)]
        interval_hours: u64,

        /// What to do when a record is already stored: skip, overwrite, newer
        #[arg(short, long, default_value = "skip")]
        policy: ConflictPolicy,
    },
    /// List the companies currently open in Tally
    Companies,
    /// Show stored record counts and recent runs
    Stats {
        /// Restrict to one company
        #[arg(short, long, value_name = "NAME")]
        company: Option<String>,

        /// Also count records per kind for one fiscal year (e.g. 2024-25)
        #[arg(long, value_name = "YEAR")]
        fiscal_year: Option<FiscalYear>,

        /// Number of recent runs to show
        #[arg(long, default_value_t = 10)]
        runs: usize,
    },
}
