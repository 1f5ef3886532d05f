use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "flakewatch",
    version,
    about = "Retry-aware test classification, flakiness scoring and trends"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Command,

    /// Engine config (YAML). Defaults apply when omitted.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Fail on unknown config keys instead of warning
    #[arg(long, global = true)]
    pub strict_config: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Classify attempts from a result file or directory (no database)
    Classify(ClassifyArgs),
    /// Ingest a directory of result files into the store
    Scan(ScanArgs),
    /// Daily trend series from stored attempts
    Trend(TrendArgs),
    /// Overall health over the last N days
    Health(HealthArgs),
    /// Ranked flaky test report
    Flaky(FlakyArgs),
    /// Inspect or resolve persisted flaky ledger entries
    Ledger(LedgerArgs),
    /// Row counts of the store
    Stats(StoreArgs),
    Version,
}

#[derive(clap::Args, Debug, Clone)]
pub struct StoreArgs {
    #[arg(long, env = "FLAKEWATCH_DB", default_value = ".flakewatch/flakewatch.db")]
    pub db: PathBuf,

    #[arg(long, default_value = "default")]
    pub scope: String,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ClassifyArgs {
    /// JSON array / JSON Lines file, or a directory of *-result.json files
    #[arg(long)]
    pub input: PathBuf,

    /// Also write the tabular export here
    #[arg(long)]
    pub csv: Option<PathBuf>,

    /// Classify in N parallel shards keyed by identity
    #[arg(long, default_value_t = 1)]
    pub shards: usize,

    /// Exit 1 when any test is classified Failed
    #[arg(long)]
    pub strict: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ScanArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Directory holding *-result.json files
    #[arg(long)]
    pub dir: PathBuf,

    /// Run start (RFC 3339 or epoch millis). Defaults to the folder date
    /// (dd-mm-yyyy), then the directory mtime.
    #[arg(long)]
    pub run_started_at: Option<String>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct TrendArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// 24h | <n>d
    #[arg(long, default_value = "7d")]
    pub period: String,
}

#[derive(clap::Args, Debug, Clone)]
pub struct HealthArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Overrides health_window_days
    #[arg(long)]
    pub days: Option<u32>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct FlakyArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Overrides flaky_window_days
    #[arg(long)]
    pub days: Option<u32>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct LedgerArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[command(subcommand)]
    pub cmd: LedgerSub,
}

#[derive(Subcommand, Debug, Clone)]
pub enum LedgerSub {
    List {
        /// Include resolved entries
        #[arg(long)]
        all: bool,

        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    Resolve {
        #[arg(long)]
        identity: String,
    },
}
