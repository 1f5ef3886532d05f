use super::args::*;
use anyhow::Context;
use flakewatch_core::config::{load_config, EngineConfig};
use flakewatch_core::errors::ConfigError;
use flakewatch_core::scan::SourceDocument;
use flakewatch_core::storage::Store;
use serde::Serialize;
use std::path::{Path, PathBuf};

pub mod classify;
pub mod ledger;
pub mod query;
pub mod scan;

pub mod exit_codes {
    pub const OK: i32 = 0;
    pub const TEST_FAILED: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
}

pub const RESULT_SUFFIX: &str = "-result.json";

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    let cfg = match cli.cmd {
        Command::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            return Ok(exit_codes::OK);
        }
        _ => match engine_config(cli.config.as_deref(), cli.strict_config) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("{}", e);
                return Ok(exit_codes::CONFIG_ERROR);
            }
        },
    };

    match cli.cmd {
        Command::Classify(args) => classify::cmd_classify(args, cfg).await,
        Command::Scan(args) => scan::cmd_scan(args).await,
        Command::Trend(args) => query::cmd_trend(args, cfg).await,
        Command::Health(args) => query::cmd_health(args, cfg).await,
        Command::Flaky(args) => query::cmd_flaky(args, cfg).await,
        Command::Stats(args) => query::cmd_stats(args).await,
        Command::Ledger(args) => ledger::cmd_ledger(args).await,
        Command::Version => Ok(exit_codes::OK),
    }
}

fn engine_config(path: Option<&Path>, strict: bool) -> Result<EngineConfig, ConfigError> {
    match path {
        Some(p) => load_config(p, strict),
        None => Ok(EngineConfig::default()),
    }
}

pub(crate) fn open_store(db: &Path) -> anyhow::Result<Store> {
    ensure_parent_dir(db)?;
    let store = Store::open(db).with_context(|| format!("failed to open store {}", db.display()))?;
    store.init_schema()?;
    Ok(store)
}

pub(crate) fn ensure_parent_dir(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Reads every `*-result.json` in `dir`, sorted by file name.
pub(crate) async fn read_result_dir(dir: &Path) -> anyhow::Result<Vec<SourceDocument>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to read directory {}", dir.display()))?;

    let mut paths: Vec<PathBuf> = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_result = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(RESULT_SUFFIX));
        if is_result {
            paths.push(path);
        }
    }
    paths.sort();

    let mut docs = Vec::with_capacity(paths.len());
    for path in paths {
        docs.push(read_source(&path).await?);
    }
    tracing::debug!(
        event = "flakewatch.cli.sources_loaded",
        dir = %dir.display(),
        files = docs.len(),
        "loaded result files"
    );
    Ok(docs)
}

pub(crate) async fn read_source(path: &Path) -> anyhow::Result<SourceDocument> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let modified_ms = modified_ms(path).await.unwrap_or(0);
    Ok(SourceDocument {
        path: path.display().to_string(),
        modified_ms,
        content,
    })
}

pub(crate) async fn modified_ms(path: &Path) -> Option<i64> {
    let modified = tokio::fs::metadata(path).await.ok()?.modified().ok()?;
    let since_epoch = modified.duration_since(std::time::UNIX_EPOCH).ok()?;
    i64::try_from(since_epoch.as_millis()).ok()
}
