use super::exit_codes;
use crate::cli::args::{FlakyArgs, HealthArgs, StoreArgs, TrendArgs};
use anyhow::Context;
use chrono::{DateTime, Utc};
use flakewatch_core::config::EngineConfig;
use flakewatch_core::flakiness::FlakyDetector;
use flakewatch_core::model::AttemptRecord;
use flakewatch_core::trend::{overall_health, trend_series, TrendPeriod};

const DAY_MS: i64 = 86_400_000;

async fn attempts_for_window(
    store: &StoreArgs,
    days: u32,
    now: DateTime<Utc>,
) -> anyhow::Result<Vec<AttemptRecord>> {
    let db = super::open_store(&store.db)?;
    let scope = store.scope.clone();
    let since = now.timestamp_millis() - i64::from(days) * DAY_MS;
    tokio::task::spawn_blocking(move || db.fetch_attempts_since(&scope, since))
        .await
        .context("store query panicked")?
}

fn window_or_exit(days: Option<u32>, default: u32) -> Result<u32, i32> {
    match days.unwrap_or(default) {
        0 => {
            eprintln!("config error: --days must be at least 1");
            Err(exit_codes::CONFIG_ERROR)
        }
        d => Ok(d),
    }
}

pub async fn cmd_trend(args: TrendArgs, cfg: EngineConfig) -> anyhow::Result<i32> {
    let period = match TrendPeriod::parse(&args.period) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{}", e);
            return Ok(exit_codes::CONFIG_ERROR);
        }
    };
    let now = Utc::now();
    let attempts = attempts_for_window(&args.store, period.days, now).await?;
    let series = trend_series(&attempts, period, now, cfg.classification_rule);
    super::print_json(&series)?;
    Ok(exit_codes::OK)
}

pub async fn cmd_health(args: HealthArgs, cfg: EngineConfig) -> anyhow::Result<i32> {
    let days = match window_or_exit(args.days, cfg.health_window_days) {
        Ok(d) => d,
        Err(code) => return Ok(code),
    };
    let now = Utc::now();
    let attempts = attempts_for_window(&args.store, days, now).await?;
    let health = overall_health(&attempts, now, days, cfg.classification_rule);
    super::print_json(&health)?;
    Ok(exit_codes::OK)
}

pub async fn cmd_flaky(args: FlakyArgs, mut cfg: EngineConfig) -> anyhow::Result<i32> {
    cfg.flaky_window_days = match window_or_exit(args.days, cfg.flaky_window_days) {
        Ok(d) => d,
        Err(code) => return Ok(code),
    };
    let now = Utc::now();
    let attempts = attempts_for_window(&args.store, cfg.flaky_window_days, now).await?;
    let report = FlakyDetector::new(cfg).detect(&attempts, now);
    super::print_json(&report)?;
    Ok(exit_codes::OK)
}

pub async fn cmd_stats(args: StoreArgs) -> anyhow::Result<i32> {
    let store = super::open_store(&args.db)?;
    let stats = tokio::task::spawn_blocking(move || store.stats())
        .await
        .context("store query panicked")??;
    super::print_json(&stats)?;
    Ok(exit_codes::OK)
}
