use super::exit_codes;
use crate::cli::args::ScanArgs;
use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use flakewatch_core::scan::Scanner;
use std::path::Path;

pub async fn cmd_scan(args: ScanArgs) -> anyhow::Result<i32> {
    let run_started_at_ms = match &args.run_started_at {
        Some(raw) => match parse_instant_ms(raw) {
            Some(ms) => ms,
            None => {
                eprintln!(
                    "config error: --run-started-at '{}' is neither RFC 3339 nor epoch millis",
                    raw
                );
                return Ok(exit_codes::CONFIG_ERROR);
            }
        },
        None => folder_run_start_ms(&args.dir).await,
    };

    let sources = super::read_result_dir(&args.dir).await?;
    let store = super::open_store(&args.store.db)?;
    let scope = args.store.scope.clone();

    let outcome = tokio::task::spawn_blocking(move || {
        Scanner::new(store).scan(&scope, run_started_at_ms, &sources, Utc::now())
    })
    .await
    .context("scan task panicked")??;

    super::print_json(&outcome)?;
    Ok(exit_codes::OK)
}

pub fn parse_instant_ms(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(ms) = raw.parse::<i64>() {
        return (ms >= 0).then_some(ms);
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

/// Report folders are named `dd-mm-yyyy`; that date (UTC midnight) is the run start.
pub fn run_start_from_folder_name(name: &str) -> Option<i64> {
    let date = NaiveDate::parse_from_str(name, "%d-%m-%Y").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis())
}

async fn folder_run_start_ms(dir: &Path) -> i64 {
    if let Some(ms) = dir
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(run_start_from_folder_name)
    {
        return ms;
    }
    match super::modified_ms(dir).await {
        Some(ms) => ms,
        None => {
            tracing::warn!(
                event = "flakewatch.scan.run_start_unknown",
                dir = %dir.display(),
                "could not derive run start; using now"
            );
            Utc::now().timestamp_millis()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_dates_are_day_month_year() {
        assert_eq!(run_start_from_folder_name("14-11-2025"), Some(1_763_078_400_000));
        assert_eq!(run_start_from_folder_name("2025-11-14"), None);
        assert_eq!(run_start_from_folder_name("allure-results"), None);
    }

    #[test]
    fn instants_accept_millis_and_rfc3339() {
        assert_eq!(parse_instant_ms("1763107200000"), Some(1_763_107_200_000));
        assert_eq!(parse_instant_ms("2025-11-14T08:00:00Z"), Some(1_763_107_200_000));
        assert_eq!(parse_instant_ms("-1"), None);
        assert_eq!(parse_instant_ms("yesterday"), None);
    }
}
