use super::exit_codes;
use crate::cli::args::{LedgerArgs, LedgerSub};
use chrono::Utc;
use serde_json::json;

pub async fn cmd_ledger(args: LedgerArgs) -> anyhow::Result<i32> {
    let store = super::open_store(&args.store.db)?;
    let scope = &args.store.scope;

    match args.cmd {
        LedgerSub::List { all, limit } => {
            let entries = store.ledger_entries(scope, !all, limit)?;
            super::print_json(&entries)?;
        }
        LedgerSub::Resolve { identity } => {
            let resolved = store.resolve_ledger_entry(scope, &identity, Utc::now())?;
            if resolved {
                tracing::info!(
                    event = "flakewatch.ledger.resolved",
                    scope = %scope,
                    identity = %identity,
                    "ledger entry resolved"
                );
            } else {
                eprintln!(
                    "note: no active ledger entry for scope={} identity={}",
                    scope, identity
                );
            }
            super::print_json(&json!({
                "scope": scope,
                "identity": identity,
                "resolved": resolved,
            }))?;
        }
    }
    Ok(exit_codes::OK)
}
