use crate::model::{Verdict, VerdictRecord};
use std::path::Path;

pub const HEADER: &str = "Category,Test Name,Runs,Statuses";
const ARROW: &str = " → ";

/// One row per classified test: Passed rows, then Flaky, then Failed, each
/// group in input order. Column order and quoting are fixed.
pub fn to_csv(records: &[VerdictRecord]) -> String {
    let mut out = String::new();
    out.push_str(HEADER);
    out.push('\n');

    for category in [Verdict::Passed, Verdict::Flaky, Verdict::Failed] {
        for r in records.iter().filter(|r| r.verdict == category) {
            let statuses: Vec<&str> = r.status_sequence.iter().map(|s| s.as_str()).collect();
            out.push_str(&format!(
                "{},{},{},{}\n",
                category.label(),
                quote(&r.name),
                r.run_count,
                quote(&statuses.join(ARROW))
            ));
        }
    }
    out
}

pub fn write_csv(records: &[VerdictRecord], out: &Path) -> anyhow::Result<()> {
    std::fs::write(out, to_csv(records))?;
    Ok(())
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}
