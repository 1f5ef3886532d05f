use super::exit_codes;
use crate::cli::args::ClassifyArgs;
use anyhow::Context;
use flakewatch_core::classify::{classify_all, classify_histories, Classification};
use flakewatch_core::config::EngineConfig;
use flakewatch_core::history;
use flakewatch_core::normalize::{parse_document, Normalizer};
use flakewatch_core::report::table::write_csv;
use serde_json::json;
use std::collections::HashMap;

pub async fn cmd_classify(args: ClassifyArgs, cfg: EngineConfig) -> anyhow::Result<i32> {
    let docs = if tokio::fs::metadata(&args.input)
        .await
        .with_context(|| format!("input not found: {}", args.input.display()))?
        .is_dir()
    {
        super::read_result_dir(&args.input).await?
    } else {
        vec![super::read_source(&args.input).await?]
    };

    let mut normalizer = Normalizer::new();
    let mut attempts = Vec::new();
    for doc in &docs {
        attempts.extend(normalizer.normalize_document(&parse_document(&doc.content)));
    }
    let batch = normalizer.finish(attempts);

    let set = history::group(batch.attempts);
    let mut skipped = batch.skipped;
    skipped.merge(&set.skipped());

    let rule = cfg.classification_rule;
    let classification = if args.shards > 1 {
        let order: HashMap<String, usize> = set
            .iter()
            .enumerate()
            .map(|(i, h)| (h.identity().to_string(), i))
            .collect();

        let mut handles = Vec::new();
        for shard in set.into_shards(args.shards) {
            handles.push(tokio::task::spawn_blocking(move || {
                classify_histories(shard.iter(), rule)
            }));
        }
        let mut merged = Classification::default();
        for handle in handles {
            merged.merge(handle.await.context("classification shard panicked")?);
        }
        // restore first-seen order
        merged
            .records
            .sort_by_key(|r| order.get(&r.identity).copied().unwrap_or(usize::MAX));
        merged
    } else {
        classify_all(&set, rule)
    };

    tracing::info!(
        event = "flakewatch.classify.done",
        files = docs.len(),
        tests = classification.counts.total,
        flaky = classification.counts.flaky,
        skipped = skipped.total(),
        shards = args.shards,
        "classification finished"
    );

    if let Some(path) = &args.csv {
        super::ensure_parent_dir(path)?;
        write_csv(&classification.records, path)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }

    super::print_json(&json!({
        "counts": classification.counts,
        "pass_rate": classification.counts.pass_rate(),
        "skipped": skipped,
        "records": classification.records,
    }))?;

    if args.strict && classification.counts.failed > 0 {
        return Ok(exit_codes::TEST_FAILED);
    }
    Ok(exit_codes::OK)
}
