use crate::errors::SkipCounts;
use crate::identity;
use crate::model::{AttemptRecord, AttemptStatus};
use std::collections::HashMap;

/// All attempts sharing one identity key, ordered by `(start_ms, seq)`.
///
/// Never empty. The secondary key keeps "first" and "last" deterministic when
/// several attempts carry the same (often zero) start time.
#[derive(Debug, Clone, PartialEq)]
pub struct TestCaseHistory {
    identity: String,
    attempts: Vec<AttemptRecord>,
}

impl TestCaseHistory {
    fn new(identity: String, first: AttemptRecord) -> Self {
        Self {
            identity,
            attempts: vec![first],
        }
    }

    fn sort(&mut self) {
        self.attempts.sort_by_key(|a| (a.start_ms, a.seq));
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.attempts
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn first(&self) -> &AttemptRecord {
        &self.attempts[0]
    }

    pub fn last(&self) -> &AttemptRecord {
        &self.attempts[self.attempts.len() - 1]
    }

    /// Display name, taken from the chronologically first attempt.
    pub fn name(&self) -> &str {
        &self.first().name
    }

    pub fn statuses(&self) -> Vec<AttemptStatus> {
        self.attempts.iter().map(|a| a.status).collect()
    }

    pub fn min_seq(&self) -> u64 {
        self.attempts.iter().map(|a| a.seq).min().unwrap_or(0)
    }
}

/// Histories in first-seen order plus the attempts dropped during grouping.
#[derive(Debug, Clone, Default)]
pub struct HistorySet {
    histories: Vec<TestCaseHistory>,
    index: HashMap<String, usize>,
    skipped: SkipCounts,
}

impl HistorySet {
    pub fn len(&self) -> usize {
        self.histories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histories.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TestCaseHistory> {
        self.histories.iter()
    }

    pub fn get(&self, identity: &str) -> Option<&TestCaseHistory> {
        self.index.get(identity).map(|&i| &self.histories[i])
    }

    pub fn skipped(&self) -> SkipCounts {
        self.skipped
    }

    pub fn into_histories(self) -> Vec<TestCaseHistory> {
        self.histories
    }

    /// Disjoint partition by a stable hash of the identity key. Every history
    /// lands in exactly one shard and each shard keeps first-seen order.
    pub fn into_shards(self, shards: usize) -> Vec<Vec<TestCaseHistory>> {
        let shards = shards.max(1);
        let mut out: Vec<Vec<TestCaseHistory>> = (0..shards).map(|_| Vec::new()).collect();
        for h in self.histories {
            let slot = shard_of(&h.identity, shards);
            out[slot].push(h);
        }
        out
    }
}

pub fn shard_of(identity: &str, shards: usize) -> usize {
    let digest = crate::fingerprint::sha256_hex(identity.as_bytes());
    let prefix = u64::from_str_radix(&digest[..16], 16).unwrap_or(0);
    (prefix % shards.max(1) as u64) as usize
}

/// Groups attempts by resolved identity. Attempts without any identifier are
/// dropped and counted; they never fail the batch.
pub fn group<I>(attempts: I) -> HistorySet
where
    I: IntoIterator<Item = AttemptRecord>,
{
    let mut set = HistorySet::default();

    for attempt in attempts {
        let key = match identity::resolve_key(&attempt) {
            Ok(k) => k.to_string(),
            Err(e) => {
                tracing::warn!(
                    event = "flakewatch.group.identity_missing",
                    seq = attempt.seq,
                    name = %attempt.name,
                    "dropping attempt: {}", e
                );
                set.skipped.count(&e);
                continue;
            }
        };

        match set.index.get(&key) {
            Some(&i) => set.histories[i].attempts.push(attempt),
            None => {
                set.index.insert(key.clone(), set.histories.len());
                set.histories.push(TestCaseHistory::new(key, attempt));
            }
        }
    }

    for h in &mut set.histories {
        h.sort();
    }
    set
}
