use sha2::{Digest, Sha256};

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    hex::encode(h.finalize())
}

/// Content address of a source document, used by the processed-source ledger.
pub fn content_hash(content: &str) -> String {
    format!("sha256:{}", sha256_hex(content.as_bytes()))
}

/// Inputs that make one attempt distinguishable from every other attempt.
pub struct AttemptContext<'a> {
    pub uuid: Option<&'a str>,
    pub history_id: Option<&'a str>,
    pub test_case_id: Option<&'a str>,
    pub full_name: Option<&'a str>,
    pub name: &'a str,
    pub status: &'a str,
    pub start_ms: i64,
    pub stop_ms: i64,
    /// How many earlier records of the same document carried identical fields.
    pub occurrence: u32,
}

/// Stable attempt fingerprint. Prefers the producer's uuid when present.
///
/// The parent run is not an input: an attempt re-exported under a later run
/// maps to the same fingerprint. Untimed retries with equal status differ only
/// by `occurrence`; the first occurrence keeps the plain field hash.
pub fn attempt(ctx: AttemptContext<'_>) -> String {
    if let Some(uuid) = ctx.uuid.filter(|u| !u.trim().is_empty()) {
        return format!("uuid:{}", uuid.trim());
    }

    let parts = [
        format!("history_id={}", ctx.history_id.unwrap_or("")),
        format!("test_case_id={}", ctx.test_case_id.unwrap_or("")),
        format!("full_name={}", ctx.full_name.unwrap_or("")),
        format!("name={}", ctx.name),
        format!("status={}", ctx.status),
        format!("start={}", ctx.start_ms),
        format!("stop={}", ctx.stop_ms),
    ];
    let mut canonical = parts.join("\n");
    if ctx.occurrence > 0 {
        canonical.push_str(&format!("\noccurrence={}", ctx.occurrence));
    }
    format!("sha256:{}", sha256_hex(canonical.as_bytes()))
}
