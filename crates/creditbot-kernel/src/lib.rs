mod classifier;
mod parser;
mod tally;
mod templates;

pub use classifier::QueryClassifier;
pub use parser::{extract_look_id, extract_report_references, host_matches, parse_request};
pub use tally::{amount_outcome, processed_record, CreditTally};
pub use templates::{
    approval_reply, clarification_reply, escalation_message, outcome_reason_code,
    reply_failure_escalation,
};

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub fn parse_rfc3339(ts: &str) -> Option<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|v| v.with_timezone(&Utc))
}

pub fn jcs_sha256_hex(value: &Value) -> Result<String, String> {
    let canonical = serde_jcs::to_string(value)
        .map_err(|err| format!("failed to canonicalize JSON via JCS: {err}"))?;
    Ok(sha256_hex(canonical.as_bytes()))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Short fingerprint used to correlate a query across log lines without
/// logging the query itself.
pub fn query_fingerprint(query: &str) -> String {
    sha256_hex(query.as_bytes())[..12].to_string()
}
