use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const CONTRACT_VERSION: u32 = 1;

/// JSON Schema of the persisted state document.
pub const STATE_SNAPSHOT_SCHEMA: &str =
    include_str!("../../../contracts/v1/state_snapshot.schema.json");

/// A chat message as returned by the message source, oldest first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub author_id: Option<String>,
    #[serde(default)]
    pub is_bot: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ReportReference(pub String);

impl ReportReference {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReportReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParsedRequest {
    pub message_id: String,
    #[serde(default)]
    pub requester_id: Option<String>,
    pub references: Vec<ReportReference>,
    pub text: String,
}

impl ParsedRequest {
    pub fn has_references(&self) -> bool {
        !self.references.is_empty()
    }
}

/// Raw answer of the computation engine for one query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComputeResult {
    pub amount: f64,
    #[serde(default)]
    pub trace: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ComputeOutcome {
    Amount(f64),
    NotApplicable,
    Failed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IncludedReference {
    pub reference: ReportReference,
    pub amount: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    NoReportReference,
    OutOfScope,
}

impl RejectionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectionReason::NoReportReference => "no_report_reference",
            RejectionReason::OutOfScope => "out_of_scope",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MessageOutcome {
    Succeeded {
        total: f64,
        included: Vec<IncludedReference>,
    },
    Rejected {
        reason: RejectionReason,
    },
    Failed {
        reasons: Vec<String>,
    },
}

impl MessageOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            MessageOutcome::Succeeded { .. } => OutcomeKind::Succeeded,
            MessageOutcome::Rejected { .. } => OutcomeKind::Rejected,
            MessageOutcome::Failed { .. } => OutcomeKind::Failed,
        }
    }

    pub fn included_count(&self) -> usize {
        match self {
            MessageOutcome::Succeeded { included, .. } => included.len(),
            _ => 0,
        }
    }

    pub fn total(&self) -> Option<f64> {
        match self {
            MessageOutcome::Succeeded { total, .. } => Some(*total),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Succeeded,
    Rejected,
    Failed,
    /// Records written before outcomes were tagged.
    #[default]
    Unknown,
}

impl OutcomeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeKind::Succeeded => "succeeded",
            OutcomeKind::Rejected => "rejected",
            OutcomeKind::Failed => "failed",
            OutcomeKind::Unknown => "unknown",
        }
    }
}

/// Metadata kept per handled message, keyed by message id in the snapshot.
/// Keys this struct does not name are carried in `extra` and written back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ProcessedRecord {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub credit_amount: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub processed_at: String,
    #[serde(default)]
    pub outcome: OutcomeKind,
    #[serde(default)]
    pub included_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_posted: Option<bool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ProcessedRecord {
    /// Salvages a detail object whose known keys have unexpected types.
    /// Mistyped known keys are dropped; everything else lands in `extra`.
    pub fn from_loose(mut fields: serde_json::Map<String, Value>) -> Self {
        let mut take = |name: &str| fields.remove(name).unwrap_or(Value::Null);
        let success = take("success").as_bool().unwrap_or(false);
        let credit_amount = take("credit_amount").as_f64();
        let error = take("error").as_str().map(str::to_string);
        let processed_at = take("processed_at")
            .as_str()
            .map(str::to_string)
            .unwrap_or_default();
        let outcome = serde_json::from_value(take("outcome")).unwrap_or_default();
        let included_count = take("included_count")
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(0);
        let reply_posted = take("reply_posted").as_bool();
        Self {
            success,
            credit_amount,
            error,
            processed_at,
            outcome,
            included_count,
            reply_posted,
            extra: fields.into_iter().collect(),
        }
    }
}

// A malformed detail entry must never cost the document its processed ids.
fn lenient_details<'de, D>(deserializer: D) -> Result<BTreeMap<String, ProcessedRecord>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .filter_map(|(id, value)| {
            let record = match serde_json::from_value::<ProcessedRecord>(value.clone()) {
                Ok(record) => record,
                Err(_) => match value {
                    Value::Object(fields) => ProcessedRecord::from_loose(fields),
                    _ => return None,
                },
            };
            Some((id, record))
        })
        .collect())
}

/// The whole persisted state document. Field names are fixed; new fields
/// must be optional on read, and unknown top-level fields are kept.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateSnapshot {
    #[serde(default)]
    pub processed_messages: Vec<String>,
    #[serde(default, deserialize_with = "lenient_details")]
    pub processing_details: BTreeMap<String, ProcessedRecord>,
    #[serde(default)]
    pub last_check_timestamp: Option<String>,
    #[serde(default)]
    pub total_processed: u64,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub total_pruned: u64,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl StateSnapshot {
    pub fn empty(created_at: String) -> Self {
        Self {
            processed_messages: Vec::new(),
            processing_details: BTreeMap::new(),
            last_check_timestamp: None,
            total_processed: 0,
            created_at,
            total_pruned: 0,
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateStats {
    pub total_processed: u64,
    pub last_check: Option<String>,
    pub created_at: String,
    pub processed_count: usize,
    pub total_pruned: u64,
    pub primary_dirty: bool,
}

/// Statistics of one orchestrator invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub fetched: usize,
    pub unprocessed: usize,
    pub skipped: usize,
    pub succeeded: usize,
    pub rejected: usize,
    pub failed: usize,
    pub total_credit: f64,
    pub total_processed: u64,
    pub pruned: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    #[test]
    fn schema_file_is_valid_json_schema() {
        let text = std::fs::read_to_string(repo_path("contracts/v1/state_snapshot.schema.json"))
            .unwrap();
        let schema: Value = serde_json::from_str(&text).unwrap();
        jsonschema::validator_for(&schema)
            .unwrap_or_else(|err| panic!("invalid snapshot schema: {err}"));
        assert_eq!(text, STATE_SNAPSHOT_SCHEMA);
    }

    #[test]
    fn serialized_snapshot_matches_schema() {
        let mut snapshot = StateSnapshot::empty("2026-10-01T00:00:00+00:00".to_string());
        snapshot.processed_messages.push("1700000000.000100".to_string());
        snapshot.processing_details.insert(
            "1700000000.000100".to_string(),
            ProcessedRecord {
                success: true,
                credit_amount: Some(35.5),
                error: None,
                processed_at: "2026-10-19T12:00:00+00:00".to_string(),
                outcome: OutcomeKind::Succeeded,
                included_count: 2,
                reply_posted: Some(true),
                extra: BTreeMap::new(),
            },
        );
        snapshot.total_processed = 1;

        let schema: Value = serde_json::from_str(STATE_SNAPSHOT_SCHEMA).unwrap();
        let validator = jsonschema::validator_for(&schema).unwrap();
        let instance = serde_json::to_value(&snapshot).unwrap();
        assert!(validator.is_valid(&instance), "{instance}");
    }

    #[test]
    fn legacy_document_without_new_fields_loads() {
        let legacy = json!({
            "processed_messages": ["1.1", "1.2"],
            "last_check_timestamp": "2026-01-14T10:00:00.123456",
            "total_processed": 2,
            "created_at": "2026-01-14T09:00:00.000001",
            "processing_details": {
                "1.1": {
                    "success": false,
                    "credit_amount": null,
                    "error": "No Looker link found",
                    "processed_at": "2026-01-14T09:30:00.000001"
                }
            }
        });
        let snapshot: StateSnapshot = serde_json::from_value(legacy.clone()).unwrap();
        assert_eq!(snapshot.processed_messages, vec!["1.1", "1.2"]);
        assert_eq!(snapshot.total_pruned, 0);
        let record = &snapshot.processing_details["1.1"];
        assert_eq!(record.outcome, OutcomeKind::Unknown);
        assert_eq!(record.reply_posted, None);

        let back = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(back["processed_messages"], legacy["processed_messages"]);
        assert_eq!(back["last_check_timestamp"], legacy["last_check_timestamp"]);
        assert_eq!(back["created_at"], legacy["created_at"]);
        assert_eq!(back["total_processed"], legacy["total_processed"]);
    }

    #[test]
    fn message_outcome_is_tagged_by_status() {
        let outcome = MessageOutcome::Rejected {
            reason: RejectionReason::NoReportReference,
        };
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            json!({"status": "rejected", "reason": "no_report_reference"})
        );
    }

    fn repo_path(relative: &str) -> PathBuf {
        let mut base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        base.push("../..");
        base.push(relative);
        base
    }
}
