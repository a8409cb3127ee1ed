use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use creditbot_contracts::MessageOutcome;
use creditbot_kernel::{jcs_sha256_hex, outcome_reason_code};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

/// Append-only, hash-chained JSONL log of terminal message outcomes.
pub struct AuditJsonl {
    file: Arc<Mutex<tokio::fs::File>>,
    immutable_mirror: Option<Arc<Mutex<tokio::fs::File>>>,
    last_hash: Arc<Mutex<Option<String>>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AuditRecord {
    pub audit_id: String,
    pub run_id: String,
    pub message_id: String,
    pub action: String,
    pub result: String,
    pub reason_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credit_amount: Option<f64>,
    pub included_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_posted: Option<bool>,
    pub ts: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    pub record_hash: String,
}

impl AuditRecord {
    pub fn for_outcome(
        run_id: &str,
        message_id: &str,
        outcome: &MessageOutcome,
        reply_posted: Option<bool>,
    ) -> Self {
        Self {
            audit_id: format!("audit_{}", uuid::Uuid::new_v4().as_simple()),
            run_id: run_id.to_string(),
            message_id: message_id.to_string(),
            action: "process_message".to_string(),
            result: outcome.kind().as_str().to_string(),
            reason_code: outcome_reason_code(outcome).to_string(),
            credit_amount: outcome.total(),
            included_count: outcome.included_count(),
            reply_posted,
            ts: Utc::now().to_rfc3339(),
            prev_hash: None,
            record_hash: String::new(),
        }
    }

    fn seal_hash(&self) -> Result<String, String> {
        let mut seeded = self.clone();
        seeded.record_hash.clear();
        let value = serde_json::to_value(&seeded).map_err(|e| e.to_string())?;
        jcs_sha256_hex(&value)
    }
}

impl AuditJsonl {
    pub async fn new(path: &str, immutable_mirror_path: Option<&str>) -> Result<Self, String> {
        let last_hash = std::fs::read_to_string(path).ok().and_then(|text| {
            text.lines().rev().find_map(|line| {
                serde_json::from_str::<serde_json::Value>(line)
                    .ok()
                    .and_then(|v| {
                        v.get("record_hash")
                            .and_then(|hash| hash.as_str())
                            .map(|s| s.to_string())
                    })
            })
        });

        let file = open_append(path).await?;
        let immutable_mirror = match immutable_mirror_path {
            Some(path) if !path.is_empty() => Some(Arc::new(Mutex::new(open_append(path).await?))),
            _ => None,
        };

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            immutable_mirror,
            last_hash: Arc::new(Mutex::new(last_hash)),
        })
    }

    /// Chains `rec` onto the previous record and appends it. Write failures
    /// are logged; auditing never fails a run.
    pub async fn append(&self, mut rec: AuditRecord) {
        // Held across the write so concurrent appends keep the chain linear.
        let mut last_hash = self.last_hash.lock().await;
        rec.prev_hash = last_hash.clone();
        rec.record_hash = match rec.seal_hash() {
            Ok(hash) => hash,
            Err(err) => {
                warn!(audit_id = %rec.audit_id, error = %err, "audit record could not be hashed");
                return;
            }
        };
        let line = match serde_json::to_string(&rec) {
            Ok(line) => line,
            Err(err) => {
                warn!(audit_id = %rec.audit_id, error = %err, "audit record could not be encoded");
                return;
            }
        };

        {
            let mut file = self.file.lock().await;
            if let Err(err) = write_line(&mut file, &line).await {
                warn!(audit_id = %rec.audit_id, error = %err, "audit append failed");
                return;
            }
        }
        if let Some(mirror) = &self.immutable_mirror {
            let mut mirror_file = mirror.lock().await;
            if let Err(err) = write_line(&mut mirror_file, &line).await {
                warn!(audit_id = %rec.audit_id, error = %err, "audit mirror append failed");
            }
        }
        *last_hash = Some(rec.record_hash);
    }
}

async fn open_append(path: &str) -> Result<tokio::fs::File, String> {
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| format!("create {}: {e}", parent.display()))?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| format!("open {path}: {e}"))
}

async fn write_line(file: &mut tokio::fs::File, line: &str) -> std::io::Result<()> {
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await
}

pub fn verify_audit_chain(path: &str) -> Result<String, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let mut prev: Option<String> = None;
    let mut count = 0usize;

    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let rec: AuditRecord = serde_json::from_str(line)
            .map_err(|e| format!("line {} parse failed: {e}", idx + 1))?;
        if count > 0 && rec.prev_hash != prev {
            return Err(format!(
                "line {} prev_hash mismatch: expected {:?}, got {:?}",
                idx + 1,
                prev,
                rec.prev_hash
            ));
        }
        let expected_hash = rec
            .seal_hash()
            .map_err(|e| format!("line {} hash seed failed: {e}", idx + 1))?;
        if rec.record_hash != expected_hash {
            return Err(format!(
                "line {} record_hash mismatch: expected {}, got {}",
                idx + 1,
                expected_hash,
                rec.record_hash
            ));
        }
        prev = Some(rec.record_hash);
        count += 1;
    }

    Ok(format!("audit chain verified: {count} records"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use creditbot_contracts::RejectionReason;

    fn succeeded() -> MessageOutcome {
        MessageOutcome::Succeeded {
            total: 35.5,
            included: vec![],
        }
    }

    #[tokio::test]
    async fn appended_records_form_a_verifiable_chain() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit").join("creditbot.jsonl");
        let path = path.to_str().unwrap();
        let mirror = dir.path().join("mirror.jsonl");

        let audit = AuditJsonl::new(path, mirror.to_str()).await.unwrap();
        audit
            .append(AuditRecord::for_outcome("run_1", "1.0001", &succeeded(), Some(true)))
            .await;
        audit
            .append(AuditRecord::for_outcome(
                "run_1",
                "1.0002",
                &MessageOutcome::Rejected {
                    reason: RejectionReason::OutOfScope,
                },
                None,
            ))
            .await;
        drop(audit);

        // Reopening continues the chain from the last stored hash.
        let audit = AuditJsonl::new(path, None).await.unwrap();
        audit
            .append(AuditRecord::for_outcome("run_2", "1.0003", &succeeded(), Some(false)))
            .await;

        assert_eq!(
            verify_audit_chain(path).unwrap(),
            "audit chain verified: 3 records"
        );
        assert_eq!(
            verify_audit_chain(mirror.to_str().unwrap()).unwrap(),
            "audit chain verified: 2 records"
        );

        let text = std::fs::read_to_string(path).unwrap();
        let first: AuditRecord = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(first.reason_code, "credit_computed");
        assert_eq!(first.credit_amount, Some(35.5));
        assert_eq!(first.prev_hash, None);
    }

    #[tokio::test]
    async fn tampered_record_fails_verification() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.jsonl");
        let path = path.to_str().unwrap();
        let audit = AuditJsonl::new(path, None).await.unwrap();
        audit
            .append(AuditRecord::for_outcome("run_1", "1.0001", &succeeded(), Some(true)))
            .await;
        drop(audit);

        let tampered = std::fs::read_to_string(path)
            .unwrap()
            .replace("35.5", "355.0");
        std::fs::write(path, tampered).unwrap();
        let err = verify_audit_chain(path).unwrap_err();
        assert!(err.contains("record_hash mismatch"), "{err}");
    }
}
