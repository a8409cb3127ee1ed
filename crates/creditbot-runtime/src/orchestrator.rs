use std::sync::Arc;

use chrono::Utc;
use creditbot_contracts::{
    ChatMessage, ComputeOutcome, MessageOutcome, ParsedRequest, RejectionReason,
    ReportReference, RunReport,
};
use creditbot_kernel::{
    amount_outcome, approval_reply, clarification_reply, escalation_message, parse_request,
    processed_record, query_fingerprint, reply_failure_escalation, CreditTally, QueryClassifier,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::audit::{AuditJsonl, AuditRecord};
use crate::collaborators::{CollaboratorError, Collaborators};
use crate::state_store::StateStore;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("fetching channel messages failed: {0}")]
    Fetch(#[source] CollaboratorError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Fetching,
    Filtering,
    ProcessingMessage(usize),
    Posting,
    PersistingState,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub bot_name: String,
    pub bot_user_id: Option<String>,
    pub operator_user_id: Option<String>,
    pub bi_domain: String,
    pub fetch_limit: usize,
    pub max_entries: usize,
}

pub struct Orchestrator {
    settings: OrchestratorSettings,
    classifier: QueryClassifier,
    collaborators: Collaborators,
    audit: Option<Arc<AuditJsonl>>,
}

impl Orchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        classifier: QueryClassifier,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            settings,
            classifier,
            collaborators,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditJsonl>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// One invocation: fetch, process every unprocessed message in arrival
    /// order, then record the check time and apply retention. Callers must
    /// not run two invocations against the same store concurrently.
    pub async fn run_once(&self, store: &mut StateStore) -> Result<RunReport, RunError> {
        let run_id = format!("run_{}", uuid::Uuid::new_v4().as_simple());
        let mut report = RunReport {
            run_id: run_id.clone(),
            started_at: Utc::now().to_rfc3339(),
            ..RunReport::default()
        };

        phase(&run_id, RunPhase::Fetching);
        let messages = self
            .collaborators
            .source
            .fetch_recent(self.settings.fetch_limit)
            .await
            .map_err(RunError::Fetch)?;
        report.fetched = messages.len();

        phase(&run_id, RunPhase::Filtering);
        let pending = store.filter_unprocessed(&messages);
        report.unprocessed = pending.len();
        info!(
            run_id = %run_id,
            fetched = report.fetched,
            unprocessed = report.unprocessed,
            "fetched channel messages"
        );

        for (idx, message) in pending.into_iter().enumerate() {
            if store.is_processed(&message.id) {
                debug!(run_id = %run_id, message_id = %message.id, "duplicate id in fetch; already handled");
                continue;
            }
            phase(&run_id, RunPhase::ProcessingMessage(idx));
            let Some(request) = parse_request(
                message,
                self.settings.bot_user_id.as_deref(),
                &self.settings.bi_domain,
            ) else {
                debug!(run_id = %run_id, message_id = %message.id, "skipping bot-authored message");
                report.skipped += 1;
                continue;
            };

            let outcome = self.process_request(&run_id, &request).await;
            phase(&run_id, RunPhase::Posting);
            let reply_posted = self.deliver(&run_id, &request, &outcome).await;

            phase(&run_id, RunPhase::PersistingState);
            let now = Utc::now();
            store
                .mark_processed(&request.message_id, processed_record(&outcome, reply_posted, now))
                .await;
            self.audit(&run_id, message, &outcome, reply_posted).await;

            match &outcome {
                MessageOutcome::Succeeded { total, .. } => {
                    report.succeeded += 1;
                    report.total_credit += total;
                }
                MessageOutcome::Rejected { .. } => report.rejected += 1,
                MessageOutcome::Failed { .. } => report.failed += 1,
            }
        }

        phase(&run_id, RunPhase::PersistingState);
        store.update_last_check(Utc::now()).await;
        report.pruned = store.prune(self.settings.max_entries).await;
        report.total_processed = store.stats().total_processed;
        report.finished_at = Utc::now().to_rfc3339();
        phase(&run_id, RunPhase::Idle);

        info!(
            run_id = %report.run_id,
            fetched = report.fetched,
            unprocessed = report.unprocessed,
            skipped = report.skipped,
            succeeded = report.succeeded,
            rejected = report.rejected,
            failed = report.failed,
            total_credit = report.total_credit,
            total_processed = report.total_processed,
            pruned = report.pruned,
            "run finished"
        );
        Ok(report)
    }

    /// Aggregates the references of one message. Per-reference failures are
    /// recorded and never abort the remaining references.
    pub async fn process_references(&self, references: &[ReportReference]) -> MessageOutcome {
        self.tally_references(references).await.finish()
    }

    async fn tally_references(&self, references: &[ReportReference]) -> CreditTally {
        let mut tally = CreditTally::new();
        for reference in references {
            let outcome = self.compute_reference(reference).await;
            tally.record(reference, outcome);
        }
        tally
    }

    async fn process_request(&self, run_id: &str, request: &ParsedRequest) -> MessageOutcome {
        if !request.has_references() {
            return MessageOutcome::Rejected {
                reason: RejectionReason::NoReportReference,
            };
        }
        let tally = self.tally_references(&request.references).await;
        let (seen, out_of_scope) = (tally.seen(), tally.skipped());
        let outcome = tally.finish();
        debug!(
            run_id,
            message_id = %request.message_id,
            references = seen,
            out_of_scope,
            status = outcome.kind().as_str(),
            "message aggregated"
        );
        outcome
    }

    async fn compute_reference(&self, reference: &ReportReference) -> ComputeOutcome {
        let query = match self.collaborators.resolver.resolve_query(reference).await {
            Ok(query) => query,
            Err(err) => {
                warn!(reference = %reference, error = %err, "report resolution failed");
                return ComputeOutcome::Failed(format!("could not resolve report: {err}"));
            }
        };
        if query.trim().is_empty() {
            return ComputeOutcome::Failed("report resolved to an empty query".to_string());
        }

        let fingerprint = query_fingerprint(&query);
        if !self.classifier.is_in_scope(&query) {
            debug!(reference = %reference, query = %fingerprint, "query out of scope; skipping");
            return ComputeOutcome::NotApplicable;
        }

        match self.collaborators.engine.compute(&query).await {
            Ok(result) => {
                debug!(
                    reference = %reference,
                    query = %fingerprint,
                    amount = result.amount,
                    "credit computed"
                );
                amount_outcome(result.amount)
            }
            Err(err) => {
                warn!(reference = %reference, query = %fingerprint, error = %err, "credit computation failed");
                ComputeOutcome::Failed(format!("credit computation failed: {err}"))
            }
        }
    }

    // Returns whether a thread reply was posted; `None` when no reply was due.
    async fn deliver(
        &self,
        run_id: &str,
        request: &ParsedRequest,
        outcome: &MessageOutcome,
    ) -> Option<bool> {
        match outcome {
            MessageOutcome::Succeeded { total, .. } => {
                let text = approval_reply(*total);
                match self
                    .collaborators
                    .replies
                    .post_reply(&request.message_id, &text)
                    .await
                {
                    Ok(()) => {
                        info!(run_id, message_id = %request.message_id, total, "approval posted");
                        Some(true)
                    }
                    Err(err) => {
                        warn!(run_id, message_id = %request.message_id, error = %err, "approval reply failed");
                        let text =
                            reply_failure_escalation(&self.settings.bot_name, request, *total);
                        self.escalate(run_id, &request.message_id, &text).await;
                        Some(false)
                    }
                }
            }
            MessageOutcome::Rejected {
                reason: RejectionReason::NoReportReference,
            } => {
                match self
                    .collaborators
                    .replies
                    .post_reply(&request.message_id, clarification_reply())
                    .await
                {
                    Ok(()) => Some(true),
                    Err(err) => {
                        warn!(run_id, message_id = %request.message_id, error = %err, "clarification reply failed");
                        Some(false)
                    }
                }
            }
            MessageOutcome::Rejected {
                reason: RejectionReason::OutOfScope,
            } => {
                debug!(run_id, message_id = %request.message_id, "no in-scope queries; staying silent");
                None
            }
            MessageOutcome::Failed { reasons } => {
                let text = escalation_message(&self.settings.bot_name, request, reasons);
                self.escalate(run_id, &request.message_id, &text).await;
                None
            }
        }
    }

    async fn escalate(&self, run_id: &str, message_id: &str, text: &str) {
        let Some(operator) = self.settings.operator_user_id.as_deref() else {
            warn!(run_id, message_id, escalation = %text, "no operator configured; escalation only logged");
            return;
        };
        if let Err(err) = self
            .collaborators
            .replies
            .send_direct(operator, text)
            .await
        {
            warn!(run_id, message_id, error = %err, "operator escalation failed");
        }
    }

    async fn audit(
        &self,
        run_id: &str,
        message: &ChatMessage,
        outcome: &MessageOutcome,
        reply_posted: Option<bool>,
    ) {
        if let Some(audit) = &self.audit {
            audit
                .append(AuditRecord::for_outcome(
                    run_id,
                    &message.id,
                    outcome,
                    reply_posted,
                ))
                .await;
        }
    }
}

fn phase(run_id: &str, phase: RunPhase) {
    debug!(run_id, phase = ?phase, "run phase");
}
