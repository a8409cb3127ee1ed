use chrono::{DateTime, Utc};
use creditbot_contracts::{
    ComputeOutcome, IncludedReference, MessageOutcome, ProcessedRecord, RejectionReason,
    ReportReference,
};

/// Accumulates per-reference outcomes of one message. Failures never abort
/// the tally; every successful amount is kept.
#[derive(Debug, Default)]
pub struct CreditTally {
    seen: usize,
    skipped: usize,
    total: f64,
    included: Vec<IncludedReference>,
    errors: Vec<String>,
}

impl CreditTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, reference: &ReportReference, outcome: ComputeOutcome) {
        self.seen += 1;
        match outcome {
            ComputeOutcome::Amount(amount) => {
                self.total += amount;
                self.included.push(IncludedReference {
                    reference: reference.clone(),
                    amount,
                });
            }
            ComputeOutcome::NotApplicable => self.skipped += 1,
            ComputeOutcome::Failed(reason) => {
                self.errors.push(format!("report {}: {reason}", self.seen));
            }
        }
    }

    pub fn seen(&self) -> usize {
        self.seen
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn finish(self) -> MessageOutcome {
        if !self.included.is_empty() {
            return MessageOutcome::Succeeded {
                total: self.total,
                included: self.included,
            };
        }
        if self.seen == 0 {
            MessageOutcome::Rejected {
                reason: RejectionReason::NoReportReference,
            }
        } else if !self.errors.is_empty() {
            MessageOutcome::Failed {
                reasons: self.errors,
            }
        } else {
            MessageOutcome::Rejected {
                reason: RejectionReason::OutOfScope,
            }
        }
    }
}

pub fn amount_outcome(amount: f64) -> ComputeOutcome {
    if amount.is_finite() {
        ComputeOutcome::Amount(amount)
    } else {
        ComputeOutcome::Failed(format!("compute engine returned a non-finite amount ({amount})"))
    }
}

pub fn processed_record(
    outcome: &MessageOutcome,
    reply_posted: Option<bool>,
    processed_at: DateTime<Utc>,
) -> ProcessedRecord {
    let error = match outcome {
        MessageOutcome::Succeeded { .. } => None,
        MessageOutcome::Rejected {
            reason: RejectionReason::NoReportReference,
        } => Some("No report link found".to_string()),
        MessageOutcome::Rejected {
            reason: RejectionReason::OutOfScope,
        } => Some("No in-scope queries found".to_string()),
        MessageOutcome::Failed { reasons } => Some(reasons.join("; ")),
    };
    ProcessedRecord {
        success: matches!(outcome, MessageOutcome::Succeeded { .. }),
        credit_amount: outcome.total(),
        error,
        processed_at: processed_at.to_rfc3339(),
        outcome: outcome.kind(),
        included_count: outcome.included_count(),
        reply_posted,
        extra: Default::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use creditbot_contracts::OutcomeKind;

    fn reference(n: usize) -> ReportReference {
        ReportReference(format!("https://acme.looker.com/looks/{n}"))
    }

    fn tally(outcomes: Vec<ComputeOutcome>) -> MessageOutcome {
        let mut tally = CreditTally::new();
        for (idx, outcome) in outcomes.into_iter().enumerate() {
            tally.record(&reference(idx + 1), outcome);
        }
        tally.finish()
    }

    #[test]
    fn partial_failure_still_sums_successes() {
        let outcome = tally(vec![
            ComputeOutcome::Amount(10.00),
            ComputeOutcome::Failed("engine timeout".to_string()),
            ComputeOutcome::Amount(25.50),
        ]);
        match outcome {
            MessageOutcome::Succeeded { total, included } => {
                assert!((total - 35.50).abs() < 1e-9);
                assert_eq!(included.len(), 2);
                assert_eq!(included[1].reference, reference(3));
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn all_failures_fail_with_indexed_reasons() {
        let outcome = tally(vec![
            ComputeOutcome::Failed("a".to_string()),
            ComputeOutcome::Failed("b".to_string()),
        ]);
        assert_eq!(
            outcome,
            MessageOutcome::Failed {
                reasons: vec!["report 1: a".to_string(), "report 2: b".to_string()]
            }
        );
    }

    #[test]
    fn empty_reference_list_is_rejected() {
        assert_eq!(
            tally(vec![]),
            MessageOutcome::Rejected {
                reason: RejectionReason::NoReportReference
            }
        );
    }

    #[test]
    fn only_out_of_scope_references_are_rejected_silently() {
        let mut t = CreditTally::new();
        t.record(&reference(1), ComputeOutcome::NotApplicable);
        assert_eq!(t.seen(), 1);
        assert_eq!(t.skipped(), 1);
        assert_eq!(
            t.finish(),
            MessageOutcome::Rejected {
                reason: RejectionReason::OutOfScope
            }
        );
    }

    #[test]
    fn skipped_and_failed_without_success_is_failed() {
        let outcome = tally(vec![
            ComputeOutcome::NotApplicable,
            ComputeOutcome::Failed("no sql".to_string()),
        ]);
        assert_eq!(
            outcome,
            MessageOutcome::Failed {
                reasons: vec!["report 2: no sql".to_string()]
            }
        );
    }

    #[test]
    fn non_finite_amounts_are_failures() {
        assert_eq!(amount_outcome(12.5), ComputeOutcome::Amount(12.5));
        assert!(matches!(amount_outcome(f64::NAN), ComputeOutcome::Failed(_)));
        assert!(matches!(
            amount_outcome(f64::INFINITY),
            ComputeOutcome::Failed(_)
        ));
    }

    #[test]
    fn record_summarizes_outcome() {
        let at = chrono::DateTime::parse_from_rfc3339("2026-10-19T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let ok = processed_record(
            &MessageOutcome::Succeeded {
                total: 35.5,
                included: vec![],
            },
            Some(true),
            at,
        );
        assert!(ok.success);
        assert_eq!(ok.credit_amount, Some(35.5));
        assert_eq!(ok.outcome, OutcomeKind::Succeeded);
        assert_eq!(ok.processed_at, "2026-10-19T12:00:00+00:00");

        let failed = processed_record(
            &MessageOutcome::Failed {
                reasons: vec!["report 1: a".to_string(), "report 2: b".to_string()],
            },
            None,
            at,
        );
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("report 1: a; report 2: b"));
        assert_eq!(failed.reply_posted, None);
    }
}
