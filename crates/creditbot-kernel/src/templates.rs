use creditbot_contracts::{MessageOutcome, ParsedRequest, RejectionReason};

pub fn approval_reply(total: f64) -> String {
    format!("Approved, ${total:.2}, exceptions")
}

pub fn clarification_reply() -> &'static str {
    ":warning: Please provide a Looker report link for processing."
}

pub fn escalation_message(bot_name: &str, request: &ParsedRequest, reasons: &[String]) -> String {
    let mut text = format!(
        ":warning: {bot_name} could not process a credit request\n\nMessage: {}\nRequester: {}\n",
        request.message_id,
        request.requester_id.as_deref().unwrap_or("unknown"),
    );
    for reason in reasons {
        text.push_str(&format!("Error: {reason}\n"));
    }
    text.push_str("\nPlease review manually.");
    text
}

pub fn reply_failure_escalation(bot_name: &str, request: &ParsedRequest, total: f64) -> String {
    format!(
        ":warning: {bot_name} computed a credit of ${total:.2} for message {} but could not post the reply.\n\nPlease post it manually.",
        request.message_id
    )
}

pub fn outcome_reason_code(outcome: &MessageOutcome) -> &'static str {
    match outcome {
        MessageOutcome::Succeeded { .. } => "credit_computed",
        MessageOutcome::Rejected { reason } => match reason {
            RejectionReason::NoReportReference => "no_report_reference",
            RejectionReason::OutOfScope => "out_of_scope",
        },
        MessageOutcome::Failed { .. } => "all_references_failed",
    }
}
