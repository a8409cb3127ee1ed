use std::sync::OnceLock;

use creditbot_contracts::{ChatMessage, ParsedRequest, ReportReference};
use regex::Regex;
use url::Url;

// Slack renders links as `<url>` or `<url|label>`.
fn slack_link() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"<(https?://[^|>\s]+)(?:\|[^>]*)?>").expect("slack link pattern compiles")
    })
}

/// Returns `None` for messages the bot must never act on (its own or any
/// other bot's). A human message without report links still parses.
pub fn parse_request(
    message: &ChatMessage,
    bot_user_id: Option<&str>,
    bi_domain: &str,
) -> Option<ParsedRequest> {
    if message.is_bot {
        return None;
    }
    if let (Some(author), Some(bot)) = (message.author_id.as_deref(), bot_user_id) {
        if author == bot {
            return None;
        }
    }
    Some(ParsedRequest {
        message_id: message.id.clone(),
        requester_id: message.author_id.clone(),
        references: extract_report_references(&message.text, bi_domain),
        text: message.text.clone(),
    })
}

pub fn extract_report_references(text: &str, bi_domain: &str) -> Vec<ReportReference> {
    slack_link()
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().replace("&amp;", "&"))
        .filter(|url| host_matches(url, bi_domain))
        .map(ReportReference)
        .collect()
}

/// True when the URL's host is `domain` or one of its subdomains.
pub fn host_matches(url: &str, domain: &str) -> bool {
    let domain = domain.trim().trim_start_matches('.').to_ascii_lowercase();
    if domain.is_empty() {
        return false;
    }
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    host == domain || host.ends_with(&format!(".{domain}"))
}

/// Look id of a `/looks/<id>` report URL.
pub fn extract_look_id(reference: &ReportReference) -> Result<String, String> {
    let parsed = Url::parse(reference.as_str())
        .map_err(|e| format!("unparseable report link {reference}: {e}"))?;
    let segments: Vec<&str> = parsed
        .path_segments()
        .map(|s| s.filter(|v| !v.is_empty()).collect())
        .unwrap_or_default();

    if let Some(pos) = segments.iter().position(|s| *s == "looks") {
        if let Some(id) = segments.get(pos + 1) {
            return Ok(id.to_string());
        }
    }
    if segments.first() == Some(&"x") {
        return Err(format!(
            "short link {reference} is not supported; share the full Look URL"
        ));
    }
    Err(format!("no Look id in report link {reference}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(text: &str) -> ChatMessage {
        ChatMessage {
            id: "1700000000.000100".to_string(),
            text: text.to_string(),
            author_id: Some("U-REQ".to_string()),
            is_bot: false,
        }
    }

    #[test]
    fn keeps_all_report_links_in_order() {
        let text = "please credit <https://acme.cloud.looker.com/looks/12|first> and \
                    <https://zendesk.example.com/tickets/9|ticket> plus \
                    <https://acme.cloud.looker.com/looks/34>";
        let refs = extract_report_references(text, "looker.com");
        assert_eq!(
            refs,
            vec![
                ReportReference("https://acme.cloud.looker.com/looks/12".to_string()),
                ReportReference("https://acme.cloud.looker.com/looks/34".to_string()),
            ]
        );
    }

    #[test]
    fn decodes_slack_escaped_ampersands() {
        let refs = extract_report_references(
            "<https://acme.looker.com/looks/7?a=1&amp;b=2|look>",
            "looker.com",
        );
        assert_eq!(refs[0].as_str(), "https://acme.looker.com/looks/7?a=1&b=2");
    }

    #[test]
    fn host_must_match_domain_not_just_contain_it() {
        assert!(host_matches("https://looker.com/looks/1", "looker.com"));
        assert!(host_matches("https://A.Cloud.Looker.com/looks/1", "looker.com"));
        assert!(!host_matches("https://notlooker.com/looks/1", "looker.com"));
        assert!(!host_matches("https://evil.example/?u=looker.com", "looker.com"));
        assert!(!host_matches("not a url", "looker.com"));
    }

    #[test]
    fn bare_urls_are_not_report_links() {
        let refs = extract_report_references("https://acme.looker.com/looks/1", "looker.com");
        assert!(refs.is_empty());
    }

    #[test]
    fn bot_messages_are_discarded() {
        let mut own = message("<https://acme.looker.com/looks/1>");
        own.author_id = Some("U-BOT".to_string());
        assert!(parse_request(&own, Some("U-BOT"), "looker.com").is_none());

        let mut other_bot = message("hello");
        other_bot.is_bot = true;
        assert!(parse_request(&other_bot, Some("U-BOT"), "looker.com").is_none());
    }

    #[test]
    fn message_without_links_still_parses() {
        let parsed = parse_request(&message("can I get a credit?"), Some("U-BOT"), "looker.com")
            .expect("human message parses");
        assert_eq!(parsed.message_id, "1700000000.000100");
        assert_eq!(parsed.requester_id.as_deref(), Some("U-REQ"));
        assert!(!parsed.has_references());
    }

    #[test]
    fn look_id_extraction() {
        let look = ReportReference("https://acme.looker.com/looks/4521?toggle=fil".to_string());
        assert_eq!(extract_look_id(&look).unwrap(), "4521");

        let short = ReportReference("https://acme.looker.com/x/AbCd123".to_string());
        assert!(extract_look_id(&short).unwrap_err().contains("short link"));

        let dash = ReportReference("https://acme.looker.com/dashboards/9".to_string());
        assert!(extract_look_id(&dash).unwrap_err().contains("no Look id"));
    }
}
