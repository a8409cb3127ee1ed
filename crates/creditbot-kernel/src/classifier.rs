use std::sync::OnceLock;

use regex::Regex;

// Candidate ends of a predicate: boolean connectives, statement end, line end.
fn predicate_boundary() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b(?:and|or)\b|[;\n]").expect("boundary pattern compiles"))
}

/// Decides whether a query belongs to the serviced product line: the keyword
/// must occur inside a predicate on one of the qualifier columns.
#[derive(Debug, Clone)]
pub struct QueryClassifier {
    keyword: String,
    qualifiers: Vec<String>,
}

impl QueryClassifier {
    pub fn new(keyword: &str, qualifiers: &[String]) -> Self {
        Self {
            keyword: keyword.trim().to_lowercase(),
            qualifiers: qualifiers
                .iter()
                .map(|q| normalize(q.trim()))
                .filter(|q| !q.is_empty())
                .collect(),
        }
    }

    pub fn is_in_scope(&self, query: &str) -> bool {
        if self.keyword.is_empty() {
            return false;
        }
        let query = normalize(query);
        if !query.contains(&self.keyword) {
            return false;
        }
        self.qualifiers.iter().any(|qualifier| {
            query.match_indices(qualifier.as_str()).any(|(idx, _)| {
                let rest = &query[idx + qualifier.len()..];
                rest[..predicate_end(rest)].contains(&self.keyword)
            })
        })
    }
}

// A boundary only ends the predicate outside any parenthesis the predicate
// opened, so a multi-line `IN (...)` list stays one predicate.
fn predicate_end(rest: &str) -> usize {
    let mut depth: usize = 0;
    let mut scanned = 0;
    for boundary in predicate_boundary().find_iter(rest) {
        for c in rest[scanned..boundary.start()].chars() {
            match c {
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                _ => {}
            }
        }
        scanned = boundary.start();
        if depth == 0 {
            return boundary.start();
        }
    }
    rest.len()
}

// Lowercase and drop identifier quoting so `"billable_items"."friendly_name"`
// matches `billable_items.friendly_name`.
fn normalize(text: &str) -> String {
    text.to_lowercase().replace(['"', '`'], "")
}
