//! Alert prompt injection and response parsing.

use std::collections::HashMap;

use regex::RegexBuilder;
use tracing::warn;

use crate::database::models::AlertRuleDbModel;

const ALERT_SECTION_HEADER: &str = "\n\nAdditionally, evaluate the following alert conditions and respond with TRUE or FALSE on the last line for each (one per line, format: \"ALERT_ID: TRUE/FALSE\"):\n";

/// Append the alert instruction block for `rules` to `preprompt`.
///
/// With no rules the preprompt is returned unchanged.
pub fn build_prompt(preprompt: &str, rules: &[AlertRuleDbModel]) -> String {
    if rules.is_empty() {
        return preprompt.to_string();
    }

    let mut prompt =
        String::with_capacity(preprompt.len() + ALERT_SECTION_HEADER.len() + rules.len() * 64);
    prompt.push_str(preprompt);
    prompt.push_str(ALERT_SECTION_HEADER);
    for rule in rules {
        prompt.push_str(&format!("- {}: {}\n", rule.id, rule.query_text));
    }
    prompt
}

/// Read `ALERT_ID: TRUE|FALSE` verdicts from the end of `text`.
///
/// Only the last `scan_lines` lines are considered, newest first; for each
/// id the last line that mentions it decides. Ids without a verdict are
/// `false`.
pub fn parse_alert_responses(
    text: &str,
    alert_ids: &[&str],
    scan_lines: usize,
) -> HashMap<String, bool> {
    let mut results: HashMap<String, bool> =
        alert_ids.iter().map(|id| (id.to_string(), false)).collect();

    let lines: Vec<&str> = text.lines().collect();
    let tail = &lines[lines.len().saturating_sub(scan_lines)..];

    for id in alert_ids {
        let pattern = format!(
            r#"(?:^|[^0-9a-z_-]){}[\s*`"']*:[\s*`"']*(TRUE|FALSE)\b"#,
            regex::escape(id)
        );
        let re = match RegexBuilder::new(&pattern).case_insensitive(true).build() {
            Ok(re) => re,
            Err(e) => {
                warn!(alert_id = %id, error = %e, "Cannot build alert pattern");
                continue;
            }
        };

        let verdict = tail
            .iter()
            .rev()
            .find_map(|line| re.captures(line))
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().eq_ignore_ascii_case("TRUE"));
        if let Some(verdict) = verdict {
            results.insert(id.to_string(), verdict);
        }
    }

    results
}

/// First `max_chars` characters of `text`.
pub fn snippet(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_prompt_without_rules_is_preprompt() {
        assert_eq!(build_prompt("describe", &[]), "describe");
    }

    #[test]
    fn test_prompt_lists_rules() {
        let mut a = AlertRuleDbModel::new("person running", true);
        a.id = "a1".into();
        let mut b = AlertRuleDbModel::new("door open", true);
        b.id = "a2".into();

        let prompt = build_prompt("describe", &[a, b]);
        assert!(prompt.starts_with("describe\n\nAdditionally, evaluate"));
        assert!(prompt.ends_with("- a1: person running\n- a2: door open\n"));
    }

    #[test]
    fn test_parse_defaults_unmatched_to_false() {
        let text = "People are reading.\nNobody runs.\na1: TRUE\na2: FALSE";
        let results = parse_alert_responses(text, &["a1", "a2", "a3"], 10);
        assert_eq!(results.len(), 3);
        assert!(results["a1"]);
        assert!(!results["a2"]);
        assert!(!results["a3"]);
    }

    #[test]
    fn test_parse_is_case_insensitive_and_tolerates_markup() {
        let text = "summary\n- **A1**: true\n`a2` : False";
        let results = parse_alert_responses(text, &["a1", "a2"], 10);
        assert!(results["a1"]);
        assert!(!results["a2"]);
    }

    #[test]
    fn test_parse_only_scans_tail() {
        let mut text = String::from("a1: TRUE\n");
        for i in 0..10 {
            text.push_str(&format!("line {i}\n"));
        }
        assert!(!parse_alert_responses(&text, &["a1"], 10)["a1"]);
        assert!(parse_alert_responses(&text, &["a1"], 11)["a1"]);
    }

    #[test]
    fn test_parse_last_line_wins() {
        let text = "a1: TRUE\na1: FALSE";
        assert!(!parse_alert_responses(text, &["a1"], 10)["a1"]);
    }

    #[test]
    fn test_parse_does_not_match_longer_ids() {
        let text = "xa1: TRUE\na10: TRUE";
        assert!(!parse_alert_responses(text, &["a1"], 10)["a1"]);
    }

    #[test]
    fn test_snippet_respects_char_boundaries() {
        assert_eq!(snippet("héllo", 2), "hé");
        assert_eq!(snippet("short", 200), "short");
    }

    proptest! {
        #[test]
        fn prop_every_id_gets_a_verdict(text in ".{0,400}", n in 0usize..6) {
            let ids: Vec<String> = (0..n).map(|i| format!("id{i}")).collect();
            let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
            let results = parse_alert_responses(&text, &refs, 10);
            prop_assert_eq!(results.len(), n);
        }
    }
}
