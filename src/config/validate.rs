//! Configuration validation with unknown field detection.
//!
//! Works on the raw JSON value so typos that serde would silently ignore
//! (thanks to `#[serde(default)]`) are still reported.

use serde_json::{Map, Value};
use std::collections::HashSet;

/// Known top-level config field names.
const KNOWN_TOP_LEVEL: &[&str] = &[
    "agents",
    "bus",
    "summarization",
    "delegation",
    "security",
    "skills",
    "memory",
    "heartbeat",
    "retry",
    "logging",
];

const KNOWN_AGENTS_DEFAULTS: &[&str] = &[
    "name",
    "workspace",
    "model",
    "max_tokens",
    "temperature",
    "max_tool_iterations",
    "agent_timeout_secs",
    "context_window",
    "workers",
    "persist_retries",
    "reply_suppression",
];

const KNOWN_BUS: &[&str] = &[
    "inbound_capacity",
    "outbound_capacity",
    "inbound_overflow",
    "outbound_overflow",
];

const KNOWN_SUMMARIZATION: &[&str] = &[
    "enabled",
    "message_threshold",
    "token_ratio",
    "keep_recent",
    "oversized_ratio",
];

/// A validation diagnostic.
#[derive(Debug)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub path: String,
    pub message: String,
}

#[derive(Debug, PartialEq)]
pub enum DiagnosticLevel {
    Ok,
    Warn,
    Error,
}

impl Diagnostic {
    fn error(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Error,
            path: path.into(),
            message: message.into(),
        }
    }

    fn ok(message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Ok,
            path: String::new(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = match self.level {
            DiagnosticLevel::Ok => "[OK]",
            DiagnosticLevel::Warn => "[WARN]",
            DiagnosticLevel::Error => "[ERROR]",
        };
        if self.path.is_empty() {
            write!(f, "{} {}", prefix, self.message)
        } else {
            write!(f, "{} {}: {}", prefix, self.path, self.message)
        }
    }
}

/// Levenshtein distance for "did you mean?" suggestions.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            cur[j + 1] = (prev[j + 1] + 1).min(cur[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

/// Suggest the closest known field name (if distance <= 3).
pub fn suggest_field(unknown: &str, known: &[&str]) -> Option<String> {
    known
        .iter()
        .map(|k| (k, levenshtein(unknown, k)))
        .filter(|(_, d)| *d <= 3)
        .min_by_key(|(_, d)| *d)
        .map(|(k, _)| format!("did you mean '{}'?", k))
}

fn check_keys(
    obj: &Map<String, Value>,
    known: &[&str],
    prefix: &str,
    out: &mut Vec<Diagnostic>,
) -> bool {
    let known_set: HashSet<&str> = known.iter().copied().collect();
    let mut found_unknown = false;
    for key in obj.keys() {
        if known_set.contains(key.as_str()) {
            continue;
        }
        found_unknown = true;
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        let msg = match suggest_field(key, known) {
            Some(suggestion) => format!("Unknown field '{}', {}", key, suggestion),
            None => format!("Unknown field '{}'", key),
        };
        out.push(Diagnostic::error(path, msg));
    }
    found_unknown
}

fn section<'a>(obj: &'a Map<String, Value>, name: &str) -> Option<&'a Map<String, Value>> {
    obj.get(name).and_then(Value::as_object)
}

fn check_ratio(obj: &Map<String, Value>, key: &str, path: &str, out: &mut Vec<Diagnostic>) {
    if let Some(v) = obj.get(key).and_then(Value::as_f64) {
        if !(v > 0.0 && v <= 1.0) {
            out.push(Diagnostic::error(
                format!("{}.{}", path, key),
                format!("must be in (0, 1], got {}", v),
            ));
        }
    }
}

fn check_positive(obj: &Map<String, Value>, key: &str, path: &str, out: &mut Vec<Diagnostic>) {
    if obj.get(key).and_then(Value::as_u64) == Some(0) {
        out.push(Diagnostic::error(
            format!("{}.{}", path, key),
            "must be greater than 0",
        ));
    }
}

/// Validate a raw JSON config value: unknown fields and out-of-range values.
pub fn validate_config(raw: &Value) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    let obj = match raw.as_object() {
        Some(o) => o,
        None => {
            diagnostics.push(Diagnostic::error("", "Config must be a JSON object"));
            return diagnostics;
        }
    };

    diagnostics.push(Diagnostic::ok("Valid JSON"));

    let mut has_unknown = check_keys(obj, KNOWN_TOP_LEVEL, "", &mut diagnostics);

    if let Some(defaults) = section(obj, "agents").and_then(|a| section(a, "defaults")) {
        has_unknown |= check_keys(
            defaults,
            KNOWN_AGENTS_DEFAULTS,
            "agents.defaults",
            &mut diagnostics,
        );
        check_positive(defaults, "workers", "agents.defaults", &mut diagnostics);
        check_positive(defaults, "context_window", "agents.defaults", &mut diagnostics);
    }

    if let Some(bus) = section(obj, "bus") {
        has_unknown |= check_keys(bus, KNOWN_BUS, "bus", &mut diagnostics);
        check_positive(bus, "inbound_capacity", "bus", &mut diagnostics);
        check_positive(bus, "outbound_capacity", "bus", &mut diagnostics);
    }

    if let Some(summ) = section(obj, "summarization") {
        has_unknown |= check_keys(summ, KNOWN_SUMMARIZATION, "summarization", &mut diagnostics);
        check_ratio(summ, "token_ratio", "summarization", &mut diagnostics);
        check_ratio(summ, "oversized_ratio", "summarization", &mut diagnostics);
        check_positive(summ, "keep_recent", "summarization", &mut diagnostics);
    }

    if let Some(patterns) = section(obj, "security")
        .and_then(|s| s.get("deny_patterns"))
        .and_then(Value::as_array)
    {
        for (i, p) in patterns.iter().enumerate() {
            if let Some(p) = p.as_str() {
                if let Err(e) = regex::Regex::new(p) {
                    diagnostics.push(Diagnostic::error(
                        format!("security.deny_patterns[{}]", i),
                        format!("invalid regex: {}", e),
                    ));
                }
            }
        }
    }

    if !has_unknown {
        diagnostics.push(Diagnostic::ok("All fields recognized"));
    }

    diagnostics
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn errors(diags: &[Diagnostic]) -> Vec<&Diagnostic> {
        diags
            .iter()
            .filter(|d| d.level == DiagnosticLevel::Error)
            .collect()
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("hello", "hello"), 0);
        assert_eq!(levenshtein("hello", "helo"), 1);
        assert_eq!(levenshtein("", "abc"), 3);
        assert!(levenshtein("hello", "world") > 3);
    }

    #[test]
    fn test_suggest_field() {
        let result = suggest_field("agnets", KNOWN_TOP_LEVEL).unwrap();
        assert!(result.contains("agents"));
        assert!(suggest_field("xyzabcdef", KNOWN_TOP_LEVEL).is_none());
    }

    #[test]
    fn test_validate_valid_config() {
        let raw = json!({
            "agents": {"defaults": {"model": "gpt-4", "workers": 2}},
            "bus": {"inbound_capacity": 10, "outbound_overflow": "reject"},
            "summarization": {"token_ratio": 0.75}
        });
        let diags = validate_config(&raw);
        assert!(errors(&diags).is_empty(), "{:?}", diags);
        assert!(diags.iter().any(|d| d.message == "All fields recognized"));
    }

    #[test]
    fn test_validate_unknown_nested_field() {
        let raw = json!({"agents": {"defaults": {"max_tokns": 5}}});
        let diags = validate_config(&raw);
        let errs = errors(&diags);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].path, "agents.defaults.max_tokns");
        assert!(errs[0].message.contains("max_tokens"));
    }

    #[test]
    fn test_validate_ranges() {
        let raw = json!({
            "bus": {"inbound_capacity": 0},
            "summarization": {"token_ratio": 1.5, "keep_recent": 0}
        });
        let diags = validate_config(&raw);
        let paths: Vec<&str> = errors(&diags).iter().map(|d| d.path.as_str()).collect();
        assert!(paths.contains(&"bus.inbound_capacity"));
        assert!(paths.contains(&"summarization.token_ratio"));
        assert!(paths.contains(&"summarization.keep_recent"));
    }

    #[test]
    fn test_validate_bad_deny_pattern() {
        let raw = json!({"security": {"deny_patterns": ["(unclosed"]}});
        let diags = validate_config(&raw);
        assert!(errors(&diags)
            .iter()
            .any(|d| d.path == "security.deny_patterns[0]"));
    }

    #[test]
    fn test_validate_not_an_object() {
        let diags = validate_config(&json!("nope"));
        assert!(diags
            .iter()
            .any(|d| d.level == DiagnosticLevel::Error && d.message.contains("JSON object")));
    }

    #[test]
    fn test_diagnostic_display() {
        let d = Diagnostic::error("bus.x", "bad");
        assert_eq!(d.to_string(), "[ERROR] bus.x: bad");
    }
}
