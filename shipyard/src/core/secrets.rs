//! Credential-like pattern scanning over unified diffs.

use std::sync::LazyLock;

use regex::Regex;

struct Rule {
    name: &'static str,
    pattern: Regex,
}

static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    [
        ("aws-access-key", r"\b(?:AKIA|ASIA)[0-9A-Z]{16}\b"),
        ("github-token", r"\bgh[pousr]_[A-Za-z0-9]{36,}\b"),
        ("slack-token", r"\bxox[abprs]-[A-Za-z0-9-]{10,}"),
        (
            "private-key",
            r"-----BEGIN (?:RSA |EC |DSA |OPENSSH |PGP )?PRIVATE KEY( BLOCK)?-----",
        ),
        (
            "generic-secret",
            r#"(?i)\b(?:api[_-]?key|secret|passwd|password|access[_-]?token|auth[_-]?token)\b\s*[:=]\s*["'][^"'\s]{12,}["']"#,
        ),
    ]
    .into_iter()
    .map(|(name, pattern)| Rule {
        name,
        pattern: Regex::new(pattern).expect("secret regex should compile"),
    })
    .collect()
});

/// One suspicious added line. The matched value itself is never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretFinding {
    pub file: String,
    /// 1-based line number in the new file, when the hunk header was parsed.
    pub line: Option<u32>,
    pub rule: &'static str,
}

impl std::fmt::Display for SecretFinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{line} ({})", self.file, self.rule),
            None => write!(f, "{} ({})", self.file, self.rule),
        }
    }
}

/// Scan the added lines of a unified diff.
pub fn scan_diff(diff: &str) -> Vec<SecretFinding> {
    let mut findings = Vec::new();
    let mut file = String::new();
    let mut next_line: Option<u32> = None;

    for raw in diff.lines() {
        if let Some(path) = raw.strip_prefix("+++ ") {
            file = path.strip_prefix("b/").unwrap_or(path).to_string();
            next_line = None;
            continue;
        }
        if raw.starts_with("--- ") {
            continue;
        }
        if let Some(header) = raw.strip_prefix("@@ ") {
            next_line = parse_new_start(header);
            continue;
        }
        if let Some(added) = raw.strip_prefix('+') {
            for rule in RULES.iter() {
                if rule.pattern.is_match(added) {
                    findings.push(SecretFinding {
                        file: file.clone(),
                        line: next_line,
                        rule: rule.name,
                    });
                }
            }
            next_line = next_line.map(|n| n + 1);
        } else if !raw.starts_with('-') && !raw.starts_with('\\') {
            next_line = next_line.map(|n| n + 1);
        }
    }
    findings
}

/// `-a,b +c,d @@` -> `c`.
fn parse_new_start(header: &str) -> Option<u32> {
    let plus = header.split_whitespace().find(|part| part.starts_with('+'))?;
    plus[1..].split(',').next()?.parse().ok()
}
