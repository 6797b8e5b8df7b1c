//! Identity validation and opinion extraction for raw agent output.
//!
//! External CLIs are instructed to begin their reply with `AGENT:<name>`
//! and to speak only as themselves. Everything here is heuristic: the
//! patterns are tuned constants, bilingual (English and Chinese), and not
//! part of the log's contract.

use std::sync::LazyLock;

use regex_lite::Regex;
use roundtable_protocol::Opinion;
use thiserror::Error;

pub const DEFAULT_CONFIDENCE: f64 = 0.7;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("empty output")]
    EmptyOutput,

    #[error("missing AGENT header")]
    MissingHeader,

    #[error("agent mismatch: output claims to be {claimed}")]
    Mismatch { claimed: String },

    #[error("empty body")]
    EmptyBody,

    #[error("output contrasts the agent with itself")]
    SelfContradiction,

    #[error("output claims to be {name}")]
    ForeignIdentity { name: String },
}

static AGENT_HEADER: LazyLock<Regex> = LazyLock::new(|| regex(r"(?i)^AGENT\s*:\s*(.+)$"));

/// Check that `raw` is a well-formed reply from `agent` and return the
/// body (everything after the header line).
pub fn validate_identity(
    raw: &str,
    agent: &str,
    known_agents: &[String],
) -> Result<String, IdentityError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(IdentityError::EmptyOutput);
    }

    let mut lines = raw.lines().skip_while(|line| line.trim().is_empty());
    let header = lines.next().unwrap_or_default().trim();
    let captures = AGENT_HEADER
        .captures(header)
        .ok_or(IdentityError::MissingHeader)?;
    let claimed = captures
        .get(1)
        .map(|m| m.as_str().trim())
        .unwrap_or_default();
    if !claimed.eq_ignore_ascii_case(agent) {
        return Err(IdentityError::Mismatch {
            claimed: claimed.to_string(),
        });
    }

    let body = lines.collect::<Vec<_>>().join("\n");
    let body = body.trim().to_string();
    if body.is_empty() {
        return Err(IdentityError::EmptyBody);
    }

    // "different from <self>" phrasings mean the model is role-playing a
    // counterpart while wearing our header.
    let contradiction = regex(&format!(
        "(?i)与{0}不同|different\\s+from\\s+{0}",
        escape_literal(agent)
    ));
    if contradiction.is_match(&body) {
        return Err(IdentityError::SelfContradiction);
    }

    for other in known_agents {
        if other.eq_ignore_ascii_case(agent) {
            continue;
        }
        let foreign = regex(&format!(
            "(?i)(我是|i\\s+am)\\s*{}",
            escape_literal(other)
        ));
        if foreign.is_match(&body) {
            return Err(IdentityError::ForeignIdentity {
                name: other.clone(),
            });
        }
    }

    Ok(body)
}

/// Ordered first-match-wins opinion patterns. Disagreement is tested
/// before agreement so that "disagree" / "不同意" never reads as assent.
static OPINION_PATTERNS: LazyLock<Vec<(Regex, Opinion)>> = LazyLock::new(|| {
    let table: &[(&str, Opinion)] = &[
        (
            r"(?i)\bdisagree\b|\bdon'?t\s+agree\b|\bdo\s+not\s+agree\b|不同意|不赞成|反对",
            Opinion::Disagree,
        ),
        (r"(?i)\bagreed?\b|同意|赞成|认同", Opinion::Agree),
        (
            r"(?i)\balternative(?:ly)?\b|\binstead\b|另一种|替代方案|换个思路",
            Opinion::Alternative,
        ),
        (r"(?i)\bneutral\b|中立|保留意见", Opinion::Neutral),
    ];
    table.iter().map(|(p, o)| (regex(p), *o)).collect()
});

static CONFIDENCE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        regex(r"(?i)confidence\s*[:：]\s*([0-9]+(?:\.[0-9]+)?)"),
        regex(r"置信度\s*[:：]?\s*([0-9]+(?:\.[0-9]+)?)"),
    ]
});

pub fn parse_opinion(body: &str) -> Opinion {
    for (pattern, opinion) in OPINION_PATTERNS.iter() {
        if pattern.is_match(body) {
            return *opinion;
        }
    }
    Opinion::Neutral
}

/// Extract `confidence: <number>`; values above 1 are percentages. Falls
/// back to 0.7.
pub fn parse_confidence(body: &str) -> f64 {
    for pattern in CONFIDENCE_PATTERNS.iter() {
        if let Some(captures) = pattern.captures(body)
            && let Some(value) = captures.get(1)
            && let Ok(mut confidence) = value.as_str().parse::<f64>()
        {
            if confidence > 1.0 {
                confidence /= 100.0;
            }
            return confidence.clamp(0.0, 1.0);
        }
    }
    DEFAULT_CONFIDENCE
}

static CLOSURE_ALREADY_PRESENT: LazyLock<Regex> = LazyLock::new(|| {
    regex(r"(?i)conclude\s+(this|the)\s+discussion|discussion\s+(can|may)\s+be\s+concluded|可以结束(本次)?讨论")
});

/// Agreement speeds termination: an `agree` body gains a closing sentence
/// naming the counterpart, unless one is already there in either language.
pub fn apply_consensus_closure(body: String, opinion: Opinion, counterparts: &[String]) -> String {
    if opinion != Opinion::Agree || counterparts.is_empty() {
        return body;
    }
    if CLOSURE_ALREADY_PRESENT.is_match(&body) {
        return body;
    }
    let names = counterparts.join(", ");
    format!("{body}\n\nI agree with {names}; we can conclude this discussion.")
}

// The patterns are tuned constants; a malformed one is a programming
// error, not a runtime condition.
#[allow(clippy::unwrap_used)]
fn regex(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap()
}

fn escape_literal(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' || !c.is_ascii() {
            escaped.push(c);
        } else {
            escaped.push('\\');
            escaped.push(c);
        }
    }
    escaped
}
