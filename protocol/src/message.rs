//! One record in a discussion log.
//!
//! Records are serialized as JSON Lines: one object per line, UTF-8, LF
//! endings. The `type` field selects the payload variant; readers must
//! tolerate record types they do not know about.

use std::collections::BTreeMap;

use chrono::SecondsFormat;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Sender name used for records written by the human user rather than an
/// agent daemon.
pub const USER_SENDER: &str = "user";

/// Recognized key in the `start` context map: working directory handed to
/// the agents' child processes.
pub const WORKING_DIR_KEY: &str = "workingDir";

/// Current wall-clock time in the sortable form stored in `ts`.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Strictly monotonically increasing within a discussion; assigned at
    /// append time, never by the sender.
    pub seq: u64,
    /// ISO 8601 UTC timestamp, stamped at append time.
    pub ts: String,
    /// `user` or an agent name.
    pub from: String,
    /// Present on `response`, `followup` (assigned at append time when the
    /// sender did not supply one) and on `error`/`status` emitted during a
    /// round.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round: Option<u32>,
    #[serde(flatten)]
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Payload {
    Start {
        topic: String,
        /// Ordered; order is fixed for the lifetime of the discussion.
        participants: Vec<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        context: BTreeMap<String, String>,
    },
    Response {
        opinion: Opinion,
        content: String,
        confidence: f64,
    },
    Followup {
        content: String,
        /// Agent name; absent means broadcast to every participant.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    End {
        decision: String,
        consensus: bool,
    },
    Error {
        error: String,
    },
    Status {
        status: StatusKind,
        content: String,
    },
    /// Record types introduced by a newer writer. Preserved in memory,
    /// ignored by all decision logic.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Opinion {
    Agree,
    Disagree,
    #[default]
    Neutral,
    Alternative,
}

impl Opinion {
    /// The wire form of the variant, for prompts and human-readable
    /// rendering.
    pub fn label(self) -> &'static str {
        match self {
            Opinion::Agree => "agree",
            Opinion::Disagree => "disagree",
            Opinion::Neutral => "neutral",
            Opinion::Alternative => "alternative",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Thinking,
    Retrying,
}

impl Message {
    /// Build a record the way senders hand it to `append`: `seq` and `ts`
    /// are placeholders until the log stamps them under its lock.
    pub fn unstamped(from: impl Into<String>, round: Option<u32>, payload: Payload) -> Self {
        Self {
            seq: 0,
            ts: String::new(),
            from: from.into(),
            round,
            payload,
        }
    }

    pub fn start(
        topic: impl Into<String>,
        participants: Vec<String>,
        context: BTreeMap<String, String>,
    ) -> Self {
        Self::unstamped(
            USER_SENDER,
            None,
            Payload::Start {
                topic: topic.into(),
                participants,
                context,
            },
        )
    }

    pub fn response(
        from: impl Into<String>,
        round: u32,
        opinion: Opinion,
        content: impl Into<String>,
        confidence: f64,
    ) -> Self {
        Self::unstamped(
            from,
            Some(round),
            Payload::Response {
                opinion,
                content: content.into(),
                confidence,
            },
        )
    }

    pub fn followup(content: impl Into<String>, target: Option<String>) -> Self {
        Self::unstamped(
            USER_SENDER,
            None,
            Payload::Followup {
                content: content.into(),
                target,
            },
        )
    }

    pub fn end(decision: impl Into<String>, consensus: bool) -> Self {
        Self::unstamped(
            USER_SENDER,
            None,
            Payload::End {
                decision: decision.into(),
                consensus,
            },
        )
    }

    pub fn error(from: impl Into<String>, round: Option<u32>, error: impl Into<String>) -> Self {
        Self::unstamped(
            from,
            round,
            Payload::Error {
                error: error.into(),
            },
        )
    }

    pub fn status(
        from: impl Into<String>,
        round: Option<u32>,
        status: StatusKind,
        content: impl Into<String>,
    ) -> Self {
        Self::unstamped(
            from,
            round,
            Payload::Status {
                status,
                content: content.into(),
            },
        )
    }

    pub fn is_end(&self) -> bool {
        matches!(self.payload, Payload::End { .. })
    }

    pub fn is_response(&self) -> bool {
        matches!(self.payload, Payload::Response { .. })
    }

    pub fn is_followup(&self) -> bool {
        matches!(self.payload, Payload::Followup { .. })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    fn roundtrip(message: &Message) -> Message {
        let line = serde_json::to_string(message).unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[test]
    fn start_roundtrips_with_context() {
        let mut context = BTreeMap::new();
        context.insert(WORKING_DIR_KEY.to_string(), "/tmp/project".to_string());
        let mut message = Message::start(
            "Use REST or GraphQL?",
            vec!["claude".to_string(), "codex".to_string()],
            context,
        );
        message.seq = 1;
        message.ts = now_rfc3339();
        assert_eq!(roundtrip(&message), message);
    }

    #[test]
    fn response_roundtrips() {
        let mut message = Message::response("claude", 2, Opinion::Agree, "REST is fine.", 0.9);
        message.seq = 5;
        message.ts = "2025-01-01T00:00:00.000Z".to_string();
        assert_eq!(roundtrip(&message), message);
    }

    #[test]
    fn followup_target_is_omitted_when_broadcast() {
        let mut message = Message::followup("What about caching?", None);
        message.seq = 4;
        message.ts = now_rfc3339();
        let line = serde_json::to_string(&message).unwrap();
        assert!(!line.contains("target"));
        assert_eq!(roundtrip(&message), message);
    }

    #[test]
    fn serialized_type_tags_are_lowercase() {
        let mut message = Message::end("REST + caching layer", true);
        message.seq = 7;
        message.ts = now_rfc3339();
        let value: serde_json::Value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "end");
        assert_eq!(value["decision"], "REST + caching layer");
        assert_eq!(value["consensus"], true);
    }

    #[test]
    fn unknown_type_is_preserved_not_rejected() {
        let line = r#"{"seq":3,"ts":"2025-01-01T00:00:00Z","from":"user","type":"poke","extra":1}"#;
        let message: Message = serde_json::from_str(line).unwrap();
        assert_eq!(message.payload, Payload::Unknown);
        assert_eq!(message.seq, 3);
    }

    #[test]
    fn opinion_label_matches_the_wire_form() {
        for opinion in [
            Opinion::Agree,
            Opinion::Disagree,
            Opinion::Neutral,
            Opinion::Alternative,
        ] {
            let wire = serde_json::to_value(opinion).unwrap();
            assert_eq!(wire, serde_json::Value::String(opinion.label().to_string()));
        }
    }

    #[test]
    fn status_roundtrips_with_round() {
        let mut message = Message::status("codex", Some(1), StatusKind::Retrying, "1/3");
        message.seq = 9;
        message.ts = now_rfc3339();
        let copy = roundtrip(&message);
        assert_eq!(copy.round, Some(1));
        assert_eq!(copy, message);
    }
}
