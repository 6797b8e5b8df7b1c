//! Status summary derived from a discussion's message sequence.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::message::Message;
use crate::message::Payload;

/// Snapshot derived entirely from the in-memory message list; nothing here
/// is stored separately on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscussionStatus {
    pub id: String,
    pub topic: String,
    pub participants: Vec<String>,
    pub context: BTreeMap<String, String>,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    /// Max round over `response` records, 0 when nobody has spoken.
    pub current_round: u32,
    pub ended: bool,
    pub message_count: usize,
}

impl DiscussionStatus {
    /// Derive a status from the full message list. Returns `None` when the
    /// log does not begin with a `start` record, i.e. is not a valid
    /// discussion.
    pub fn derive(id: &str, messages: &[Message]) -> Option<Self> {
        let first = messages.first()?;
        let Payload::Start {
            topic,
            participants,
            context,
        } = &first.payload
        else {
            tracing::warn!(id, "discussion log does not begin with a start record");
            return None;
        };

        // Records after the first `end` are ignored by every reader.
        let end = messages.iter().find(|m| m.is_end());
        let visible = match end {
            Some(end) => &messages[..messages.iter().position(|m| m.seq == end.seq)? + 1],
            None => messages,
        };

        let current_round = visible
            .iter()
            .filter(|m| m.is_response())
            .filter_map(|m| m.round)
            .max()
            .unwrap_or(0);

        Some(Self {
            id: id.to_string(),
            topic: topic.clone(),
            participants: participants.clone(),
            context: context.clone(),
            created_at: first.ts.clone(),
            ended_at: end.map(|m| m.ts.clone()),
            current_round,
            ended: end.is_some(),
            message_count: visible.len(),
        })
    }

    pub fn is_participant(&self, name: &str) -> bool {
        self.participants.iter().any(|p| p == name)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::message::Opinion;
    use crate::message::now_rfc3339;
    use pretty_assertions::assert_eq;

    fn stamped(mut message: Message, seq: u64) -> Message {
        message.seq = seq;
        message.ts = now_rfc3339();
        message
    }

    fn sample() -> Vec<Message> {
        vec![
            stamped(
                Message::start(
                    "tabs or spaces",
                    vec!["claude".to_string(), "codex".to_string()],
                    BTreeMap::new(),
                ),
                1,
            ),
            stamped(
                Message::response("claude", 1, Opinion::Agree, "spaces", 0.8),
                2,
            ),
            stamped(
                Message::response("codex", 1, Opinion::Agree, "spaces", 0.7),
                3,
            ),
        ]
    }

    #[test]
    fn active_discussion_reports_current_round() {
        let status = DiscussionStatus::derive("ab12cd34", &sample()).unwrap();
        assert_eq!(status.topic, "tabs or spaces");
        assert_eq!(status.current_round, 1);
        assert!(!status.ended);
        assert_eq!(status.ended_at, None);
        assert_eq!(status.message_count, 3);
    }

    #[test]
    fn records_after_end_do_not_change_the_derivation() {
        let mut messages = sample();
        messages.push(stamped(Message::end("spaces", true), 4));
        let ended = DiscussionStatus::derive("ab12cd34", &messages).unwrap();

        // A straggler response appended after the end record.
        messages.push(stamped(
            Message::response("codex", 2, Opinion::Disagree, "tabs actually", 0.9),
            5,
        ));
        let after = DiscussionStatus::derive("ab12cd34", &messages).unwrap();
        assert_eq!(after, ended);
        assert!(after.ended);
        assert_eq!(after.current_round, 1);
    }

    #[test]
    fn log_without_start_is_not_a_discussion() {
        let messages = vec![stamped(
            Message::response("claude", 1, Opinion::Neutral, "hm", 0.7),
            1,
        )];
        assert!(DiscussionStatus::derive("ab12cd34", &messages).is_none());
    }

    #[test]
    fn empty_log_is_not_a_discussion() {
        assert!(DiscussionStatus::derive("ab12cd34", &[]).is_none());
    }
}
