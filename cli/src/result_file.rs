//! Markdown rendering of a discussion into its `<id>-result.md` sibling.
//!
//! The file is rewritten in full after every mutating CLI command; agent
//! daemons never touch it.

use roundtable_protocol::DiscussionStatus;
use roundtable_protocol::Message;
use roundtable_protocol::Payload;
use roundtable_protocol::StatusKind;

pub fn render(status: &DiscussionStatus, messages: &[Message]) -> String {
    let mut out = String::new();

    out.push_str(&format!("# {}\n\n", status.topic));
    out.push_str(&format!("- **Discussion**: `{}`\n", status.id));
    out.push_str(&format!(
        "- **Participants**: {}\n",
        status.participants.join(", ")
    ));
    out.push_str(&format!("- **Started**: {}\n", status.created_at));
    out.push_str(&format!(
        "- **State**: {}\n",
        if status.ended { "ended" } else { "active" }
    ));
    if status.current_round > 0 {
        out.push_str(&format!("- **Rounds**: {}\n", status.current_round));
    }
    out.push('\n');

    for message in messages {
        match &message.payload {
            Payload::Start { .. } => {}
            Payload::Response {
                opinion,
                content,
                confidence,
            } => {
                let round = message.round.unwrap_or(0);
                out.push_str(&format!(
                    "## {} (round {round}, {}, confidence {confidence:.2})\n\n{content}\n\n",
                    message.from,
                    opinion.label()
                ));
            }
            Payload::Followup { content, target } => {
                let addressee = target
                    .as_deref()
                    .map(|t| format!(" (to {t})"))
                    .unwrap_or_default();
                out.push_str(&format!("## Follow-up{addressee}\n\n{content}\n\n"));
            }
            Payload::End {
                decision,
                consensus,
            } => {
                out.push_str(&format!(
                    "## Decision\n\n{decision}\n\n_Consensus: {}._\n",
                    if *consensus { "yes" } else { "no" }
                ));
            }
            Payload::Error { error } => {
                out.push_str(&format!("> `{}` failed: {error}\n\n", message.from));
            }
            Payload::Status {
                status: StatusKind::Thinking | StatusKind::Retrying,
                ..
            }
            | Payload::Unknown => {}
        }
    }

    out
}
