//! Prompt assembly for the external CLI.
//!
//! The prompt restates the topic and history in a stable textual form and
//! spells out the output contract: the first non-empty line must be
//! `AGENT:<name>`, and the model must not answer for the other
//! participants.

use roundtable_protocol::DiscussionStatus;
use roundtable_protocol::Message;
use roundtable_protocol::Payload;
use roundtable_protocol::WORKING_DIR_KEY;

pub(crate) fn build_prompt(
    agent: &str,
    status: &DiscussionStatus,
    messages: &[Message],
    round: u32,
) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "You are {agent}, one of {} participants in a technical discussion.\n",
        status.participants.len()
    ));
    prompt.push_str(&format!("Topic: {}\n", status.topic));
    prompt.push_str(&format!(
        "Participants: {}\n",
        status.participants.join(", ")
    ));
    if let Some(workdir) = status.context.get(WORKING_DIR_KEY) {
        prompt.push_str(&format!("Working directory: {workdir}\n"));
    }

    prompt.push_str("\nDiscussion so far:\n");
    for message in messages {
        if let Some(line) = render_message(message) {
            prompt.push_str(&line);
            prompt.push('\n');
        }
    }

    prompt.push_str("\nRules:\n");
    prompt.push_str(&format!(
        "- The first non-empty line of your reply must be exactly: AGENT:{agent}\n"
    ));
    prompt.push_str("- Speak only as yourself; never answer for the other participants.\n");
    prompt.push_str(
        "- State clearly whether you agree, disagree, stay neutral, or propose an alternative.\n",
    );
    prompt.push_str("- Include a line like `confidence: 0.8` for how sure you are.\n");
    if round > 1 {
        prompt.push_str(&format!(
            "- This is round {round}; respond to the latest points rather than restating round 1.\n"
        ));
    }

    prompt
}

/// One history line per record; bookkeeping records (`status`, unknown
/// types) are omitted.
fn render_message(message: &Message) -> Option<String> {
    match &message.payload {
        Payload::Start { topic, .. } => Some(format!("[user] opened the discussion: {topic}")),
        Payload::Response {
            opinion, content, ..
        } => {
            let round = message.round.unwrap_or(0);
            Some(format!(
                "[{} / round {round} / {}] {content}",
                message.from,
                opinion.label()
            ))
        }
        Payload::Followup { content, target } => Some(match target {
            Some(target) => format!("[user follow-up to {target}] {content}"),
            None => format!("[user follow-up] {content}"),
        }),
        Payload::End { decision, .. } => Some(format!("[user] ended the discussion: {decision}")),
        Payload::Error { error } => Some(format!("[{} failed] {error}", message.from)),
        Payload::Status { .. } | Payload::Unknown => None,
    }
}
