//! JSON Lines codec for discussion logs.
//!
//! One message per line. Parsing is forgiving: blank lines and lines that
//! fail to parse (including a torn final line from an interrupted writer)
//! are dropped without surfacing as messages, so they never advance `seq`.

use roundtable_protocol::Message;

use crate::error::Result;

pub(crate) fn decode_lines(content: &str) -> Vec<Message> {
    let mut messages = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Message>(line) {
            Ok(message) => messages.push(message),
            Err(err) => {
                tracing::debug!(%err, "dropping malformed log line");
            }
        }
    }
    messages
}

/// Serialize a message to the single line handed to the append write,
/// trailing newline included.
pub(crate) fn encode_line(message: &Message) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}
