//! The turn decision: given a discussion's messages, should this agent
//! speak now, and in which round?
//!
//! This is a pure function over the message list so the whole decision
//! table stays unit-testable without timers or child processes.

use roundtable_protocol::Message;
use roundtable_protocol::Payload;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnCandidate {
    pub round: u32,
    pub trigger: TurnTrigger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnTrigger {
    /// Nobody has spoken yet; open round 1.
    Start,
    /// A follow-up addressed to us (or broadcast) awaits our answer.
    Followup,
    /// The counterparts' responses make it our turn in the current round,
    /// or complete it and open the next one.
    Response,
}

pub fn decide_turn(agent: &str, messages: &[Message], max_rounds: u32) -> Option<TurnCandidate> {
    let start = messages.first()?;
    let Payload::Start { participants, .. } = &start.payload else {
        return None;
    };
    if !participants.iter().any(|p| p.eq_ignore_ascii_case(agent)) {
        return None;
    }

    if messages.iter().any(|m| m.is_end()) {
        return None;
    }
    let visible = messages;

    let highest_round = visible
        .iter()
        .filter(|m| m.is_response())
        .filter_map(|m| m.round)
        .max()
        .unwrap_or(0);

    // A follow-up redirects the discussion: it takes precedence over the
    // normal round progression.
    if let Some(followup) = visible.iter().rev().find(|m| m.is_followup()) {
        if let Payload::Followup { target, .. } = &followup.payload {
            if let Some(target) = target
                && !target.eq_ignore_ascii_case(agent)
            {
                // Addressed to someone else; we stay quiet entirely.
                return None;
            }
            let followup_round = followup.round.unwrap_or(highest_round + 1);
            if followup_round > max_rounds {
                return None;
            }
            if !responded_in(visible, agent, followup_round) {
                return Some(TurnCandidate {
                    round: followup_round,
                    trigger: TurnTrigger::Followup,
                });
            }
        }
    }

    if highest_round == 0 {
        return Some(TurnCandidate {
            round: 1,
            trigger: TurnTrigger::Start,
        });
    }

    let others_responded = participants
        .iter()
        .filter(|p| !p.eq_ignore_ascii_case(agent))
        .filter(|p| responded_in(visible, p, highest_round))
        .count();

    if !responded_in(visible, agent, highest_round) {
        // Our turn within the current round once every counterpart has
        // spoken in it.
        if others_responded >= participants.len().saturating_sub(1) && highest_round < max_rounds {
            return Some(TurnCandidate {
                round: highest_round,
                trigger: TurnTrigger::Response,
            });
        }
        return None;
    }

    // We already spoke in the highest round; advance only when the round
    // is complete and the cap allows another.
    let everyone_responded = participants
        .iter()
        .all(|p| responded_in(visible, p, highest_round));
    if everyone_responded && highest_round < max_rounds {
        return Some(TurnCandidate {
            round: highest_round + 1,
            trigger: TurnTrigger::Response,
        });
    }

    None
}

fn responded_in(messages: &[Message], agent: &str, round: u32) -> bool {
    messages.iter().any(|m| {
        m.is_response() && m.round == Some(round) && m.from.eq_ignore_ascii_case(agent)
    })
}
