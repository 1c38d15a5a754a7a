//! Message assembly for the chat model.
//!
//! Output order is fixed: persona, then optional affinity, user profile and memory
//! context as separate system messages, then the conversation history, then an
//! optional trailing user message.

use crate::history::{Turn, TurnRole};
use crate::llm_client::Message;

pub const EVENT_PREFIX: &str = "[interaction event] ";

/// Everything the assembler reads. Borrowed so callers can build it from snapshots.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptInput<'a> {
    pub persona: &'a str,
    pub user_profile: &'a str,
    pub affinity_summary: Option<&'a str>,
    pub memory_summary: Option<&'a str>,
    pub turns: &'a [Turn],
    pub new_user_content: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssembledPrompt {
    pub messages: Vec<Message>,
    /// Number of leading system messages.
    pub system_count: usize,
}

impl AssembledPrompt {
    /// Messages bounded to the system block plus the newest `max_history` others.
    pub fn trimmed(self, max_history: usize) -> Vec<Message> {
        trim_to_window(self.messages, self.system_count, max_history)
    }
}

pub fn assemble(input: &PromptInput<'_>) -> AssembledPrompt {
    let mut messages = vec![Message::system(input.persona)];

    let context = [
        input.affinity_summary,
        Some(input.user_profile),
        input.memory_summary,
    ];
    messages.extend(
        context
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(Message::system),
    );
    let system_count = messages.len();

    messages.extend(input.turns.iter().map(turn_message));
    if let Some(content) = input.new_user_content {
        messages.push(Message::user(content));
    }

    AssembledPrompt {
        messages,
        system_count,
    }
}

fn turn_message(turn: &Turn) -> Message {
    match turn.role {
        TurnRole::User => Message::user(turn.content.as_str()),
        TurnRole::Assistant => Message::assistant(turn.content.as_str()),
        TurnRole::Event => Message::user(format!("{}{}", EVENT_PREFIX, turn.content)),
    }
}

/// Keep every system message and only the most recent `max_history` of the rest.
pub fn trim_to_window(
    mut messages: Vec<Message>,
    system_count: usize,
    max_history: usize,
) -> Vec<Message> {
    let system_count = system_count.min(messages.len());
    let history = messages.len() - system_count;
    if history > max_history {
        messages.drain(system_count..system_count + (history - max_history));
    }
    messages
}

/// Plain-text block of the last `limit` turns, for single-instruction requests.
pub fn render_recent_context(turns: &[Turn], limit: usize, user_name: &str) -> String {
    let start = turns.len().saturating_sub(limit);
    turns[start..]
        .iter()
        .map(|turn| match turn.role {
            TurnRole::User => format!("{}: {}", user_name, turn.content),
            TurnRole::Assistant => format!("You: {}", turn.content),
            TurnRole::Event => format!("{}{}", EVENT_PREFIX, turn.content),
        })
        .collect::<Vec<_>>()
        .join("\n")
}
