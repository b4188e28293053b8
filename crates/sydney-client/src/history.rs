//! Conversation history windowing.
//!
//! A record's messages form a forest linked by `parent_message_id`; the
//! active thread is the backward walk from the current parent id. The thread
//! is split into an in-window slice (bounded by a user-turn budget) rendered
//! as structured prior turns, and an overflow slice rendered as a compact
//! transcript on the side-channel context string, so history never grows
//! unboundedly inside the protocol turn.

use chrono::{DateTime, Utc};

use crate::protocol::{Author, PriorMessage};
use crate::store::{Role, StoredMessage};

pub const NAME_PLACEHOLDER: &str = "[name]";
pub const DEFAULT_BOT_NAME: &str = "Sydney";

/// Walk the parent chain backward from `parent_message_id`, returning the
/// thread in chronological order.
///
/// The walk is bounded by the arena size: records come from externally
/// mutable storage, so a corrupted chain (missing ancestor or cycle) must
/// terminate with the partial thread rather than loop.
pub fn thread_for<'a>(
    messages: &'a [StoredMessage],
    parent_message_id: &str,
) -> Vec<&'a StoredMessage> {
    let mut thread = Vec::new();
    let mut cursor = Some(parent_message_id.to_string());
    while let Some(id) = cursor {
        if thread.len() >= messages.len() {
            tracing::warn!(len = thread.len(), "parent chain exceeds arena size, truncating");
            break;
        }
        let Some(message) = messages.iter().find(|m| m.id == id) else {
            break;
        };
        thread.push(message);
        cursor = message.parent_message_id.clone();
    }
    thread.reverse();
    thread
}

/// Partition a thread from most-recent backward: messages stay in-window
/// while fewer than `max_user_turns - 1` user-authored messages have been
/// placed there; everything older spills to overflow. Both slices come back
/// in chronological order.
pub fn split_window<'a>(
    thread: &[&'a StoredMessage],
    max_user_turns: u32,
) -> (Vec<&'a StoredMessage>, Vec<&'a StoredMessage>) {
    let budget = max_user_turns.saturating_sub(1) as usize;
    let mut window = Vec::new();
    let mut overflow = Vec::new();
    let mut user_turns = 0;
    for message in thread.iter().rev() {
        if user_turns < budget {
            if message.role == Role::User {
                user_turns += 1;
            }
            window.push(*message);
        } else {
            overflow.push(*message);
        }
    }
    window.reverse();
    overflow.reverse();
    (window, overflow)
}

/// Render the in-window slice as alternating prior turns, prefixed by the
/// persona preamble and a scripted self-introduction. Only used on fresh
/// threads; continuing turns rely on server-side session state.
pub fn render_window(
    window: &[&StoredMessage],
    persona: &str,
    bot_name: &str,
) -> Vec<PriorMessage> {
    let mut rendered = vec![
        PriorMessage {
            author: Author::Bot,
            text: persona.replace(NAME_PLACEHOLDER, bot_name),
        },
        PriorMessage {
            author: Author::Bot,
            text: format!("Alright, I am {bot_name}, your AI assistant."),
        },
    ];
    rendered.extend(window.iter().map(|m| PriorMessage {
        author: match m.role {
            Role::User => Author::User,
            Role::Bot => Author::Bot,
        },
        text: m.text.clone(),
    }));
    rendered
}

/// Render the overflow slice as a transcript for the context string.
pub fn render_overflow(overflow: &[&StoredMessage]) -> String {
    if overflow.is_empty() {
        return String::new();
    }
    let mut out = String::from("\nThese are some conversation records between you and I:\n");
    for message in overflow {
        let author = match message.role {
            Role::User => "user",
            Role::Bot => "bot",
        };
        out.push_str(author);
        out.push_str(": ");
        out.push_str(&message.text);
        out.push('\n');
    }
    out
}

// ---------------------------------------------------------------------------
// Group context
// ---------------------------------------------------------------------------

/// A recent chat line from the group the bot lives in.
#[derive(Debug, Clone)]
pub struct GroupChatLine {
    pub username: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub content: String,
}

/// Optional group metadata injected into the side-channel context string.
#[derive(Debug, Clone, Default)]
pub struct GroupContext {
    pub group_id: String,
    pub group_name: String,
    /// Display name of the person asking the current question.
    pub nickname: String,
    pub sender_id: String,
    pub bot_name: Option<String>,
    pub master_name: Option<String>,
    pub chats: Vec<GroupChatLine>,
}

impl GroupContext {
    /// Render the group briefing plus the recent-chat transcript.
    pub fn render(&self) -> String {
        let mut out = format!(
            "Note: you are chatting inside a group. The person asking you now is {}({}). ",
            self.nickname, self.sender_id
        );
        out.push_str(&format!(
            "The group is called {} and its id is {}. ",
            self.group_name, self.group_id
        ));
        if let Some(bot_name) = &self.bot_name {
            out.push_str(&format!("Your card name in this group is {bot_name}. "));
        }
        if let Some(master) = &self.master_name {
            out.push_str(&format!("I am {master}. "));
        }
        if !self.chats.is_empty() {
            out.push_str(
                "Here is a recent excerpt of the group chat, provided as context; \
                 prefer it when answering.\n",
            );
            for chat in &self.chats {
                // Suggestion cards echoed back into chat pollute the persona.
                if chat.content.starts_with("Suggested replies") {
                    continue;
                }
                out.push_str(&format!(
                    "[{}] (id: {}, at: {}) said: {}\n",
                    chat.username,
                    chat.user_id,
                    chat.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    chat.content
                ));
            }
        }
        out
    }
}
