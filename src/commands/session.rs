//! Chat management commands for the terminal front-end.
//!
//! Listing, creating, opening and deleting chats, plus the numbered history
//! view that `/regen <n>` refers to.

use serde::Serialize;

use crate::agent_core::tool_router::truncate_utf8;
use crate::agent_core::{AgentError, Message, MessageRole, SqliteChatManager};

/// Title given to chats until their first user message arrives.
pub const UNTITLED: &str = "New chat";

const PREVIEW_BYTES: usize = 60;

// ─── Response Types ─────────────────────────────────────────────────────────

/// A chat in the `/chats` list.
#[derive(Debug, Serialize)]
pub struct ChatListItem {
    pub id: String,
    pub title: String,
    pub updated_at: String,
    pub message_count: usize,
    pub active: bool,
}

// ─── Commands ───────────────────────────────────────────────────────────────

/// Chats with at least one message, most recent first. The active chat is
/// always included.
pub fn list_chats(manager: &SqliteChatManager) -> Result<Vec<ChatListItem>, AgentError> {
    let active = manager.active_chat_id();
    Ok(manager
        .list_chats()?
        .into_iter()
        .filter(|c| c.message_count > 0 || active.as_deref() == Some(c.id.as_str()))
        .map(|c| ChatListItem {
            active: active.as_deref() == Some(c.id.as_str()),
            id: c.id,
            title: c.title,
            updated_at: c.updated_at,
            message_count: c.message_count,
        })
        .collect())
}

pub fn new_chat(manager: &SqliteChatManager, system_prompt: &str) -> Result<String, AgentError> {
    manager.new_chat(UNTITLED, Some(system_prompt))
}

/// Open the chat whose id starts with `prefix`. The prefix must be unique.
pub fn open_chat(manager: &SqliteChatManager, prefix: &str) -> Result<String, AgentError> {
    let prefix = prefix.trim();
    let matches: Vec<String> = manager
        .list_chats()?
        .into_iter()
        .map(|c| c.id)
        .filter(|id| !prefix.is_empty() && id.starts_with(prefix))
        .collect();
    match matches.as_slice() {
        [id] => {
            manager.open_chat(id)?;
            Ok(id.clone())
        }
        [] => Err(AgentError::ChatManager {
            reason: format!("no chat matches '{prefix}'"),
        }),
        _ => Err(AgentError::ChatManager {
            reason: format!("'{prefix}' matches {} chats; use a longer prefix", matches.len()),
        }),
    }
}

/// Give an untitled chat a title taken from its first user message.
pub fn title_from_first_message(manager: &SqliteChatManager, chat_id: &str) -> Result<(), AgentError> {
    if manager.chat_title(chat_id)?.as_deref() != Some(UNTITLED) {
        return Ok(());
    }
    let messages = manager.chat_messages(chat_id)?;
    if let Some(first) = messages.iter().find(|m| m.role == MessageRole::User) {
        manager.rename_chat(chat_id, &preview(&first.content))?;
    }
    Ok(())
}

/// One line per message, numbered by position in the chat.
pub fn history_lines(messages: &[Message]) -> Vec<String> {
    messages
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let body = if m.content.trim().is_empty() {
                m.tool_calls
                    .as_ref()
                    .map(|calls| {
                        let names: Vec<&str> = calls.iter().map(|c| c.function.name.as_str()).collect();
                        format!("(calls {})", names.join(", "))
                    })
                    .unwrap_or_default()
            } else {
                preview(&m.content)
            };
            format!("{i:>3} {:<9} {body}", m.role.as_str())
        })
        .collect()
}

fn preview(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default().trim();
    let cut = truncate_utf8(line, PREVIEW_BYTES);
    if cut.len() < line.len() || text.trim().lines().count() > 1 {
        format!("{cut}…")
    } else {
        cut.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::{ChatDatabase, ChatManager};
    use crate::inference::types::ToolCall;

    fn manager() -> SqliteChatManager {
        SqliteChatManager::new(ChatDatabase::open(":memory:").unwrap())
    }

    #[tokio::test]
    async fn test_list_hides_empty_inactive_chats() {
        let m = manager();
        let first = new_chat(&m, "prompt").unwrap();
        m.add_message_and_await_persisted(&first, Message::user("hello", 1))
            .await
            .unwrap();
        let _empty_old = new_chat(&m, "prompt").unwrap();
        let current = new_chat(&m, "prompt").unwrap();

        let items = list_chats(&m).unwrap();
        let ids: Vec<&str> = items.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(items.len(), 2);
        assert!(ids.contains(&first.as_str()));
        assert!(items.iter().any(|c| c.id == current && c.active));
    }

    #[test]
    fn test_open_by_prefix() {
        let m = manager();
        let id = new_chat(&m, "p").unwrap();
        let _other = new_chat(&m, "p").unwrap();

        assert_eq!(open_chat(&m, &id[..12]).unwrap(), id);
        assert_eq!(m.active_chat_id(), Some(id));
        assert!(open_chat(&m, "zzzz-not-a-chat").is_err());
        assert!(open_chat(&m, "").is_err());
    }

    #[tokio::test]
    async fn test_title_from_first_message() {
        let m = manager();
        let id = new_chat(&m, "p").unwrap();
        m.add_message_and_await_persisted(&id, Message::user("Plan a trip to Lisbon\nin May", 1))
            .await
            .unwrap();

        title_from_first_message(&m, &id).unwrap();
        assert_eq!(m.chat_title(&id).unwrap().as_deref(), Some("Plan a trip to Lisbon…"));

        // Already titled chats keep their title.
        m.rename_chat(&id, "Trip").unwrap();
        title_from_first_message(&m, &id).unwrap();
        assert_eq!(m.chat_title(&id).unwrap().as_deref(), Some("Trip"));
    }

    #[test]
    fn test_history_lines_number_every_message() {
        let call = ToolCall::function("a", "system.current_time", "{}");
        let lines = history_lines(&[
            Message::user("what time is it?", 1),
            Message::assistant("", 2).with_tool_calls(vec![call]),
            Message::tool_result("noon", 3, "a", "system.current_time"),
        ]);
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("  0 user"));
        assert!(lines[1].contains("(calls system.current_time)"));
        assert!(lines[2].starts_with("  2 tool"));
    }

    #[test]
    fn test_delete_active_chat_clears_selection() {
        let m = manager();
        let id = new_chat(&m, "p").unwrap();
        m.delete_chat(&id).unwrap();
        assert_eq!(m.active_chat_id(), None);
        assert!(m.chat_title(&id).unwrap().is_none());
    }
}
