//! SQLite storage for chats and their messages.
//!
//! Uses `rusqlite` synchronously; callers hold it behind a mutex and never
//! across an `.await`. WAL mode is enabled so readers are not blocked while a
//! turn is appending.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::errors::AgentError;
use super::types::{Message, MessageRole};
use crate::inference::types::ToolCall;

// ─── Records ────────────────────────────────────────────────────────────────

/// A chat row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRecord {
    pub id: String,
    pub title: String,
    pub system_prompt: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A chat list entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatSummary {
    pub id: String,
    pub title: String,
    pub message_count: usize,
    pub updated_at: String,
}

// ─── Database ───────────────────────────────────────────────────────────────

pub struct ChatDatabase {
    conn: Connection,
}

impl ChatDatabase {
    /// Open (or create) the database at `path`. `":memory:"` works for tests.
    pub fn open(path: &str) -> Result<Self, AgentError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self { conn };
        db.create_tables()?;
        Ok(db)
    }

    fn create_tables(&self) -> Result<(), AgentError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS chats (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                system_prompt TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS chat_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                tool_calls TEXT,
                tool_call_id TEXT,
                tool_name TEXT,
                FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_chat_messages_chat
                ON chat_messages(chat_id, id);
            ",
        )?;
        Ok(())
    }

    // ─── Chats ──────────────────────────────────────────────────────────

    pub fn create_chat(
        &self,
        chat_id: &str,
        title: &str,
        system_prompt: Option<&str>,
    ) -> Result<(), AgentError> {
        self.conn.execute(
            "INSERT INTO chats (id, title, system_prompt) VALUES (?1, ?2, ?3)",
            params![chat_id, title, system_prompt],
        )?;
        Ok(())
    }

    pub fn get_chat(&self, chat_id: &str) -> Result<Option<ChatRecord>, AgentError> {
        let chat = self
            .conn
            .query_row(
                "SELECT id, title, system_prompt, created_at, updated_at
                 FROM chats WHERE id = ?1",
                params![chat_id],
                |row| {
                    Ok(ChatRecord {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        system_prompt: row.get(2)?,
                        created_at: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(chat)
    }

    /// All chats, most recently updated first.
    pub fn list_chats(&self) -> Result<Vec<ChatSummary>, AgentError> {
        let mut stmt = self.conn.prepare(
            "SELECT c.id, c.title, c.updated_at,
                    (SELECT COUNT(*) FROM chat_messages m WHERE m.chat_id = c.id)
             FROM chats c
             ORDER BY c.updated_at DESC, c.rowid DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ChatSummary {
                id: row.get(0)?,
                title: row.get(1)?,
                updated_at: row.get(2)?,
                message_count: row.get::<_, i64>(3)? as usize,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(AgentError::from)
    }

    pub fn rename_chat(&self, chat_id: &str, title: &str) -> Result<(), AgentError> {
        self.conn.execute(
            "UPDATE chats SET title = ?2 WHERE id = ?1",
            params![chat_id, title],
        )?;
        Ok(())
    }

    pub fn delete_chat(&self, chat_id: &str) -> Result<(), AgentError> {
        self.conn
            .execute("DELETE FROM chat_messages WHERE chat_id = ?1", params![chat_id])?;
        self.conn
            .execute("DELETE FROM chats WHERE id = ?1", params![chat_id])?;
        Ok(())
    }

    fn touch_chat(&self, chat_id: &str) -> Result<(), AgentError> {
        self.conn.execute(
            "UPDATE chats SET updated_at = datetime('now') WHERE id = ?1",
            params![chat_id],
        )?;
        Ok(())
    }

    // ─── Messages ───────────────────────────────────────────────────────

    pub fn insert_message(&self, chat_id: &str, msg: &Message) -> Result<i64, AgentError> {
        let tool_calls_json = msg
            .tool_calls
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn.execute(
            "INSERT INTO chat_messages
             (chat_id, timestamp, role, content, tool_calls, tool_call_id, tool_name)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                chat_id,
                msg.timestamp,
                msg.role.as_str(),
                msg.content,
                tool_calls_json,
                msg.tool_call_id,
                msg.tool_name,
            ],
        )?;

        self.touch_chat(chat_id)?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Messages of a chat in insertion order.
    pub fn get_messages(&self, chat_id: &str) -> Result<Vec<Message>, AgentError> {
        let mut stmt = self.conn.prepare(
            "SELECT timestamp, role, content, tool_calls, tool_call_id, tool_name
             FROM chat_messages
             WHERE chat_id = ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![chat_id], row_to_message)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(AgentError::from)
    }

    pub fn message_count(&self, chat_id: &str) -> Result<usize, AgentError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM chat_messages WHERE chat_id = ?1",
            params![chat_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Keep messages `0..=index`, delete the rest. Returns `false` when
    /// `index` is out of range.
    pub fn delete_messages_after(&self, chat_id: &str, index: usize) -> Result<bool, AgentError> {
        if index >= self.message_count(chat_id)? {
            return Ok(false);
        }
        let deleted = self.conn.execute(
            "DELETE FROM chat_messages
             WHERE chat_id = ?1
               AND id NOT IN (
                   SELECT id FROM chat_messages WHERE chat_id = ?1
                   ORDER BY id ASC LIMIT ?2
               )",
            params![chat_id, (index + 1) as i64],
        )?;
        tracing::debug!(chat_id, index, deleted, "truncated chat history");
        self.touch_chat(chat_id)?;
        Ok(true)
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let timestamp: i64 = row.get(0)?;
    let role: String = row.get(1)?;
    Ok(Message {
        timestamp,
        role: decode_role(timestamp, &role),
        content: row.get(2)?,
        tool_calls: decode_tool_calls(timestamp, row.get(3)?),
        tool_call_id: row.get(4)?,
        tool_name: row.get(5)?,
    })
}

/// Unknown roles load as `system` so the message stays display-only.
fn decode_role(timestamp: i64, raw: &str) -> MessageRole {
    MessageRole::parse(raw).unwrap_or_else(|| {
        tracing::warn!(timestamp, role = raw, "unknown message role in database; loading as system");
        MessageRole::System
    })
}

fn decode_tool_calls(timestamp: i64, raw: Option<String>) -> Option<Vec<ToolCall>> {
    let raw = raw?;
    match serde_json::from_str::<Vec<ToolCall>>(&raw) {
        Ok(calls) => Some(calls),
        Err(e) => {
            tracing::warn!(timestamp, error = %e, "undecodable tool_calls in database; dropping them");
            None
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> ChatDatabase {
        ChatDatabase::open(":memory:").unwrap()
    }

    #[test]
    fn test_create_and_get_chat() {
        let db = test_db();
        db.create_chat("c1", "First", Some("Be brief.")).unwrap();

        let chat = db.get_chat("c1").unwrap().unwrap();
        assert_eq!(chat.title, "First");
        assert_eq!(chat.system_prompt.as_deref(), Some("Be brief."));
        assert!(db.get_chat("missing").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_rows_still_load() {
        let db = test_db();
        db.create_chat("c1", "t", None).unwrap();
        db.conn
            .execute(
                "INSERT INTO chat_messages (chat_id, timestamp, role, content, tool_calls)
                 VALUES ('c1', 1, 'narrator', 'odd', NULL),
                        ('c1', 2, 'assistant', 'calls', '{not json')",
                [],
            )
            .unwrap();

        let messages = db.get_messages("c1").unwrap();
        assert_eq!(messages[0].role, MessageRole::System);
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert_eq!(messages[1].tool_calls, None);
    }

    #[test]
    fn test_messages_round_trip_with_tool_fields() {
        let db = test_db();
        db.create_chat("c1", "t", None).unwrap();
        let call = ToolCall::function("n1", "calc", r#"{"expr":"2+2"}"#);

        db.insert_message("c1", &Message::user("2+2?", 1)).unwrap();
        db.insert_message("c1", &Message::assistant("", 2).with_tool_calls(vec![call.clone()]))
            .unwrap();
        db.insert_message("c1", &Message::tool_result("4", 3, "n1", "calc")).unwrap();

        let messages = db.get_messages("c1").unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].tool_calls, Some(vec![call]));
        assert_eq!(messages[2].tool_name.as_deref(), Some("calc"));
        assert_eq!(messages[2].role, MessageRole::Tool);
    }

    #[test]
    fn test_delete_messages_after() {
        let db = test_db();
        db.create_chat("c1", "t", None).unwrap();
        for ts in 1..=5 {
            db.insert_message("c1", &Message::user(format!("m{ts}"), ts)).unwrap();
        }

        assert!(db.delete_messages_after("c1", 1).unwrap());
        let left: Vec<i64> = db.get_messages("c1").unwrap().iter().map(|m| m.timestamp).collect();
        assert_eq!(left, vec![1, 2]);
        assert!(!db.delete_messages_after("c1", 2).unwrap());
    }

    #[test]
    fn test_list_chats_counts_messages() {
        let db = test_db();
        db.create_chat("a", "A", None).unwrap();
        db.create_chat("b", "B", None).unwrap();
        db.insert_message("a", &Message::user("x", 1)).unwrap();

        let chats = db.list_chats().unwrap();
        assert_eq!(chats.len(), 2);
        let a = chats.iter().find(|c| c.id == "a").unwrap();
        assert_eq!(a.message_count, 1);
    }

    #[test]
    fn test_delete_chat_removes_messages() {
        let db = test_db();
        db.create_chat("a", "A", None).unwrap();
        db.insert_message("a", &Message::user("x", 1)).unwrap();
        db.delete_chat("a").unwrap();
        assert!(db.get_chat("a").unwrap().is_none());
        assert_eq!(db.message_count("a").unwrap(), 0);
    }

    #[test]
    fn test_file_backed_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chats.db");
        let path = path.to_str().unwrap();
        {
            let db = ChatDatabase::open(path).unwrap();
            db.create_chat("c", "t", None).unwrap();
            db.insert_message("c", &Message::user("kept", 1)).unwrap();
        }
        let db = ChatDatabase::open(path).unwrap();
        assert_eq!(db.get_messages("c").unwrap()[0].content, "kept");
    }
}
