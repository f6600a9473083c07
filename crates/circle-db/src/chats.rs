use anyhow::{Result, anyhow};
use rusqlite::Connection;
use tracing::info;
use uuid::Uuid;

use crate::models::{ChatListing, ChatRow, MessageRow};
use crate::users::summary_from_row;
use crate::{Database, OptionalExt};

impl Database {
    /// Create a chat whose only participants are `user_a` and `user_b`.
    ///
    /// The accept path calls [`provision_in`] inside its own transaction;
    /// this wrapper is for callers that provision on their own.
    pub fn provision_on_accept(&self, user_a: &str, user_b: &str) -> Result<ChatRow> {
        self.with_tx(|tx| provision_in(tx, user_a, user_b))
    }

    pub fn get_chat(&self, id: &str) -> Result<Option<ChatRow>> {
        self.with_conn(|conn| query_chat(conn, id))
    }

    pub fn is_participant(&self, chat_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM chat_participants WHERE chat_id = ?1 AND user_id = ?2",
                    (chat_id, user_id),
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Chats that have both users as participants.
    pub fn count_chats_between(&self, user_a: &str, user_b: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM chat_participants a
                 JOIN chat_participants b ON a.chat_id = b.chat_id
                 WHERE a.user_id = ?1 AND b.user_id = ?2",
                (user_a, user_b),
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }

    /// One page of `user_id`'s chats, newest first, each with the other
    /// participants.
    pub fn chats_for_user(&self, user_id: &str, page: u32, page_size: u32) -> Result<Vec<ChatListing>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.conversation_name, c.created_at
                 FROM chats c
                 JOIN chat_participants p ON p.chat_id = c.id
                 WHERE p.user_id = ?1
                 ORDER BY c.created_at DESC, c.id
                 LIMIT ?2 OFFSET ?3",
            )?;
            let chats = stmt
                .query_map(
                    rusqlite::params![user_id, page_size, page as i64 * page_size as i64],
                    |row| Ok((row.get::<_, String>(0)?, row.get(1)?, row.get(2)?)),
                )?
                .collect::<std::result::Result<Vec<(String, Option<String>, String)>, _>>()?;

            let mut others_stmt = conn.prepare(
                "SELECT u.id, u.username, u.surname, u.role, u.avatar
                 FROM chat_participants p
                 JOIN users u ON u.id = p.user_id
                 WHERE p.chat_id = ?1 AND p.user_id != ?2
                 ORDER BY u.username",
            )?;

            let mut listings = Vec::with_capacity(chats.len());
            for (id, conversation_name, created_at) in chats {
                let others = others_stmt
                    .query_map((id.as_str(), user_id), summary_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                let participants = query_participants(conn, &id)?;
                listings.push(ChatListing {
                    chat: ChatRow {
                        id,
                        conversation_name,
                        created_at,
                        participants,
                    },
                    others,
                });
            }
            Ok(listings)
        })
    }

    pub fn insert_message(&self, id: &str, chat_id: &str, author_id: &str, text: &str) -> Result<MessageRow> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO messages (id, chat_id, author_id, text) VALUES (?1, ?2, ?3, ?4)",
                (id, chat_id, author_id, text),
            )?;
            query_message(conn, id)?.ok_or_else(|| anyhow!("Message {} missing after insert", id))
        })
    }

    /// Newest-first page of visible messages, ordered by `(created_at, id)`.
    /// The cursor is the oldest message of the previous page: `before` is its
    /// `created_at` and `before_id` its id. Without `before_id` the cursor
    /// compares timestamps only.
    pub fn get_messages(
        &self,
        chat_id: &str,
        limit: u32,
        before: Option<&str>,
        before_id: Option<&str>,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.chat_id, m.author_id, u.username, m.text, m.is_visible, m.created_at, m.updated_at
                 FROM messages m
                 LEFT JOIN users u ON m.author_id = u.id
                 WHERE m.chat_id = ?1 AND m.is_visible = 1
                   AND (?2 IS NULL
                        OR m.created_at < ?2
                        OR (m.created_at = ?2 AND ?3 IS NOT NULL AND m.id < ?3))
                 ORDER BY m.created_at DESC, m.id DESC
                 LIMIT ?4",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![chat_id, before, before_id, limit], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

/// Insert a chat joining two users. Must run inside the caller's
/// transaction so the chat commits together with the friendship.
pub(crate) fn provision_in(conn: &Connection, user_a: &str, user_b: &str) -> Result<ChatRow> {
    let id = Uuid::new_v4().to_string();
    conn.execute("INSERT INTO chats (id) VALUES (?1)", [&id])?;
    for user in [user_a, user_b] {
        conn.execute(
            "INSERT INTO chat_participants (chat_id, user_id) VALUES (?1, ?2)",
            (id.as_str(), user),
        )?;
    }
    info!("Provisioned chat {} for {} and {}", id, user_a, user_b);
    query_chat(conn, &id)?.ok_or_else(|| anyhow!("Chat {} missing after insert", id))
}

fn query_chat(conn: &Connection, id: &str) -> Result<Option<ChatRow>> {
    let head: Option<(String, Option<String>, String)> = conn
        .query_row(
            "SELECT id, conversation_name, created_at FROM chats WHERE id = ?1",
            [id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let Some((id, conversation_name, created_at)) = head else {
        return Ok(None);
    };
    let participants = query_participants(conn, &id)?;
    Ok(Some(ChatRow {
        id,
        conversation_name,
        created_at,
        participants,
    }))
}

fn query_participants(conn: &Connection, chat_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT user_id FROM chat_participants WHERE chat_id = ?1 ORDER BY user_id")?;
    let ids = stmt
        .query_map([chat_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(ids)
}

fn query_message(conn: &Connection, id: &str) -> Result<Option<MessageRow>> {
    conn.query_row(
        "SELECT m.id, m.chat_id, m.author_id, u.username, m.text, m.is_visible, m.created_at, m.updated_at
         FROM messages m
         LEFT JOIN users u ON m.author_id = u.id
         WHERE m.id = ?1",
        [id],
        message_from_row,
    )
    .optional()
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        author_id: row.get(2)?,
        author_username: row
            .get::<_, Option<String>>(3)?
            .unwrap_or_else(|| "unknown".to_string()),
        text: row.get(4)?,
        is_visible: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}
