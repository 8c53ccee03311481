use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;
use travel_api::{Conversation, Message};
use uuid::Uuid;

use crate::conversations;
use crate::error::{CoreError, Result};

pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn row_to_msg(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        text: row.get(3)?,
        timestamp: row.get(4)?,
        media_url: row.get(5)?,
    })
}

/// Write a message row without checking that the conversation exists.
pub(crate) fn append_message(
    conn: &Connection,
    document_id: &str,
    sender_id: &str,
    text: Option<&str>,
    media_url: Option<&str>,
) -> Result<Message> {
    let text = non_blank(text);
    let media_url = non_blank(media_url);
    if text.is_none() && media_url.is_none() {
        return Err(CoreError::EmptyMessage);
    }
    let msg = Message {
        id: Uuid::new_v4().to_string(),
        conversation_id: document_id.into(),
        sender_id: sender_id.into(),
        text,
        timestamp: now_millis(),
        media_url,
    };
    conn.execute(
        "INSERT INTO messages (id, conversation_id, sender_id, text, media_url, timestamp) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            msg.id,
            msg.conversation_id,
            msg.sender_id,
            msg.text,
            msg.media_url,
            msg.timestamp
        ],
    )?;
    Ok(msg)
}

/// Append a message to a conversation's feed.
///
/// Fails with [`CoreError::EmptyMessage`] before touching the store when
/// neither text nor media URL carries content.
pub fn send_message(
    conn: &Connection,
    document_id: &str,
    sender_id: &str,
    text: Option<&str>,
    media_url: Option<&str>,
) -> Result<Message> {
    if !Message::has_content(text, media_url) {
        return Err(CoreError::EmptyMessage);
    }
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM conversations WHERE document_id = ?1",
            [document_id],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(CoreError::DocumentDoesNotExist);
    }
    let msg = append_message(conn, document_id, sender_id, text, media_url)?;
    tracing::debug!(conversation = %document_id, message = %msg.id, "message sent");
    Ok(msg)
}

/// All messages of a conversation document, oldest first.
pub fn list_messages(conn: &Connection, document_id: &str) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(
        "SELECT id, conversation_id, sender_id, text, timestamp, media_url FROM messages
         WHERE conversation_id = ?1 ORDER BY timestamp ASC, rowid ASC",
    )?;
    let msgs = stmt
        .query_map([document_id], row_to_msg)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(msgs)
}

/// Resolve an app-level conversation id and list its messages.
pub fn fetch_messages(conn: &Connection, custom_id: &str) -> Result<(Conversation, Vec<Message>)> {
    let conversation =
        conversations::find_by_custom_id(conn, custom_id)?.ok_or(CoreError::DocumentDoesNotExist)?;
    let msgs = list_messages(conn, &conversation.document_id)?;
    Ok((conversation, msgs))
}
