use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::sync::Arc;
use travel_api::{Conversation, DEFAULT_GROUP_NAME, INITIAL_MESSAGE_TEXT, SYSTEM_SENDER_ID};
use uuid::Uuid;

use crate::db::DbPool;
use crate::display_name::{derive_all, derive_display_name, NameDirectory};
use crate::error::{CoreError, Result};
use crate::messages;
use crate::users::{self, normalize_email};

const CONVERSATION_COLUMNS: &str = "document_id, id, display_name, is_group, trip_id";

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let trip_id: Option<String> = row.get(4)?;
    Ok(Conversation {
        document_id: row.get(0)?,
        id: row.get(1)?,
        member_emails: Vec::new(),
        display_name: row.get(2)?,
        is_group: row.get::<_, i64>(3)? != 0,
        trip_id: trip_id.and_then(|s| Uuid::parse_str(&s).ok()),
    })
}

fn load_members(conn: &Connection, conversation: &mut Conversation) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT email FROM conversation_members WHERE document_id = ?1 ORDER BY position",
    )?;
    conversation.member_emails = stmt
        .query_map([&conversation.document_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(())
}

fn query_one(conn: &Connection, filter: &str, value: &str) -> Result<Option<Conversation>> {
    let sql = format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE {filter} = ?1");
    let conversation = conn
        .query_row(&sql, [value], row_to_conversation)
        .optional()?;
    match conversation {
        Some(mut c) => {
            load_members(conn, &mut c)?;
            Ok(Some(c))
        }
        None => Ok(None),
    }
}

/// Store a new conversation and its members, assigning the document id.
pub fn insert_conversation(conn: &Connection, conversation: &mut Conversation) -> Result<()> {
    if conversation.document_id.is_empty() {
        conversation.document_id = Uuid::new_v4().to_string();
    }
    let now = messages::now_millis();
    conn.execute(
        "INSERT INTO conversations (document_id, id, display_name, is_group, trip_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            conversation.document_id,
            conversation.id,
            conversation.display_name,
            conversation.is_group as i64,
            conversation.trip_id.map(|t| t.to_string()),
            now
        ],
    )?;
    for (position, email) in conversation.member_emails.iter().enumerate() {
        conn.execute(
            "INSERT INTO conversation_members (document_id, email, position) VALUES (?1, ?2, ?3)",
            params![conversation.document_id, email, position as i64],
        )?;
    }
    Ok(())
}

pub fn find_by_custom_id(conn: &Connection, id: &str) -> Result<Option<Conversation>> {
    query_one(conn, "id", id)
}

pub fn find_by_document_id(conn: &Connection, document_id: &str) -> Result<Option<Conversation>> {
    query_one(conn, "document_id", document_id)
}

pub fn find_by_trip_id(conn: &Connection, trip_id: &Uuid) -> Result<Option<Conversation>> {
    query_one(conn, "trip_id", &trip_id.to_string())
}

/// Conversations that list `email` as a member, oldest first.
pub fn list_for_member(conn: &Connection, email: &str) -> Result<Vec<Conversation>> {
    let sql = format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations
         WHERE document_id IN (SELECT document_id FROM conversation_members WHERE email = ?1)
         ORDER BY created_at, rowid"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut found = stmt
        .query_map([normalize_email(email)], row_to_conversation)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for c in found.iter_mut() {
        load_members(conn, c)?;
    }
    Ok(found)
}

/// Existing conversation whose member set equals `members`, ignoring order.
pub fn find_with_members(conn: &Connection, members: &[String]) -> Result<Option<Conversation>> {
    let Some(first) = members.first() else {
        return Ok(None);
    };
    Ok(list_for_member(conn, first)?
        .into_iter()
        .find(|c| c.has_same_members(members)))
}

/// Normalize candidate emails: trimmed, lowercase, deduplicated, creator removed.
pub fn prepare_members(candidates: &[String], current_user_email: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(candidates.len());
    for email in candidates.iter().map(|e| normalize_email(e)) {
        if email.is_empty() || email == current_user_email || out.contains(&email) {
            continue;
        }
        out.push(email);
    }
    out
}

/// Validate and store a new conversation, seeding it with the system message.
///
/// Every candidate must have an account, and no existing conversation may
/// have exactly the same member set. The stored display name is the
/// placeholder; callers derive the viewer-specific name afterwards.
pub fn create_conversation(
    conn: &Connection,
    candidates: &[String],
    current_user_email: &str,
) -> Result<Conversation> {
    let current = normalize_email(current_user_email);
    if current.is_empty() {
        return Err(CoreError::InvalidCurrentUserEmail);
    }
    let mut members = prepare_members(candidates, &current);
    if members.is_empty() {
        return Err(CoreError::NoMembers);
    }

    // the write lock is held from the checks through the insert
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let missing = users::emails_missing(&tx, &members)?;
    if !missing.is_empty() {
        return Err(CoreError::UnknownMembers(missing));
    }
    members.push(current.clone());
    if find_with_members(&tx, &members)?.is_some() {
        return Err(CoreError::DuplicateConversation);
    }

    let mut conversation = Conversation::new(members, &current, DEFAULT_GROUP_NAME);
    insert_conversation(&tx, &mut conversation)?;
    messages::append_message(
        &tx,
        &conversation.document_id,
        SYSTEM_SENDER_ID,
        Some(INITIAL_MESSAGE_TEXT),
        None,
    )?;
    tx.commit()?;
    tracing::info!(
        conversation = %conversation.id,
        members = conversation.member_emails.len(),
        "conversation created"
    );
    Ok(conversation)
}

fn update_by_custom_id(conn: &Connection, sql: &str, id: &str, value: &dyn rusqlite::ToSql) -> Result<()> {
    let changed = conn.execute(sql, params![id, value])?;
    if changed == 0 {
        return Err(CoreError::DocumentDoesNotExist);
    }
    Ok(())
}

pub fn rename_conversation(conn: &Connection, id: &str, new_name: &str) -> Result<()> {
    update_by_custom_id(
        conn,
        "UPDATE conversations SET display_name = ?2 WHERE id = ?1",
        id,
        &new_name.trim(),
    )
}

pub fn convert_to_group(conn: &Connection, id: &str) -> Result<()> {
    update_by_custom_id(
        conn,
        "UPDATE conversations SET is_group = ?2 WHERE id = ?1",
        id,
        &1i64,
    )
}

pub fn link_trip(conn: &Connection, id: &str, trip_id: &Uuid) -> Result<()> {
    update_by_custom_id(
        conn,
        "UPDATE conversations SET trip_id = ?2 WHERE id = ?1",
        id,
        &trip_id.to_string(),
    )
}

/// Create a conversation on the pool and return it named for the creator.
pub async fn start_conversation<D: NameDirectory>(
    pool: &DbPool,
    directory: Arc<D>,
    candidates: Vec<String>,
    current_user_email: &str,
) -> Result<Conversation> {
    let pool = pool.clone();
    let current = current_user_email.to_string();
    let conversation = tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        create_conversation(&conn, &candidates, &current)
    })
    .await??;
    Ok(derive_display_name(directory, conversation, &normalize_email(current_user_email)).await)
}

/// Every conversation of `email` with display names derived for that user.
pub async fn conversations_for<D: NameDirectory>(
    pool: &DbPool,
    directory: Arc<D>,
    email: &str,
) -> Result<Vec<Conversation>> {
    let pool = pool.clone();
    let current = normalize_email(email);
    let lookup = current.clone();
    let found = tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        list_for_member(&conn, &lookup)
    })
    .await??;
    Ok(derive_all(directory, found, &current).await)
}
