//! Viewer-specific conversation names.
//!
//! A two-member conversation is shown under the other member's full name. A
//! larger conversation still carrying the placeholder name is shown as the
//! comma-joined first names of the other members. Member lookups run
//! concurrently and the name is assembled once all of them have finished; a
//! failed lookup only drops that member from the result.

use futures::future::join_all;
use std::sync::Arc;
use travel_api::{Conversation, DEFAULT_GROUP_NAME};

use crate::db::DbPool;
use crate::error::Result;
use crate::users;

/// Source of member full names.
pub trait NameDirectory: Send + Sync + 'static {
    /// Full name for an email, `None` when no account matches.
    fn full_name(&self, email: &str) -> Result<Option<String>>;
}

/// Directory backed by the users table.
#[derive(Clone)]
pub struct PoolDirectory {
    pool: DbPool,
}

impl PoolDirectory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl NameDirectory for PoolDirectory {
    fn full_name(&self, email: &str) -> Result<Option<String>> {
        let conn = self.pool.get()?;
        users::full_name(&conn, email)
    }
}

async fn lookup<D: NameDirectory>(directory: Arc<D>, email: String) -> Option<String> {
    let key = email.clone();
    match tokio::task::spawn_blocking(move || directory.full_name(&key)).await {
        Ok(Ok(Some(name))) => Some(name),
        Ok(Ok(None)) => {
            tracing::warn!(%email, "no name found for member");
            None
        }
        Ok(Err(e)) => {
            tracing::warn!(%email, error = %e, "member name lookup failed");
            None
        }
        Err(e) => {
            tracing::warn!(%email, error = %e, "member name lookup aborted");
            None
        }
    }
}

fn first_name(full_name: &str) -> &str {
    full_name.split(' ').next().unwrap_or(full_name)
}

/// Return `conversation` with its display name derived for `current_user_email`.
pub async fn derive_display_name<D: NameDirectory>(
    directory: Arc<D>,
    mut conversation: Conversation,
    current_user_email: &str,
) -> Conversation {
    let others: Vec<String> = conversation
        .other_members(current_user_email)
        .map(str::to_string)
        .collect();
    match conversation.member_emails.len() {
        2 => {
            if let Some(email) = others.into_iter().next() {
                if let Some(name) = lookup(directory, email).await {
                    conversation.display_name = name;
                }
            }
        }
        n if n > 2 => {
            // join_all yields results in member order regardless of completion order
            let names = join_all(others.into_iter().map(|e| lookup(directory.clone(), e))).await;
            let first_names: Vec<&str> = names.iter().flatten().map(|n| first_name(n)).collect();
            let is_placeholder = conversation.display_name.is_empty()
                || conversation.display_name == DEFAULT_GROUP_NAME;
            if is_placeholder && !first_names.is_empty() {
                conversation.display_name = first_names.join(", ");
            }
        }
        _ => {
            tracing::debug!(conversation = %conversation.id, "fewer than two members, name kept");
        }
    }
    conversation
}

/// Derive names for many conversations concurrently.
pub async fn derive_all<D: NameDirectory>(
    directory: Arc<D>,
    conversations: Vec<Conversation>,
    current_user_email: &str,
) -> Vec<Conversation> {
    join_all(
        conversations
            .into_iter()
            .map(|c| derive_display_name(directory.clone(), c, current_user_email)),
    )
    .await
}
