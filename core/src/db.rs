use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Open a single connection and apply the schema.
pub fn init_db<P: AsRef<Path>>(path: P) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

/// Open a connection pool on a database file and apply the schema once.
pub fn open_pool<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let manager = SqliteConnectionManager::file(path.as_ref()).with_init(|c| {
        c.pragma_update(None, "foreign_keys", "ON")?;
        c.busy_timeout(Duration::from_secs(5))
    });
    let pool = Pool::new(manager)?;
    pool.get()?.execute_batch(SCHEMA)?;
    tracing::info!(path = %path.as_ref().display(), "database ready");
    Ok(pool)
}

/// Read a TEXT column holding a UUID.
pub(crate) fn uuid_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
  id TEXT PRIMARY KEY,
  email TEXT UNIQUE NOT NULL,
  first_name TEXT NOT NULL,
  last_name TEXT NOT NULL,
  city TEXT NOT NULL DEFAULT '',
  country TEXT NOT NULL DEFAULT '',
  street TEXT NOT NULL DEFAULT '',
  postcode TEXT NOT NULL DEFAULT '',
  age INTEGER NOT NULL DEFAULT 0,
  password_hash TEXT NOT NULL DEFAULT '',
  created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS user_interests (
  email TEXT PRIMARY KEY,
  interests TEXT NOT NULL DEFAULT '[]',
  about_me TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS conversations (
  document_id TEXT PRIMARY KEY,
  id TEXT UNIQUE NOT NULL,
  display_name TEXT NOT NULL,
  is_group INTEGER NOT NULL DEFAULT 0,
  trip_id TEXT,
  created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS conversation_members (
  document_id TEXT NOT NULL REFERENCES conversations(document_id) ON DELETE CASCADE,
  email TEXT NOT NULL,
  position INTEGER NOT NULL,
  PRIMARY KEY (document_id, email)
);
CREATE INDEX IF NOT EXISTS conversation_members_by_email ON conversation_members(email);

CREATE TABLE IF NOT EXISTS messages (
  id TEXT PRIMARY KEY,
  conversation_id TEXT NOT NULL REFERENCES conversations(document_id) ON DELETE CASCADE,
  sender_id TEXT NOT NULL,
  text TEXT,
  media_url TEXT,
  timestamp INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS messages_by_conversation ON messages(conversation_id, timestamp);

CREATE TABLE IF NOT EXISTS trips (
  id TEXT PRIMARY KEY,
  owner_email TEXT NOT NULL,
  conversation_id TEXT,
  trip_type TEXT NOT NULL,
  date INTEGER NOT NULL,
  trip_info TEXT NOT NULL,
  top_image BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS trips_by_owner ON trips(owner_email, date);

CREATE TABLE IF NOT EXISTS places (
  id TEXT PRIMARY KEY,
  trip_id TEXT NOT NULL REFERENCES trips(id) ON DELETE CASCADE,
  position INTEGER NOT NULL,
  time INTEGER NOT NULL,
  activity TEXT NOT NULL,
  name TEXT NOT NULL,
  description TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS coordinates (
  place_id TEXT PRIMARY KEY REFERENCES places(id) ON DELETE CASCADE,
  latitude REAL NOT NULL,
  longitude REAL NOT NULL
);
"#;
