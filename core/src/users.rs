use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use time::OffsetDateTime;
use travel_api::User;
use uuid::Uuid;

use crate::error::{CoreError, Result};

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email regex"));

const USER_COLUMNS: &str =
    "id, first_name, last_name, email, city, country, street, postcode, age";

/// Fields supplied at registration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub street: String,
    #[serde(default)]
    pub postcode: String,
    #[serde(default)]
    pub age: u32,
}

/// Editable profile fields, including the interests document.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub street: String,
    #[serde(default)]
    pub postcode: String,
    #[serde(default)]
    pub age: u32,
    #[serde(default)]
    pub about_me: String,
    #[serde(default)]
    pub interests: Vec<String>,
}

/// Emails are compared trimmed and lowercase everywhere.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        first_name: row.get(1)?,
        last_name: row.get(2)?,
        email: row.get(3)?,
        city: row.get(4)?,
        country: row.get(5)?,
        street: row.get(6)?,
        postcode: row.get(7)?,
        age: row.get(8)?,
        interests: None,
        about_me: None,
    })
}

/// Create an account row. The caller hashes the password.
pub fn register_user(conn: &Connection, new: &NewUser, password_hash: &str) -> Result<User> {
    let email = normalize_email(&new.email);
    if !is_valid_email(&email) {
        return Err(CoreError::InvalidEmail(email));
    }
    if find_by_email(conn, &email)?.is_some() {
        return Err(CoreError::EmailAlreadyExists(email));
    }
    let user = User {
        id: Uuid::new_v4().to_string(),
        first_name: new.first_name.trim().into(),
        last_name: new.last_name.trim().into(),
        email,
        city: new.city.clone(),
        country: new.country.clone(),
        street: new.street.clone(),
        postcode: new.postcode.clone(),
        age: new.age,
        interests: None,
        about_me: None,
    };
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let res = conn.execute(
        "INSERT INTO users (id, email, first_name, last_name, city, country, street, postcode, age, password_hash, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            user.id,
            user.email,
            user.first_name,
            user.last_name,
            user.city,
            user.country,
            user.street,
            user.postcode,
            user.age,
            password_hash,
            now
        ],
    );
    match res {
        Ok(_) => {
            tracing::info!(email = %user.email, "registered user");
            Ok(user)
        }
        Err(e)
            if matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::ConstraintViolation)
            ) =>
        {
            Err(CoreError::EmailAlreadyExists(user.email))
        }
        Err(e) => Err(e.into()),
    }
}

pub fn find_by_email(conn: &Connection, email: &str) -> Result<Option<User>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1");
    let user = conn
        .query_row(&sql, [normalize_email(email)], row_to_user)
        .optional()?;
    Ok(user)
}

pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<User>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1");
    let user = conn.query_row(&sql, [id], row_to_user).optional()?;
    Ok(user)
}

/// Stored password hash for an email, if the account exists.
pub fn password_hash(conn: &Connection, email: &str) -> Result<Option<String>> {
    let hash = conn
        .query_row(
            "SELECT password_hash FROM users WHERE email = ?1",
            [normalize_email(email)],
            |row| row.get(0),
        )
        .optional()?;
    Ok(hash)
}

/// Resolve the generated id used as a message sender id.
pub fn current_user_id(conn: &Connection, email: &str) -> Result<String> {
    let id: Option<String> = conn
        .query_row(
            "SELECT id FROM users WHERE email = ?1",
            [normalize_email(email)],
            |row| row.get(0),
        )
        .optional()?;
    id.ok_or(CoreError::InvalidCurrentUserEmail)
}

/// `"{first} {last}"` for an email, if the account exists.
pub fn full_name(conn: &Connection, email: &str) -> Result<Option<String>> {
    let name: Option<(String, String)> = conn
        .query_row(
            "SELECT first_name, last_name FROM users WHERE email = ?1",
            [normalize_email(email)],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(name.map(|(first, last)| format!("{first} {last}")))
}

/// Subset of `emails` without an account, in input order.
pub fn emails_missing(conn: &Connection, emails: &[String]) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT 1 FROM users WHERE email = ?1")?;
    let mut missing = Vec::new();
    for email in emails {
        let found: Option<i64> = stmt
            .query_row([normalize_email(email)], |row| row.get(0))
            .optional()?;
        if found.is_none() {
            missing.push(email.clone());
        }
    }
    Ok(missing)
}

/// Interests and bio for an email; empty values when no document exists.
pub fn fetch_interests(conn: &Connection, email: &str) -> Result<(Vec<String>, String)> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT interests, about_me FROM user_interests WHERE email = ?1",
            [normalize_email(email)],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match row {
        Some((interests, about_me)) => Ok((serde_json::from_str(&interests)?, about_me)),
        None => Ok((Vec::new(), String::new())),
    }
}

/// User row merged with its interests document.
pub fn fetch_profile(conn: &Connection, email: &str) -> Result<Option<User>> {
    let Some(mut user) = find_by_email(conn, email)? else {
        return Ok(None);
    };
    let (interests, about_me) = fetch_interests(conn, &user.email)?;
    user.interests = Some(interests);
    user.about_me = Some(about_me);
    Ok(Some(user))
}

pub fn update_profile(conn: &Connection, email: &str, update: &ProfileUpdate) -> Result<User> {
    let email = normalize_email(email);
    let tx = conn.unchecked_transaction()?;
    let changed = tx.execute(
        "UPDATE users SET first_name = ?2, last_name = ?3, city = ?4, country = ?5, street = ?6, postcode = ?7, age = ?8
         WHERE email = ?1",
        params![
            email,
            update.first_name.trim(),
            update.last_name.trim(),
            update.city,
            update.country,
            update.street,
            update.postcode,
            update.age
        ],
    )?;
    if changed == 0 {
        return Err(CoreError::DocumentDoesNotExist);
    }
    tx.execute(
        "INSERT INTO user_interests (email, interests, about_me) VALUES (?1, ?2, ?3)
         ON CONFLICT(email) DO UPDATE SET interests = excluded.interests, about_me = excluded.about_me",
        params![email, serde_json::to_string(&update.interests)?, update.about_me],
    )?;
    tx.commit()?;
    fetch_profile(conn, &email)?.ok_or(CoreError::DocumentDoesNotExist)
}

/// Remove the account and its interests document. Conversations are kept.
pub fn delete_profile(conn: &Connection, email: &str) -> Result<bool> {
    let email = normalize_email(email);
    let tx = conn.unchecked_transaction()?;
    let removed = tx.execute("DELETE FROM users WHERE email = ?1", [&email])?;
    tx.execute("DELETE FROM user_interests WHERE email = ?1", [&email])?;
    tx.commit()?;
    if removed > 0 {
        tracing::info!(%email, "deleted profile");
    }
    Ok(removed > 0)
}

/// Interests of every user except `email`.
pub fn other_users_interests(conn: &Connection, email: &str) -> Result<Vec<(String, Vec<String>)>> {
    let mut stmt = conn.prepare(
        "SELECT email, interests FROM user_interests WHERE email <> ?1 ORDER BY email",
    )?;
    let rows = stmt
        .query_map([normalize_email(email)], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let mut out = Vec::with_capacity(rows.len());
    for (other, raw) in rows {
        out.push((other, serde_json::from_str(&raw)?));
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db;

    pub(crate) fn add_user(conn: &Connection, first: &str, last: &str, email: &str) -> User {
        register_user(
            conn,
            &NewUser {
                first_name: first.into(),
                last_name: last.into(),
                email: email.into(),
                city: "Melbourne".into(),
                country: "Australia".into(),
                age: 30,
                ..Default::default()
            },
            "hash",
        )
        .unwrap()
    }

    #[test]
    fn register_and_lookup() {
        let conn = db::init_db(":memory:").unwrap();
        let user = add_user(&conn, "Ada", "Lovelace", " Ada@Example.com ");
        assert_eq!(user.email, "ada@example.com");
        assert_eq!(
            find_by_email(&conn, "ADA@example.com").unwrap().unwrap().id,
            user.id
        );
        assert_eq!(find_by_id(&conn, &user.id).unwrap().unwrap().email, user.email);
        assert_eq!(
            full_name(&conn, "ada@example.com").unwrap().as_deref(),
            Some("Ada Lovelace")
        );
        assert_eq!(current_user_id(&conn, "ada@example.com").unwrap(), user.id);
        assert!(matches!(
            current_user_id(&conn, "nobody@example.com"),
            Err(CoreError::InvalidCurrentUserEmail)
        ));
        assert_eq!(password_hash(&conn, "ada@example.com").unwrap().as_deref(), Some("hash"));
    }

    #[test]
    fn register_rejects_bad_and_duplicate_email() {
        let conn = db::init_db(":memory:").unwrap();
        add_user(&conn, "Ada", "Lovelace", "ada@example.com");
        let dup = NewUser {
            first_name: "A".into(),
            last_name: "L".into(),
            email: "ADA@example.com".into(),
            ..Default::default()
        };
        assert!(matches!(
            register_user(&conn, &dup, "h"),
            Err(CoreError::EmailAlreadyExists(_))
        ));
        let bad = NewUser {
            email: "not-an-email".into(),
            ..dup
        };
        assert!(matches!(
            register_user(&conn, &bad, "h"),
            Err(CoreError::InvalidEmail(_))
        ));
    }

    #[test]
    fn profile_update_merges_interests() {
        let conn = db::init_db(":memory:").unwrap();
        add_user(&conn, "Ada", "Lovelace", "ada@example.com");
        let profile = fetch_profile(&conn, "ada@example.com").unwrap().unwrap();
        assert_eq!(profile.interests, Some(vec![]));
        assert_eq!(profile.about_me.as_deref(), Some(""));

        let update = ProfileUpdate {
            first_name: "Augusta".into(),
            last_name: "King".into(),
            city: "London".into(),
            age: 36,
            about_me: "Engines".into(),
            interests: vec!["Hiking".into(), "Museums".into()],
            ..Default::default()
        };
        let user = update_profile(&conn, "ada@example.com", &update).unwrap();
        assert_eq!(user.first_name, "Augusta");
        assert_eq!(user.city, "London");
        assert_eq!(user.interests.unwrap(), vec!["Hiking", "Museums"]);
        assert_eq!(user.about_me.as_deref(), Some("Engines"));

        assert!(matches!(
            update_profile(&conn, "ghost@example.com", &update),
            Err(CoreError::DocumentDoesNotExist)
        ));
    }

    #[test]
    fn delete_cascades_to_interests() {
        let conn = db::init_db(":memory:").unwrap();
        add_user(&conn, "Ada", "Lovelace", "ada@example.com");
        add_user(&conn, "Bob", "Stone", "bob@example.com");
        let update = ProfileUpdate {
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            interests: vec!["Hiking".into()],
            ..Default::default()
        };
        update_profile(&conn, "ada@example.com", &update).unwrap();
        assert_eq!(other_users_interests(&conn, "bob@example.com").unwrap().len(), 1);
        assert!(delete_profile(&conn, "ada@example.com").unwrap());
        assert!(!delete_profile(&conn, "ada@example.com").unwrap());
        assert!(find_by_email(&conn, "ada@example.com").unwrap().is_none());
        assert!(other_users_interests(&conn, "bob@example.com").unwrap().is_empty());
    }

    #[test]
    fn missing_emails_keep_input_order() {
        let conn = db::init_db(":memory:").unwrap();
        add_user(&conn, "Ada", "Lovelace", "ada@example.com");
        let missing = emails_missing(
            &conn,
            &["zed@example.com".into(), "ada@example.com".into(), "amy@example.com".into()],
        )
        .unwrap();
        assert_eq!(missing, vec!["zed@example.com", "amy@example.com"]);
    }
}
