use std::collections::HashSet;

use crate::db::DbPool;
use crate::error::Result;
use crate::users;

/// Emails of `others` sharing at least one interest with `mine`, sorted.
pub fn common_interest_matches(mine: &[String], others: &[(String, Vec<String>)]) -> Vec<String> {
    let wanted: HashSet<String> = mine.iter().map(|i| i.trim().to_lowercase()).collect();
    let mut matches: Vec<String> = others
        .iter()
        .filter(|(_, theirs)| theirs.iter().any(|i| wanted.contains(&i.trim().to_lowercase())))
        .map(|(email, _)| email.clone())
        .collect();
    matches.sort();
    matches.dedup();
    matches
}

/// Load both sides concurrently and match on shared interests.
pub async fn recommend_buddies(pool: &DbPool, email: &str) -> Result<Vec<String>> {
    let mine_pool = pool.clone();
    let mine_email = email.to_string();
    let mine = tokio::task::spawn_blocking(move || {
        let conn = mine_pool.get()?;
        users::fetch_interests(&conn, &mine_email).map(|(interests, _)| interests)
    });
    let others_pool = pool.clone();
    let others_email = email.to_string();
    let others = tokio::task::spawn_blocking(move || {
        let conn = others_pool.get()?;
        users::other_users_interests(&conn, &others_email)
    });
    let (mine, others) = tokio::join!(mine, others);
    let (mine, others) = (mine??, others??);
    let found = common_interest_matches(&mine, &others);
    tracing::debug!(%email, count = found.len(), "buddy recommendations");
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::users::tests::add_user;
    use crate::users::{update_profile, ProfileUpdate};

    fn interests(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn matches_require_one_shared_interest() {
        let others = vec![
            ("cleo@x.io".to_string(), interests(&["Surfing", "dining"])),
            ("bob@x.io".to_string(), interests(&["hiking"])),
            ("dan@x.io".to_string(), interests(&["chess"])),
            ("eve@x.io".to_string(), vec![]),
        ];
        let found = common_interest_matches(&interests(&["surfing", "hiking"]), &others);
        assert_eq!(found, vec!["bob@x.io", "cleo@x.io"]);
        assert!(common_interest_matches(&[], &others).is_empty());
    }

    #[tokio::test]
    async fn recommends_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::open_pool(dir.path().join("travel.db")).unwrap();
        {
            let conn = pool.get().unwrap();
            for (first, email, list) in [
                ("Ada", "ada@x.io", vec!["hiking", "camping"]),
                ("Bob", "bob@x.io", vec!["camping"]),
                ("Cleo", "cleo@x.io", vec!["shopping"]),
            ] {
                add_user(&conn, first, "Test", email);
                update_profile(
                    &conn,
                    email,
                    &ProfileUpdate {
                        first_name: first.into(),
                        last_name: "Test".into(),
                        interests: interests(&list),
                        ..Default::default()
                    },
                )
                .unwrap();
            }
        }
        assert_eq!(recommend_buddies(&pool, "ada@x.io").await.unwrap(), vec!["bob@x.io"]);
        assert!(recommend_buddies(&pool, "cleo@x.io").await.unwrap().is_empty());
        assert!(recommend_buddies(&pool, "nobody@x.io").await.unwrap().is_empty());
    }
}
