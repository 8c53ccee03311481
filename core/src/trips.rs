use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use travel_api::{Coordinate, PlaceOfInterest, Trip};
use uuid::Uuid;

use crate::conversations;
use crate::db::uuid_column;
use crate::error::{CoreError, Result};

const TRIP_COLUMNS: &str = "id, conversation_id, trip_type, date, trip_info, top_image";

fn row_to_trip(row: &rusqlite::Row<'_>) -> rusqlite::Result<Trip> {
    Ok(Trip {
        id: uuid_column(row, 0)?,
        conversation_id: row.get(1)?,
        trip_type: row.get(2)?,
        date: row.get(3)?,
        trip_info: row.get(4)?,
        places_of_interest: Vec::new(),
        top_image: row.get(5)?,
    })
}

/// Fails unless `conversation_id` names a conversation `owner` belongs to.
fn require_member(conn: &Connection, conversation_id: &str, owner: &str) -> Result<()> {
    let conversation = conversations::find_by_custom_id(conn, conversation_id)?
        .ok_or(CoreError::DocumentDoesNotExist)?;
    if !conversation.has_member(owner) {
        return Err(CoreError::AccessDenied(format!(
            "{owner} is not a member of conversation {conversation_id}"
        )));
    }
    Ok(())
}

/// Insert or update a trip owned by `owner` and replace its places.
///
/// An id already held by another account is refused, as is a linked
/// conversation the owner is not a member of.
pub fn save_trip(conn: &Connection, owner: &str, trip: &Trip) -> Result<()> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    if let Some(conversation_id) = &trip.conversation_id {
        require_member(&tx, conversation_id, owner)?;
    }
    let trip_id = trip.id.to_string();
    let written = tx.execute(
        "INSERT INTO trips (id, owner_email, conversation_id, trip_type, date, trip_info, top_image)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
           conversation_id = excluded.conversation_id,
           trip_type = excluded.trip_type,
           date = excluded.date,
           trip_info = excluded.trip_info,
           top_image = excluded.top_image
         WHERE trips.owner_email = excluded.owner_email",
        params![
            trip_id,
            owner,
            trip.conversation_id,
            trip.trip_type,
            trip.date,
            trip.trip_info,
            trip.top_image
        ],
    )?;
    if written == 0 {
        return Err(CoreError::AccessDenied(format!(
            "trip {} belongs to another account",
            trip.id
        )));
    }
    tx.execute(
        "DELETE FROM coordinates WHERE place_id IN (SELECT id FROM places WHERE trip_id = ?1)",
        [&trip_id],
    )?;
    tx.execute("DELETE FROM places WHERE trip_id = ?1", [&trip_id])?;
    for (position, place) in trip.places_of_interest.iter().enumerate() {
        let place_id = place.id.to_string();
        tx.execute(
            "INSERT INTO places (id, trip_id, position, time, activity, name, description)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                place_id,
                trip_id,
                position as i64,
                place.time,
                place.activity,
                place.name,
                place.description
            ],
        )?;
        tx.execute(
            "INSERT INTO coordinates (place_id, latitude, longitude) VALUES (?1, ?2, ?3)",
            params![place_id, place.coordinate.latitude, place.coordinate.longitude],
        )?;
    }
    tx.commit()?;
    tracing::debug!(trip = %trip.id, places = trip.places_of_interest.len(), "trip saved");
    Ok(())
}

fn load_places(conn: &Connection, trip: &mut Trip) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT p.id, p.time, p.activity, p.name, p.description, c.latitude, c.longitude
         FROM places p LEFT JOIN coordinates c ON c.place_id = p.id
         WHERE p.trip_id = ?1 ORDER BY p.position",
    )?;
    let rows = stmt.query_map([trip.id.to_string()], |row| {
        Ok((
            uuid_column(row, 0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, Option<f64>>(5)?,
            row.get::<_, Option<f64>>(6)?,
        ))
    })?;
    for row in rows {
        let (id, time, activity, name, description, lat, lon) = row?;
        let (Some(latitude), Some(longitude)) = (lat, lon) else {
            return Err(CoreError::CorruptRecord(format!("place {id} has no coordinate")));
        };
        trip.places_of_interest.push(PlaceOfInterest {
            id,
            time,
            activity,
            name,
            description,
            coordinate: Coordinate { latitude, longitude },
        });
    }
    Ok(())
}

fn query_one<P: rusqlite::Params>(conn: &Connection, filter: &str, args: P) -> Result<Option<Trip>> {
    let sql = format!("SELECT {TRIP_COLUMNS} FROM trips WHERE {filter} ORDER BY rowid LIMIT 1");
    let trip = conn.query_row(&sql, args, row_to_trip).optional()?;
    match trip {
        Some(mut t) => {
            load_places(conn, &mut t)?;
            Ok(Some(t))
        }
        None => Ok(None),
    }
}

/// Every trip of `owner` with its places, ordered by date.
pub fn fetch_all_trips(conn: &Connection, owner: &str) -> Result<Vec<Trip>> {
    let sql = format!("SELECT {TRIP_COLUMNS} FROM trips WHERE owner_email = ?1 ORDER BY date, rowid");
    let mut stmt = conn.prepare(&sql)?;
    let mut trips = stmt
        .query_map([owner], row_to_trip)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for trip in trips.iter_mut() {
        load_places(conn, trip)?;
    }
    Ok(trips)
}

pub fn fetch_trip(conn: &Connection, owner: &str, id: &Uuid) -> Result<Option<Trip>> {
    query_one(conn, "id = ?1 AND owner_email = ?2", params![id.to_string(), owner])
}

/// Find one of `owner`'s trips by its date and description.
pub fn find_by_match_key(
    conn: &Connection,
    owner: &str,
    date: i64,
    trip_info: &str,
) -> Result<Option<Trip>> {
    query_one(
        conn,
        "owner_email = ?1 AND date = ?2 AND trip_info = ?3",
        params![owner, date, trip_info],
    )
}

/// Delete a trip and its places. Returns false when `owner` has no such trip.
pub fn delete_trip(conn: &Connection, owner: &str, id: &Uuid) -> Result<bool> {
    let tx = conn.unchecked_transaction()?;
    let trip_id = id.to_string();
    let owned = tx
        .query_row(
            "SELECT 1 FROM trips WHERE id = ?1 AND owner_email = ?2",
            params![trip_id, owner],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if !owned {
        tracing::warn!(trip = %id, "delete ignored, trip not found");
        return Ok(false);
    }
    tx.execute(
        "DELETE FROM coordinates WHERE place_id IN (SELECT id FROM places WHERE trip_id = ?1)",
        [&trip_id],
    )?;
    tx.execute("DELETE FROM places WHERE trip_id = ?1", [&trip_id])?;
    tx.execute("DELETE FROM trips WHERE id = ?1", [&trip_id])?;
    tx.commit()?;
    Ok(true)
}

/// Record the conversation one of `owner`'s trips is discussed in.
pub fn link_conversation(
    conn: &Connection,
    owner: &str,
    id: &Uuid,
    conversation_id: &str,
) -> Result<()> {
    require_member(conn, conversation_id, owner)?;
    let changed = conn.execute(
        "UPDATE trips SET conversation_id = ?3 WHERE id = ?1 AND owner_email = ?2",
        params![id.to_string(), owner, conversation_id],
    )?;
    if changed == 0 {
        return Err(CoreError::DocumentDoesNotExist);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::users::tests::add_user;

    const OWNER: &str = "ada@x.io";

    fn sample() -> Trip {
        let mut trip = Trip::draft("Road trip", 1_700_000_000, "Great Ocean Road");
        trip.top_image = vec![1, 2, 3];
        trip.add_place(PlaceOfInterest::new(
            1_700_003_600,
            "hiking",
            "Cape Otway",
            "lighthouse walk",
            Coordinate { latitude: -38.85, longitude: 143.51 },
        ));
        trip.add_place(PlaceOfInterest::new(
            1_700_010_000,
            "surfing",
            "Bells Beach",
            "",
            Coordinate { latitude: -38.37, longitude: 144.28 },
        ));
        trip.add_place(PlaceOfInterest::new(
            1_700_020_000,
            "dining",
            "",
            "dinner",
            Coordinate { latitude: -38.34, longitude: 144.31 },
        ));
        trip
    }

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn saved_trip_reads_back_in_order() {
        let conn = db::init_db(":memory:").unwrap();
        let trip = sample();
        save_trip(&conn, OWNER, &trip).unwrap();
        let loaded = fetch_trip(&conn, OWNER, &trip.id).unwrap().unwrap();
        assert_eq!(loaded, trip);
        let names: Vec<&str> = loaded.places_of_interest.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Cape Otway", "Bells Beach", "Unknown"]);
        assert_eq!(fetch_all_trips(&conn, OWNER).unwrap().len(), 1);
    }

    #[test]
    fn editing_date_and_info_replaces_trip() {
        let conn = db::init_db(":memory:").unwrap();
        let mut trip = sample();
        save_trip(&conn, OWNER, &trip).unwrap();
        trip.date += 86_400;
        trip.trip_info = "Great Ocean Road, day two".into();
        trip.places_of_interest.remove(0);
        save_trip(&conn, OWNER, &trip).unwrap();

        let all = fetch_all_trips(&conn, OWNER).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].trip_info, "Great Ocean Road, day two");
        assert_eq!(all[0].places_of_interest.len(), 2);
        assert_eq!(count(&conn, "places"), 2);
        assert_eq!(count(&conn, "coordinates"), 2);
        assert!(find_by_match_key(&conn, OWNER, 1_700_000_000, "Great Ocean Road").unwrap().is_none());
        assert_eq!(
            find_by_match_key(&conn, OWNER, trip.date, &trip.trip_info).unwrap().unwrap().id,
            trip.id
        );
    }

    #[test]
    fn missing_coordinate_is_reported() {
        let conn = db::init_db(":memory:").unwrap();
        let trip = sample();
        save_trip(&conn, OWNER, &trip).unwrap();
        conn.execute(
            "DELETE FROM coordinates WHERE place_id = ?1",
            [trip.places_of_interest[1].id.to_string()],
        )
        .unwrap();
        assert!(matches!(
            fetch_trip(&conn, OWNER, &trip.id),
            Err(CoreError::CorruptRecord(_))
        ));
    }

    #[test]
    fn delete_removes_children_and_ignores_unknown() {
        let conn = db::init_db(":memory:").unwrap();
        let trip = sample();
        save_trip(&conn, OWNER, &trip).unwrap();
        assert!(delete_trip(&conn, OWNER, &trip.id).unwrap());
        assert_eq!(count(&conn, "trips"), 0);
        assert_eq!(count(&conn, "places"), 0);
        assert_eq!(count(&conn, "coordinates"), 0);
        assert!(!delete_trip(&conn, OWNER, &trip.id).unwrap());
    }

    #[test]
    fn linking_sets_conversation() {
        let conn = db::init_db(":memory:").unwrap();
        add_user(&conn, "Ada", "Lovelace", OWNER);
        add_user(&conn, "Bob", "Stone", "bob@x.io");
        add_user(&conn, "Cleo", "Park", "cleo@x.io");
        let ours = conversations::create_conversation(&conn, &["bob@x.io".into()], OWNER).unwrap();
        let theirs =
            conversations::create_conversation(&conn, &["cleo@x.io".into()], "bob@x.io").unwrap();
        let trip = sample();
        save_trip(&conn, OWNER, &trip).unwrap();
        link_conversation(&conn, OWNER, &trip.id, &ours.id).unwrap();
        let loaded = fetch_trip(&conn, OWNER, &trip.id).unwrap().unwrap();
        assert!(loaded.has_conversation_linked());
        assert_eq!(loaded.conversation_id.as_deref(), Some(ours.id.as_str()));
        assert!(matches!(
            link_conversation(&conn, OWNER, &trip.id, &theirs.id),
            Err(CoreError::AccessDenied(_))
        ));
        assert!(matches!(
            link_conversation(&conn, OWNER, &Uuid::new_v4(), &ours.id),
            Err(CoreError::DocumentDoesNotExist)
        ));
    }

    #[test]
    fn trips_are_private_to_their_owner() {
        let conn = db::init_db(":memory:").unwrap();
        add_user(&conn, "Bob", "Stone", "bob@x.io");
        add_user(&conn, "Cleo", "Park", "cleo@x.io");
        let trip = sample();
        save_trip(&conn, OWNER, &trip).unwrap();

        assert!(fetch_all_trips(&conn, "bob@x.io").unwrap().is_empty());
        assert!(fetch_trip(&conn, "bob@x.io", &trip.id).unwrap().is_none());
        assert!(find_by_match_key(&conn, "bob@x.io", trip.date, &trip.trip_info)
            .unwrap()
            .is_none());
        assert!(!delete_trip(&conn, "bob@x.io", &trip.id).unwrap());

        let mut hijack = trip.clone();
        hijack.trip_info = "mine now".into();
        assert!(matches!(
            save_trip(&conn, "bob@x.io", &hijack),
            Err(CoreError::AccessDenied(_))
        ));
        assert_eq!(
            fetch_trip(&conn, OWNER, &trip.id).unwrap().unwrap().trip_info,
            "Great Ocean Road"
        );

        let foreign =
            conversations::create_conversation(&conn, &["cleo@x.io".into()], "bob@x.io").unwrap();
        let mut linked = sample();
        linked.conversation_id = Some(foreign.id);
        assert!(matches!(
            save_trip(&conn, OWNER, &linked),
            Err(CoreError::AccessDenied(_))
        ));
        assert_eq!(fetch_all_trips(&conn, OWNER).unwrap().len(), 1);
    }
}
