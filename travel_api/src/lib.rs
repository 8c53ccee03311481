use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Placeholder name a conversation carries until a name is derived or chosen.
pub const DEFAULT_GROUP_NAME: &str = "Default Group";

/// Text of the system message appended to every new conversation.
pub const INITIAL_MESSAGE_TEXT: &str = "Conversation initiated";

/// Sender id used for messages not written by a user.
pub const SYSTEM_SENDER_ID: &str = "system";

/// Registered user profile.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub city: String,
    pub country: String,
    pub street: String,
    pub postcode: String,
    pub age: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interests: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about_me: Option<String>,
}

impl User {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// A named set of members plus an ordered message feed.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Store-level identifier of the conversation document.
    #[serde(rename = "documentID", default)]
    pub document_id: String,
    /// App-level identifier shared with clients and linked trips.
    pub id: String,
    pub member_emails: Vec<String>,
    pub display_name: String,
    pub is_group: bool,
    #[serde(rename = "tripID", default, skip_serializing_if = "Option::is_none")]
    pub trip_id: Option<Uuid>,
}

impl Conversation {
    /// Build a fresh conversation for the given members, not yet stored.
    pub fn new(member_emails: Vec<String>, current_user_email: &str, display_name: &str) -> Self {
        let is_group = Self::is_group_for(&member_emails, current_user_email);
        Self {
            document_id: String::new(),
            id: Uuid::new_v4().to_string(),
            member_emails,
            display_name: display_name.into(),
            is_group,
            trip_id: None,
        }
    }

    /// More than two members, or two members that do not include the creator.
    pub fn is_group_for(member_emails: &[String], current_user_email: &str) -> bool {
        member_emails.len() > 2
            || (member_emails.len() == 2
                && !member_emails.iter().any(|e| e == current_user_email))
    }

    /// Compare member lists as unordered sets.
    pub fn has_same_members(&self, other: &[String]) -> bool {
        let mine: HashSet<&str> = self.member_emails.iter().map(String::as_str).collect();
        let theirs: HashSet<&str> = other.iter().map(String::as_str).collect();
        mine == theirs
    }

    pub fn has_member(&self, email: &str) -> bool {
        self.member_emails.iter().any(|e| e == email)
    }

    /// Members other than `current_user_email`, in stored order.
    pub fn other_members<'a>(&'a self, current_user_email: &'a str) -> impl Iterator<Item = &'a str> {
        self.member_emails
            .iter()
            .map(String::as_str)
            .filter(move |e| *e != current_user_email)
    }
}

/// A single entry in a conversation's message feed.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    #[serde(rename = "conversationID")]
    pub conversation_id: String,
    #[serde(rename = "senderID")]
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    #[serde(rename = "mediaURL", default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
}

impl Message {
    /// A message needs non-blank text or a non-blank media URL.
    pub fn has_content(text: Option<&str>, media_url: Option<&str>) -> bool {
        let filled = |v: Option<&str>| v.map(|s| !s.trim().is_empty()).unwrap_or(false);
        filled(text) || filled(media_url)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

/// One stop of a trip.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PlaceOfInterest {
    pub id: Uuid,
    /// Planned visit time, unix seconds.
    pub time: i64,
    /// Free-form activity tag such as "hiking" or "dining".
    #[serde(rename = "type")]
    pub activity: String,
    pub name: String,
    pub description: String,
    pub coordinate: Coordinate,
}

impl PlaceOfInterest {
    pub fn new(time: i64, activity: &str, name: &str, description: &str, coordinate: Coordinate) -> Self {
        let name = if name.trim().is_empty() { "Unknown" } else { name };
        Self {
            id: Uuid::new_v4(),
            time,
            activity: activity.into(),
            name: name.into(),
            description: description.into(),
            coordinate,
        }
    }

    pub fn category(&self) -> ActivityCategory {
        ActivityCategory::from_tag(&self.activity)
    }
}

/// A dated itinerary of ordered places.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Trip {
    pub id: Uuid,
    #[serde(rename = "conversationID", default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(rename = "type")]
    pub trip_type: String,
    /// Trip date, unix seconds.
    pub date: i64,
    pub trip_info: String,
    #[serde(default)]
    pub places_of_interest: Vec<PlaceOfInterest>,
    #[serde(default, with = "base64_bytes")]
    pub top_image: Vec<u8>,
}

impl Trip {
    /// Start an unsaved trip in editing state.
    pub fn draft(trip_type: &str, date: i64, trip_info: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id: None,
            trip_type: trip_type.into(),
            date,
            trip_info: trip_info.into(),
            places_of_interest: Vec::new(),
            top_image: Vec::new(),
        }
    }

    pub fn add_place(&mut self, place: PlaceOfInterest) {
        self.places_of_interest.push(place);
    }

    pub fn has_conversation_linked(&self) -> bool {
        self.conversation_id.is_some()
    }
}

/// Coarse grouping of activity tags.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActivityCategory {
    Outdoor,
    Water,
    Leisure,
    Sports,
    Camping,
    Dining,
    Shopping,
    Other,
}

impl ActivityCategory {
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_lowercase().as_str() {
            "walking" | "hiking" | "archery" | "bird watching" | "outdooryoga" | "rockclimbing"
            | "running" | "skateboarding" => Self::Outdoor,
            "swimming" | "fishing" | "kayaking" | "paddleboarding" | "surfing" => Self::Water,
            "party" | "gaming" => Self::Leisure,
            "biking" => Self::Sports,
            "camping" => Self::Camping,
            "dining" => Self::Dining,
            "shopping" => Self::Shopping,
            _ => Self::Other,
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
