use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct EventId(pub i64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EventId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(EventId)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct BookingId(pub i64);

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EventMode {
    Online,
    Offline,
    Hybrid,
}

impl EventMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventMode::Online => "online",
            EventMode::Offline => "offline",
            EventMode::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for EventMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "online" => Ok(EventMode::Online),
            "offline" => Ok(EventMode::Offline),
            "hybrid" => Ok(EventMode::Hybrid),
            other => Err(format!(
                "mode must be one of online, offline, hybrid (got `{other}`)"
            )),
        }
    }
}

/// A stored event. `slug`, `date` and `time` are always in canonical form.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Event {
    pub id: EventId,
    pub title: String,
    pub slug: String,
    pub description: String,
    pub overview: String,
    pub image: String,
    pub venue: String,
    pub location: String,
    pub date: String, // YYYY-MM-DD
    pub time: String, // HH:MM, 24-hour
    pub mode: EventMode,
    pub audience: String,
    pub agenda: Vec<String>,
    pub organizer: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    pub fn shares_tag_with(&self, other: &Event) -> bool {
        self.tags.iter().any(|tag| other.tags.contains(tag))
    }
}

/// Fields submitted for an event write, before normalization.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct EventDraft {
    pub title: String,
    pub description: String,
    pub overview: String,
    pub image: String,
    pub venue: String,
    pub location: String,
    pub date: String,
    pub time: String,
    pub mode: String,
    pub audience: String,
    pub agenda: Vec<String>,
    pub organizer: String,
    pub tags: Vec<String>,
}

impl From<&Event> for EventDraft {
    fn from(event: &Event) -> Self {
        Self {
            title: event.title.clone(),
            description: event.description.clone(),
            overview: event.overview.clone(),
            image: event.image.clone(),
            venue: event.venue.clone(),
            location: event.location.clone(),
            date: event.date.clone(),
            time: event.time.clone(),
            mode: event.mode.to_string(),
            audience: event.audience.clone(),
            agenda: event.agenda.clone(),
            organizer: event.organizer.clone(),
            tags: event.tags.clone(),
        }
    }
}

/// Partial update; `None` keeps the stored value.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct EventPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub overview: Option<String>,
    pub image: Option<String>,
    pub venue: Option<String>,
    pub location: Option<String>,
    pub date: Option<String>,
    pub time: Option<String>,
    pub mode: Option<String>,
    pub audience: Option<String>,
    pub agenda: Option<Vec<String>>,
    pub organizer: Option<String>,
    pub tags: Option<Vec<String>>,
}

impl EventPatch {
    pub fn apply_to(self, draft: &mut EventDraft) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if let Some(value) = self.$field {
                    draft.$field = value;
                })*
            };
        }
        take!(
            title,
            description,
            overview,
            image,
            venue,
            location,
            date,
            time,
            mode,
            audience,
            agenda,
            organizer,
            tags
        );
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Booking {
    pub id: BookingId,
    pub event_id: EventId,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("Hybrid".parse::<EventMode>(), Ok(EventMode::Hybrid));
        assert_eq!(" ONLINE ".parse::<EventMode>(), Ok(EventMode::Online));
        assert!("in-person".parse::<EventMode>().is_err());
    }

    #[test]
    fn patch_only_overwrites_present_fields() {
        let mut draft = EventDraft {
            title: "Rust Meetup".into(),
            venue: "Hall A".into(),
            tags: vec!["rust".into()],
            ..EventDraft::default()
        };
        let patch = EventPatch {
            venue: Some("Hall B".into()),
            ..EventPatch::default()
        };
        patch.apply_to(&mut draft);
        assert_eq!(draft.title, "Rust Meetup");
        assert_eq!(draft.venue, "Hall B");
        assert_eq!(draft.tags, vec!["rust".to_string()]);
    }
}
