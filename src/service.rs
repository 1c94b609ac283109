use std::sync::Arc;

use chrono::{Duration, Utc};
use chrono_tz::Tz;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::db::{Database, Store};
use crate::error::{Error, Result};
use crate::models::{Booking, Event, EventDraft, EventId, EventPatch};
use crate::normalize::{
    normalize_email, normalize_event, slugify, validate_slug, with_timestamp_suffix,
    NormalizeContext, NormalizedEvent,
};

/// Extra attempts made when the unique slug index rejects a write that passed
/// the collision pre-check (two identical titles written concurrently).
const SLUG_RETRIES: i64 = 3;

/// Event and booking operations. Store work runs on the blocking pool.
#[derive(Clone)]
pub struct EventService {
    db: Arc<Database>,
    timezone: Tz,
}

impl EventService {
    pub fn new(db: Arc<Database>, timezone: Tz) -> Self {
        Self { db, timezone }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            Arc::new(Database::new(config.database_path())),
            config.timezone(),
        )
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&Store, Tz) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        let tz = self.timezone;
        tokio::task::spawn_blocking(move || db.with_store(|store| op(store, tz))).await?
    }

    pub async fn get_event(&self, slug: &str) -> Result<Event> {
        let slug = validate_slug(slug)?;
        debug!(%slug, "fetching event");
        self.blocking(move |store, _| {
            store
                .find_by_slug(&slug)?
                .ok_or_else(|| Error::NotFound(format!("No event exists with slug: {slug}")))
        })
        .await
    }

    pub async fn list_events(&self) -> Result<Vec<Event>> {
        self.blocking(|store, _| store.list_events()).await
    }

    pub async fn create_event(&self, draft: EventDraft) -> Result<Event> {
        let event = self
            .blocking(move |store, tz| {
                let ctx = NormalizeContext::new(tz);
                let normalized = normalize_event(&draft, None, store, &ctx)?;
                write_with_slug_retry(normalized, |event| store.insert_event(event, Utc::now()))
            })
            .await?;
        info!(id = %event.id, slug = %event.slug, "event created");
        Ok(event)
    }

    pub async fn update_event(&self, id: EventId, patch: EventPatch) -> Result<Event> {
        let event = self
            .blocking(move |store, tz| {
                let existing = store
                    .get_event(id)?
                    .ok_or_else(|| Error::NotFound(format!("No event exists with ID: {id}")))?;
                let mut draft = EventDraft::from(&existing);
                patch.apply_to(&mut draft);

                let ctx = NormalizeContext::new(tz);
                let normalized = normalize_event(&draft, Some(&existing), store, &ctx)?;
                write_with_slug_retry(normalized, |event| {
                    store.update_event(id, event, Utc::now())
                })
            })
            .await?;
        info!(id = %event.id, slug = %event.slug, "event updated");
        Ok(event)
    }

    /// Events sharing at least one tag with the event at `slug`, newest first.
    pub async fn similar_events(&self, slug: &str) -> Result<Vec<Event>> {
        let slug = validate_slug(slug)?;
        self.blocking(move |store, _| {
            let event = store
                .find_by_slug(&slug)?
                .ok_or_else(|| Error::NotFound(format!("No event exists with slug: {slug}")))?;
            Ok(store
                .list_events()?
                .into_iter()
                .filter(|other| other.id != event.id && other.shares_tag_with(&event))
                .collect())
        })
        .await
    }

    pub async fn book_event(&self, event_id: EventId, email: &str) -> Result<Booking> {
        let email = normalize_email(email)?;
        let booking = self
            .blocking(move |store, _| {
                let exists = store
                    .event_exists(event_id)
                    .map_err(|err| Error::VerificationFailed {
                        id: event_id,
                        source: Box::new(err),
                    })?;
                if !exists {
                    return Err(Error::EventMissing(event_id));
                }
                store.insert_booking(event_id, &email, Utc::now())
            })
            .await?;
        info!(event_id = %booking.event_id, "booking created");
        Ok(booking)
    }

    pub async fn list_bookings(&self, event_id: EventId) -> Result<Vec<Booking>> {
        self.blocking(move |store, _| {
            if !store.event_exists(event_id)? {
                return Err(Error::NotFound(format!(
                    "No event exists with ID: {event_id}"
                )));
            }
            store.list_bookings(event_id)
        })
        .await
    }

    /// Releases the database connection.
    pub async fn shutdown(&self) -> Result<()> {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || db.close()).await?
    }
}

fn write_with_slug_retry<F>(mut event: NormalizedEvent, mut write: F) -> Result<Event>
where
    F: FnMut(&NormalizedEvent) -> Result<Event>,
{
    let base = slugify(&event.title);
    let mut attempt = 0;
    loop {
        match write(&event) {
            Err(err) if err.is_unique_violation() && attempt < SLUG_RETRIES => {
                attempt += 1;
                let stamp = Utc::now() + Duration::milliseconds(attempt);
                event.slug = with_timestamp_suffix(&base, stamp);
                warn!(slug = %event.slug, attempt, "slug taken at write time, retrying");
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::models::EventMode;
    use crate::normalize::is_valid_slug;

    fn service(dir: &tempfile::TempDir) -> EventService {
        let db = Arc::new(Database::new(dir.path().join("events.sqlite")));
        EventService::new(db, chrono_tz::UTC)
    }

    fn draft(title: &str, tags: &[&str]) -> EventDraft {
        EventDraft {
            title: title.into(),
            description: "An evening of talks".into(),
            overview: "Talks and networking".into(),
            image: "/images/event.png".into(),
            venue: "The Hall".into(),
            location: "Boise, ID".into(),
            date: "Oct 7, 2025".into(),
            time: "7:00 PM".into(),
            mode: "offline".into(),
            audience: "Developers".into(),
            agenda: vec!["Doors".into(), "Talks".into()],
            organizer: "Boise Devs".into(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn create_normalizes_and_fetches_by_slug() {
        let dir = tempfile::tempdir().expect("tempdir");
        let svc = service(&dir);
        let created = svc
            .create_event(draft("Rust & Coffee!", &["rust"]))
            .await
            .expect("create");
        assert_eq!(created.slug, "rust-coffee");
        assert_eq!(created.date, "2025-10-07");
        assert_eq!(created.time, "19:00");
        assert_eq!(created.mode, EventMode::Offline);

        let fetched = svc.get_event(" rust-coffee ").await.expect("get");
        assert_eq!(fetched.id, created.id);
    }

    #[tokio::test]
    async fn same_title_yields_distinct_slugs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let svc = service(&dir);
        let mut slugs = HashSet::new();
        for _ in 0..3 {
            let event = svc
                .create_event(draft("Weekly Meetup", &["meetup"]))
                .await
                .expect("create");
            assert!(is_valid_slug(&event.slug), "{}", event.slug);
            assert!(event.slug.starts_with("weekly-meetup"));
            slugs.insert(event.slug);
        }
        assert_eq!(slugs.len(), 3);
    }

    #[tokio::test]
    async fn resave_without_title_change_keeps_slug() {
        let dir = tempfile::tempdir().expect("tempdir");
        let svc = service(&dir);
        svc.create_event(draft("Launch Party", &["launch"]))
            .await
            .expect("create");
        let second = svc
            .create_event(draft("Launch Party", &["launch"]))
            .await
            .expect("create");
        assert_ne!(second.slug, "launch-party");

        let patch = EventPatch {
            venue: Some("Rooftop".into()),
            time: Some("12:00 AM".into()),
            ..EventPatch::default()
        };
        let updated = svc.update_event(second.id, patch).await.expect("update");
        assert_eq!(updated.slug, second.slug);
        assert_eq!(updated.venue, "Rooftop");
        assert_eq!(updated.time, "00:00");

        let renamed = svc
            .update_event(
                second.id,
                EventPatch {
                    title: Some("Launch Afterparty".into()),
                    ..EventPatch::default()
                },
            )
            .await
            .expect("rename");
        assert_eq!(renamed.slug, "launch-afterparty");
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        let svc = service(&dir);
        let mut bad_date = draft("Bad Date", &["x"]);
        bad_date.date = "not-a-date".into();
        let err = svc.create_event(bad_date).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(err.class().status_code(), 400);

        let mut bad_time = draft("Bad Time", &["x"]);
        bad_time.time = "25:00".into();
        assert!(svc.create_event(bad_time).await.is_err());
        assert!(svc.list_events().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn get_event_distinguishes_bad_format_from_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let svc = service(&dir);
        let err = svc.get_event("Not A Slug").await.unwrap_err();
        assert!(matches!(err, Error::InvalidSlug(_)));
        assert_eq!(err.class().status_code(), 400);
        // Rejected before the database is touched.
        assert!(!svc.database().is_connected());

        let err = svc.get_event("nothing-here").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(err.class().status_code(), 404);
    }

    #[tokio::test]
    async fn booking_requires_existing_event() {
        let dir = tempfile::tempdir().expect("tempdir");
        let svc = service(&dir);
        let err = svc
            .book_event(EventId(404), "guest@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EventMissing(EventId(404))));

        let event = svc
            .create_event(draft("Book Me", &["x"]))
            .await
            .expect("create");
        let booking = svc
            .book_event(event.id, "  Guest@Example.com ")
            .await
            .expect("book");
        assert_eq!(booking.email, "guest@example.com");
        assert_eq!(booking.event_id, event.id);

        let err = svc.book_event(event.id, "not-an-email").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let bookings = svc.list_bookings(event.id).await.expect("bookings");
        assert_eq!(bookings.len(), 1);
        assert!(matches!(
            svc.list_bookings(EventId(404)).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn broken_store_during_booking_check_is_a_server_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let svc = service(&dir);
        let event = svc
            .create_event(draft("Fragile", &["x"]))
            .await
            .expect("create");

        let other =
            rusqlite::Connection::open(svc.database().path()).expect("second connection");
        other
            .execute_batch("DROP TABLE bookings; DROP TABLE events;")
            .expect("drop tables");
        drop(other);

        let err = svc
            .book_event(event.id, "guest@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VerificationFailed { .. }), "{err}");
        assert_eq!(err.class(), crate::error::ErrorClass::Internal);
        assert_eq!(err.class().status_code(), 500);
    }

    #[test]
    fn unique_index_rejection_retries_with_suffix() {
        let store = Store::open_in_memory().expect("open");
        let taken = NormalizedEvent {
            title: "Same".into(),
            slug: "same".into(),
            description: "desc".into(),
            overview: "overview".into(),
            image: "/img.png".into(),
            venue: "Venue".into(),
            location: "Boise, ID".into(),
            date: "2025-10-07".into(),
            time: "19:00".into(),
            mode: EventMode::Offline,
            audience: "Everyone".into(),
            agenda: vec!["Doors".into()],
            organizer: "Org".into(),
            tags: vec!["x".into()],
        };
        store.insert_event(&taken, Utc::now()).expect("insert");

        let before = Utc::now().timestamp_millis();
        let event = write_with_slug_retry(taken.clone(), |event| {
            store.insert_event(event, Utc::now())
        })
        .expect("retried write");

        let suffix = event
            .slug
            .strip_prefix("same-")
            .expect("suffixed slug")
            .parse::<i64>()
            .expect("millis suffix");
        assert!(suffix > before, "{} vs {before}", event.slug);
        assert!(is_valid_slug(&event.slug));
        assert_eq!(store.list_events().expect("list").len(), 2);
    }

    #[tokio::test]
    async fn similar_events_share_tags() {
        let dir = tempfile::tempdir().expect("tempdir");
        let svc = service(&dir);
        let rust = svc
            .create_event(draft("Rust Night", &["rust", "systems"]))
            .await
            .expect("create");
        svc.create_event(draft("Systems Day", &["systems"]))
            .await
            .expect("create");
        svc.create_event(draft("Design Jam", &["design"]))
            .await
            .expect("create");

        let similar = svc.similar_events(&rust.slug).await.expect("similar");
        let titles: Vec<&str> = similar.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(titles, vec!["Systems Day"]);
    }

    #[tokio::test]
    async fn shutdown_closes_and_next_call_reconnects() {
        let dir = tempfile::tempdir().expect("tempdir");
        let svc = service(&dir);
        svc.create_event(draft("Persisted", &["x"]))
            .await
            .expect("create");
        assert!(svc.database().is_connected());

        svc.shutdown().await.expect("shutdown");
        assert!(!svc.database().is_connected());

        let events = svc.list_events().await.expect("list");
        assert_eq!(events.len(), 1);
    }
}
