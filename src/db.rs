use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::{Booking, BookingId, Event, EventId};
use crate::normalize::{NormalizedEvent, SlugLookup};
use crate::utils;

const EVENT_COLUMNS: &str = "id, payload, created_at_utc, updated_at_utc";
const BOOKING_COLUMNS: &str = "id, event_id, email, created_at_utc, updated_at_utc";

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        utils::ensure_parent(path);
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn close(self) -> rusqlite::Result<()> {
        self.conn.close().map_err(|(_, err)| err)
    }

    fn init_schema(&self) -> rusqlite::Result<()> {
        self.conn.execute_batch(
            "PRAGMA foreign_keys = ON;
            CREATE TABLE IF NOT EXISTS events(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                slug TEXT NOT NULL UNIQUE,
                payload TEXT NOT NULL,
                created_at_utc TEXT NOT NULL,
                updated_at_utc TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS bookings(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id INTEGER NOT NULL REFERENCES events(id),
                email TEXT NOT NULL,
                created_at_utc TEXT NOT NULL,
                updated_at_utc TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS bookings_event_idx ON bookings(event_id);
            CREATE INDEX IF NOT EXISTS bookings_event_email_idx ON bookings(event_id, email);",
        )?;
        Ok(())
    }

    pub fn insert_event(&self, event: &NormalizedEvent, now: DateTime<Utc>) -> Result<Event> {
        let payload = serde_json::to_string(event)?;
        self.conn.execute(
            "INSERT INTO events (slug, payload, created_at_utc, updated_at_utc)
             VALUES (?1, ?2, ?3, ?3)",
            params![event.slug, payload, now],
        )?;
        let id = EventId(self.conn.last_insert_rowid());
        debug!(%id, slug = %event.slug, "event inserted");
        self.get_event(id)?
            .ok_or_else(|| Error::Internal(format!("event {id} vanished after insert")))
    }

    pub fn update_event(
        &self,
        id: EventId,
        event: &NormalizedEvent,
        now: DateTime<Utc>,
    ) -> Result<Event> {
        let payload = serde_json::to_string(event)?;
        let changed = self.conn.execute(
            "UPDATE events SET slug = ?2, payload = ?3, updated_at_utc = ?4 WHERE id = ?1",
            params![id.0, event.slug, payload, now],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("No event exists with ID: {id}")));
        }
        self.get_event(id)?
            .ok_or_else(|| Error::NotFound(format!("No event exists with ID: {id}")))
    }

    pub fn get_event(&self, id: EventId) -> Result<Option<Event>> {
        self.conn
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"),
                params![id.0],
                event_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    pub fn find_by_slug(&self, slug: &str) -> Result<Option<Event>> {
        self.conn
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM events WHERE slug = ?1"),
                params![slug],
                event_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    /// All events, newest first.
    pub fn list_events(&self) -> Result<Vec<Event>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events ORDER BY created_at_utc DESC, id DESC"
        ))?;
        let rows = stmt.query_map([], event_from_row)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn event_exists(&self, id: EventId) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM events WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn insert_booking(
        &self,
        event_id: EventId,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<Booking> {
        self.conn.execute(
            "INSERT INTO bookings (event_id, email, created_at_utc, updated_at_utc)
             VALUES (?1, ?2, ?3, ?3)",
            params![event_id.0, email, now],
        )?;
        let id = self.conn.last_insert_rowid();
        let booking = self.conn.query_row(
            &format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = ?1"),
            params![id],
            booking_from_row,
        )?;
        Ok(booking)
    }

    pub fn list_bookings(&self, event_id: EventId) -> Result<Vec<Booking>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE event_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![event_id.0], booking_from_row)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

impl SlugLookup for Store {
    fn slug_in_use(&self, slug: &str, exclude: Option<EventId>) -> Result<bool> {
        let owner: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM events WHERE slug = ?1",
                params![slug],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match owner {
            Some(id) => Some(EventId(id)) != exclude,
            None => false,
        })
    }
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    let id: i64 = row.get(0)?;
    let payload: String = row.get(1)?;
    let fields: NormalizedEvent = serde_json::from_str(&payload).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            payload.len(),
            rusqlite::types::Type::Text,
            Box::new(err),
        )
    })?;
    Ok(Event {
        id: EventId(id),
        title: fields.title,
        slug: fields.slug,
        description: fields.description,
        overview: fields.overview,
        image: fields.image,
        venue: fields.venue,
        location: fields.location,
        date: fields.date,
        time: fields.time,
        mode: fields.mode,
        audience: fields.audience,
        agenda: fields.agenda,
        organizer: fields.organizer,
        tags: fields.tags,
        created_at: row.get(2)?,
        updated_at: row.get(3)?,
    })
}

fn booking_from_row(row: &Row<'_>) -> rusqlite::Result<Booking> {
    Ok(Booking {
        id: BookingId(row.get(0)?),
        event_id: EventId(row.get(1)?),
        email: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

/// Handle to the event database. The connection is opened on first use,
/// reused by later calls and released by [`Database::close`]. A failed open
/// leaves the handle disconnected so the next call tries again.
pub struct Database {
    path: PathBuf,
    store: Mutex<Option<Store>>,
}

impl Database {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            store: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_connected(&self) -> bool {
        self.store
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    pub fn with_store<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&Store) -> Result<T>,
    {
        let mut guard = self
            .store
            .lock()
            .map_err(|_| Error::Internal("database mutex poisoned".to_string()))?;
        if guard.is_none() {
            info!(path = ?self.path, "opening database connection");
            let store = Store::open(&self.path).map_err(|err| {
                warn!(path = ?self.path, "database connection failed: {err}");
                Error::Unavailable(format!("unable to open {}: {err}", self.path.display()))
            })?;
            *guard = Some(store);
        }
        let store = guard
            .as_ref()
            .ok_or_else(|| Error::Internal("database handle not initialized".to_string()))?;
        op(store)
    }

    pub fn close(&self) -> Result<()> {
        let mut guard = self
            .store
            .lock()
            .map_err(|_| Error::Internal("database mutex poisoned".to_string()))?;
        if let Some(store) = guard.take() {
            info!(path = ?self.path, "closing database connection");
            store.close()?;
        }
        Ok(())
    }
}
