pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod form;
pub mod models;
pub mod normalize;
pub mod service;
mod utils;

pub use config::{AppConfig, ConfigStore};
pub use db::{Database, Store};
pub use error::{Error, ErrorClass, Result};
pub use models::{Booking, BookingId, Event, EventDraft, EventId, EventMode, EventPatch};
pub use normalize::{normalize_date, normalize_event, normalize_time, slugify, NormalizedEvent};
pub use service::EventService;
