//! Normalization applied to every event record before it is written.
//!
//! Each step only runs when its input field is new or differs from the
//! stored record: an unchanged title keeps its slug, an unchanged date or time
//! is left alone.

use chrono::{DateTime, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::{Event, EventDraft, EventId, EventMode};

static SLUG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+(?:-[a-z0-9]+)*$").expect("valid slug regex"));
static TIME_24H_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([01]?[0-9]|2[0-3]):([0-5][0-9])$").expect("valid 24h regex"));
static TIME_12H_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(0?[1-9]|1[0-2]):([0-5][0-9]) ?(AM|PM)$").expect("valid 12h regex")
});
static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid email regex"));
static WEEKDAY_PREFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(mon|tue|tues|wed|thu|thur|thurs|fri|sat|sun)[a-z]*,?\s+")
        .expect("valid weekday regex")
});

/// Answers whether a slug is already held by an event other than `exclude`.
pub trait SlugLookup {
    fn slug_in_use(&self, slug: &str, exclude: Option<EventId>) -> Result<bool>;
}

/// Settings the normalizer needs from its environment.
#[derive(Debug, Clone)]
pub struct NormalizeContext {
    /// Zone used for date-times that carry no offset.
    pub timezone: Tz,
    pub now: DateTime<Utc>,
}

impl NormalizeContext {
    pub fn new(timezone: Tz) -> Self {
        Self {
            timezone,
            now: Utc::now(),
        }
    }
}

/// A draft that passed validation, ready to be stored.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub title: String,
    pub slug: String,
    pub description: String,
    pub overview: String,
    pub image: String,
    pub venue: String,
    pub location: String,
    pub date: String,
    pub time: String,
    pub mode: EventMode,
    pub audience: String,
    pub agenda: Vec<String>,
    pub organizer: String,
    pub tags: Vec<String>,
}

pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_hyphen = false;
    for ch in title.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(ch.to_ascii_lowercase());
        } else if ch.is_whitespace() || ch == '-' || ch == '_' {
            pending_hyphen = true;
        }
    }
    slug
}

pub fn is_valid_slug(slug: &str) -> bool {
    SLUG_RE.is_match(slug)
}

/// Checks a slug taken from a request path and returns its lookup form.
pub fn validate_slug(raw: &str) -> Result<String> {
    let slug = raw.trim();
    if slug.is_empty() {
        return Err(Error::InvalidSlug("slug must be a non-empty string".to_string()));
    }
    if !is_valid_slug(slug) {
        return Err(Error::InvalidSlug(
            "slug must contain only lowercase letters, numbers, and hyphens".to_string(),
        ));
    }
    Ok(slug.to_lowercase())
}

/// Derives a slug for `title`, appending a millisecond timestamp when another
/// event already holds the plain slug.
pub fn unique_slug(
    title: &str,
    exclude: Option<EventId>,
    lookup: &dyn SlugLookup,
    now: DateTime<Utc>,
) -> Result<String> {
    let base = slugify(title);
    if base.is_empty() {
        return Err(Error::validation(
            "Event title must contain at least one letter or digit",
        ));
    }
    if lookup.slug_in_use(&base, exclude)? {
        let suffixed = with_timestamp_suffix(&base, now);
        debug!(slug = %base, disambiguated = %suffixed, "slug collision");
        return Ok(suffixed);
    }
    Ok(base)
}

pub fn with_timestamp_suffix(slug: &str, now: DateTime<Utc>) -> String {
    format!("{slug}-{}", now.timestamp_millis())
}

pub fn normalize_date(input: &str, tz: Tz) -> Result<String> {
    parse_calendar_date(input, tz)
        .map(|date| date.format("%Y-%m-%d").to_string())
        .ok_or_else(|| Error::validation("Date must be a valid date string"))
}

fn parse_calendar_date(input: &str, tz: Tz) -> Option<NaiveDate> {
    let text = input.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(&text) {
        return Some(dt.with_timezone(&Utc).date_naive());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(&text) {
        return Some(dt.with_timezone(&Utc).date_naive());
    }
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&text, fmt) {
            return local_to_utc_date(naive, tz);
        }
    }

    let stripped = WEEKDAY_PREFIX_RE.replace(&text, "");
    let formats = [
        "%Y-%m-%d",
        "%Y/%m/%d",
        "%m/%d/%Y",
        "%B %d, %Y",
        "%b %d, %Y",
        "%B %d %Y",
        "%b %d %Y",
        "%d %B %Y",
        "%d %b %Y",
    ];
    formats
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&stripped, fmt).ok())
}

fn local_to_utc_date(naive: NaiveDateTime, tz: Tz) -> Option<NaiveDate> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc).date_naive()),
        LocalResult::Ambiguous(dt, _) => Some(dt.with_timezone(&Utc).date_naive()),
        LocalResult::None => None,
    }
}

pub fn normalize_time(input: &str) -> Result<String> {
    let text = input.trim();
    if let Some(caps) = TIME_24H_RE.captures(text) {
        let hours: u32 = caps[1].parse().expect("regex guarantees digits");
        return Ok(format!("{:02}:{}", hours, &caps[2]));
    }
    if let Some(caps) = TIME_12H_RE.captures(text) {
        let mut hours: u32 = caps[1].parse().expect("regex guarantees digits");
        let pm = caps[3].eq_ignore_ascii_case("pm");
        if pm && hours != 12 {
            hours += 12;
        }
        if !pm && hours == 12 {
            hours = 0;
        }
        return Ok(format!("{:02}:{}", hours, &caps[2]));
    }
    Err(Error::validation("Time must be in HH:MM or HH:MM AM/PM format"))
}

pub fn normalize_email(input: &str) -> Result<String> {
    let email = input.trim().to_lowercase();
    if email.is_empty() {
        return Err(Error::validation("Email is required"));
    }
    if !EMAIL_RE.is_match(&email) {
        return Err(Error::validation("Please provide a valid email address"));
    }
    Ok(email)
}

fn required(value: &str, label: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(Error::validation(format!("{label} is required")))
    } else {
        Ok(trimmed.to_string())
    }
}

fn clean_list(items: &[String]) -> Vec<String> {
    items
        .iter()
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn dedupe(items: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

/// Validates `draft` and brings its derived fields into canonical form.
///
/// `previous` is the stored record when the draft updates an existing event.
/// Slug, date and time are only recomputed when the corresponding input
/// differs from `previous`.
pub fn normalize_event(
    draft: &EventDraft,
    previous: Option<&Event>,
    lookup: &dyn SlugLookup,
    ctx: &NormalizeContext,
) -> Result<NormalizedEvent> {
    let title = required(&draft.title, "Event title")?;
    let description = required(&draft.description, "Event description")?;
    let overview = required(&draft.overview, "Event overview")?;
    let image = required(&draft.image, "Event image")?;
    let venue = required(&draft.venue, "Event venue")?;
    let location = required(&draft.location, "Event location")?;
    let audience = required(&draft.audience, "Target audience")?;
    let organizer = required(&draft.organizer, "Event organizer")?;
    let mode = required(&draft.mode, "Event mode")?
        .parse::<EventMode>()
        .map_err(Error::Validation)?;

    let agenda = clean_list(&draft.agenda);
    if agenda.is_empty() {
        return Err(Error::validation("Agenda must contain at least one item"));
    }
    let tags = dedupe(clean_list(&draft.tags));
    if tags.is_empty() {
        return Err(Error::validation("At least one tag is required"));
    }

    let slug = match previous {
        Some(prev) if prev.title == title => prev.slug.clone(),
        _ => unique_slug(&title, previous.map(|p| p.id), lookup, ctx.now)?,
    };

    let date = match previous {
        Some(prev) if prev.date == draft.date => prev.date.clone(),
        _ => {
            let raw = required(&draft.date, "Event date")?;
            normalize_date(&raw, ctx.timezone)?
        }
    };

    let time = match previous {
        Some(prev) if prev.time == draft.time => prev.time.clone(),
        _ => {
            let raw = required(&draft.time, "Event time")?;
            normalize_time(&raw)?
        }
    };

    Ok(NormalizedEvent {
        title,
        slug,
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
        tags,
    })
}
