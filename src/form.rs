use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::models::EventDraft;

/// Builds a draft from flat create-event form fields.
///
/// `agenda` and `tags` arrive as JSON-encoded string arrays. Plain text is
/// accepted as well: agenda items one per line, tags comma separated.
pub fn draft_from_form(fields: &HashMap<String, String>) -> Result<EventDraft> {
    let text = |key: &str| fields.get(key).cloned().unwrap_or_default();

    Ok(EventDraft {
        title: text("title"),
        description: text("description"),
        overview: text("overview"),
        image: text("image"),
        venue: text("venue"),
        location: text("location"),
        date: text("date"),
        time: text("time"),
        mode: text("mode"),
        audience: text("audience"),
        agenda: decode_list(fields.get("agenda"), "agenda", '\n')?,
        organizer: text("organizer"),
        tags: decode_list(fields.get("tags"), "tags", ',')?,
    })
}

fn decode_list(raw: Option<&String>, field: &str, separator: char) -> Result<Vec<String>> {
    let raw = match raw.map(|value| value.trim()) {
        Some(value) if !value.is_empty() => value,
        _ => return Ok(Vec::new()),
    };

    if raw.starts_with('[') {
        return serde_json::from_str::<Vec<String>>(raw).map_err(|err| {
            Error::validation(format!("{field} must be a JSON array of strings: {err}"))
        });
    }

    Ok(raw
        .split(separator)
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect())
}
