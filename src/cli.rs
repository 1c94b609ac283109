use std::{collections::HashMap, fs, path::Path, path::PathBuf, process::ExitCode};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use crate::config::ConfigStore;
use crate::error::{Error, ErrorClass};
use crate::form::draft_from_form;
use crate::models::{EventDraft, EventId, EventPatch};
use crate::service::EventService;

#[derive(Debug, Parser)]
#[command(name = "eventdesk", version, about = "List, create and book events")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create an event from a JSON draft file
    Create { path: PathBuf },
    /// Create an event from a JSON object of form fields
    CreateForm { path: PathBuf },
    /// Apply a JSON patch file to an event
    Update { id: EventId, path: PathBuf },
    /// Fetch one event by slug
    Get { slug: String },
    /// List all events, newest first
    List,
    /// Events sharing a tag with the given one
    Similar { slug: String },
    /// Book a spot on an event
    Book { event_id: EventId, email: String },
    /// List bookings for an event
    Bookings { event_id: EventId },
}

pub async fn run() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    let config = ConfigStore::load();
    let service = EventService::from_config(&config.read());
    tracing::debug!(
        config = ?config.path(),
        database = ?service.database().path(),
        "configuration loaded"
    );

    let outcome = execute(&service, cli.command).await;
    if let Err(err) = service.shutdown().await {
        tracing::warn!("failed to close database: {err}");
    }

    match outcome {
        Ok(body) => {
            println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
            ExitCode::SUCCESS
        }
        Err(err) => {
            let class = classify(&err);
            let body = json!({
                "status": class.status_code(),
                "error": format!("{err:#}"),
            });
            eprintln!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
            ExitCode::from(exit_code(class))
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn execute(service: &EventService, command: Command) -> Result<Value> {
    let body = match command {
        Command::Create { path } => {
            let draft: EventDraft = read_json(&path)?;
            let event = service.create_event(draft).await?;
            json!({ "message": "Event created successfully", "event": event })
        }
        Command::CreateForm { path } => {
            let fields: HashMap<String, String> = read_json(&path)?;
            let draft = draft_from_form(&fields)?;
            let event = service.create_event(draft).await?;
            json!({ "message": "Event created successfully", "event": event })
        }
        Command::Update { id, path } => {
            let patch: EventPatch = read_json(&path)?;
            let event = service.update_event(id, patch).await?;
            json!({ "message": "Event updated successfully", "event": event })
        }
        Command::Get { slug } => {
            let event = service.get_event(&slug).await?;
            json!({ "message": "Event fetched successfully", "event": event })
        }
        Command::List => {
            let events = service.list_events().await?;
            json!({ "message": "Events fetched successfully", "events": events })
        }
        Command::Similar { slug } => {
            let events = service.similar_events(&slug).await?;
            json!({ "events": events })
        }
        Command::Book { event_id, email } => {
            let booking = service.book_event(event_id, &email).await?;
            json!({ "message": "Booking created successfully", "booking": booking })
        }
        Command::Bookings { event_id } => {
            let bookings = service.list_bookings(event_id).await?;
            json!({ "bookings": bookings })
        }
    };
    Ok(body)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("unable to read {}", path.display()))?;
    serde_json::from_str(&contents)
        .map_err(|err| Error::validation(format!("{}: {err}", path.display())).into())
}

fn classify(err: &anyhow::Error) -> ErrorClass {
    err.downcast_ref::<Error>()
        .map(Error::class)
        .unwrap_or(ErrorClass::Internal)
}

fn exit_code(class: ErrorClass) -> u8 {
    match class {
        ErrorClass::Internal => 1,
        ErrorClass::BadRequest => 2,
        ErrorClass::NotFound => 3,
        ErrorClass::Unavailable => 4,
    }
}
