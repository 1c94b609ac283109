use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::utils;

pub const DATABASE_ENV: &str = "EVENTDESK_DATABASE";
pub const TIMEZONE_ENV: &str = "EVENTDESK_TIMEZONE";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// SQLite file; defaults to the data directory.
    pub database_path: Option<PathBuf>,
    /// IANA zone used for date-times submitted without an offset.
    pub timezone: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            timezone: "UTC".to_string(),
        }
    }
}

impl AppConfig {
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(utils::database_path)
    }

    pub fn timezone(&self) -> Tz {
        self.timezone.parse::<Tz>().unwrap_or_else(|err| {
            warn!("invalid timezone {:?} ({err}), using UTC", self.timezone);
            chrono_tz::UTC
        })
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup(DATABASE_ENV).filter(|v| !v.trim().is_empty()) {
            info!("{DATABASE_ENV} set, using database at {path}");
            self.database_path = Some(PathBuf::from(path.trim()));
        }
        if let Some(tz) = lookup(TIMEZONE_ENV).filter(|v| !v.trim().is_empty()) {
            self.timezone = tz.trim().to_string();
        }
    }
}

pub struct ConfigStore {
    path: PathBuf,
    data: Mutex<AppConfig>,
}

impl ConfigStore {
    /// Reads `config.json` from the data directory, then applies environment
    /// overrides. A `.env` file in the working directory is loaded first.
    pub fn load() -> Self {
        dotenvy::dotenv().ok();
        Self::load_from(utils::config_path(), |key| env::var(key).ok())
    }

    pub fn load_from(path: PathBuf, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut data = read_config(&path).unwrap_or_else(|err| {
            warn!("failed to read config {:?}: {err}", path);
            AppConfig::default()
        });
        data.apply_env(lookup);
        Self {
            path,
            data: Mutex::new(data),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> AppConfig {
        match self.data.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

fn read_config(path: &Path) -> Result<AppConfig, String> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let contents = fs::read_to_string(path).map_err(|err| err.to_string())?;
    serde_json::from_str(&contents).map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ConfigStore::load_from(dir.path().join("config.json"), |_| None);
        assert_eq!(store.path(), dir.path().join("config.json"));
        let config = store.read();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.timezone(), chrono_tz::UTC);
    }

    #[test]
    fn file_values_are_overridden_by_env() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"database_path": "/tmp/from-file.sqlite", "timezone": "America/Boise"}"#,
        )
        .expect("write config");

        let store = ConfigStore::load_from(path.clone(), |_| None);
        assert_eq!(store.read().timezone(), chrono_tz::America::Boise);
        assert_eq!(
            store.read().database_path(),
            PathBuf::from("/tmp/from-file.sqlite")
        );

        let store = ConfigStore::load_from(path, |key| match key {
            DATABASE_ENV => Some("/tmp/from-env.sqlite".to_string()),
            _ => None,
        });
        assert_eq!(
            store.read().database_path(),
            PathBuf::from("/tmp/from-env.sqlite")
        );
        assert_eq!(store.read().timezone, "America/Boise");
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        let config = AppConfig {
            timezone: "Mars/Olympus".to_string(),
            ..AppConfig::default()
        };
        assert_eq!(config.timezone(), chrono_tz::UTC);
    }
}
