use crate::domain::models::Options;
use crate::infrastructure::error::InfraError;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

const APP_JSON: &str = "app.json";
const OPTIONS_JSON: &str = "options.json";
const SCHEMA_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppSettings {
    pub timezone: Tz,
    pub interval: Duration,
    pub flex: Duration,
    pub run_timeout: Duration,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            timezone: Tz::UTC,
            interval: Duration::from_secs(15 * 60),
            flex: Duration::from_secs(5 * 60),
            run_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppFile {
    schema: u64,
    timezone: Option<String>,
    interval_minutes: Option<u64>,
    flex_minutes: Option<u64>,
    run_timeout_seconds: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OptionsFile {
    schema: u64,
    #[serde(flatten)]
    options: Options,
}

fn default_files() -> HashMap<&'static str, serde_json::Value> {
    let options = Options::default();
    HashMap::from([
        (
            APP_JSON,
            serde_json::json!({
                "schema": SCHEMA_VERSION,
                "timezone": "UTC",
                "intervalMinutes": 15,
                "flexMinutes": 5,
                "runTimeoutSeconds": 60
            }),
        ),
        (
            OPTIONS_JSON,
            serde_json::json!({
                "schema": SCHEMA_VERSION,
                "target": options.target,
                "activeFrom": options.active_from.to_string(),
                "activeTo": options.active_to.to_string()
            }),
        ),
    ])
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    for (name, value) in default_files() {
        let path = config_dir.join(name);
        if !path.exists() {
            write_json(&path, &value)?;
        }
    }
    Ok(())
}

fn write_json(path: &Path, value: &serde_json::Value) -> Result<(), InfraError> {
    let formatted = serde_json::to_string_pretty(value)?;
    fs::write(path, format!("{formatted}\n"))?;
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != SCHEMA_VERSION {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

pub fn load_options(config_dir: &Path) -> Result<Options, InfraError> {
    let path = config_dir.join(OPTIONS_JSON);
    if !path.exists() {
        return Ok(Options::default());
    }
    let file: OptionsFile = serde_json::from_value(read_config(&path)?).map_err(|error| {
        InfraError::InvalidConfig(format!("invalid options in {}: {error}", path.display()))
    })?;
    file.options.validate().map_err(InfraError::InvalidConfig)?;
    Ok(file.options)
}

pub fn save_options(config_dir: &Path, options: &Options) -> Result<(), InfraError> {
    options.validate().map_err(InfraError::InvalidConfig)?;
    let value = serde_json::to_value(OptionsFile {
        schema: SCHEMA_VERSION,
        options: *options,
    })?;
    write_json(&config_dir.join(OPTIONS_JSON), &value)
}

fn minutes_to_duration(minutes: u64, field: &str) -> Result<Duration, InfraError> {
    minutes
        .checked_mul(60)
        .map(Duration::from_secs)
        .ok_or_else(|| InfraError::InvalidConfig(format!("{field} is out of range: {minutes}")))
}

pub fn load_app_settings(config_dir: &Path) -> Result<AppSettings, InfraError> {
    let path = config_dir.join(APP_JSON);
    if !path.exists() {
        return Ok(AppSettings::default());
    }
    let file: AppFile = serde_json::from_value(read_config(&path)?).map_err(|error| {
        InfraError::InvalidConfig(format!("invalid app settings in {}: {error}", path.display()))
    })?;
    let defaults = AppSettings::default();

    let timezone = match file
        .timezone
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        Some(name) => name
            .parse::<Tz>()
            .map_err(|error| InfraError::InvalidConfig(format!("unknown timezone '{name}': {error}")))?,
        None => defaults.timezone,
    };

    let interval_minutes = file.interval_minutes.unwrap_or(15);
    if interval_minutes == 0 {
        return Err(InfraError::InvalidConfig(
            "intervalMinutes must be > 0".to_string(),
        ));
    }
    let run_timeout_seconds = file.run_timeout_seconds.unwrap_or(60);
    if run_timeout_seconds == 0 {
        return Err(InfraError::InvalidConfig(
            "runTimeoutSeconds must be > 0".to_string(),
        ));
    }

    Ok(AppSettings {
        timezone,
        interval: minutes_to_duration(interval_minutes, "intervalMinutes")?,
        flex: match file.flex_minutes {
            Some(minutes) => minutes_to_duration(minutes, "flexMinutes")?,
            None => defaults.flex,
        },
        run_timeout: Duration::from_secs(run_timeout_seconds),
    })
}
