//! # spoolconfig - configuration management for SpoolSonic
//!
//! YAML configuration with:
//! - an embedded default configuration merged with an external `config.yaml`
//! - `SPOOLSONIC__*` environment variable overrides (`__` separates path
//!   segments, e.g. `SPOOLSONIC__STREAM_CACHE__SIZE=1GiB`)
//! - typed getters for strings, integers, byte sizes and durations
//! - managed directories resolved relative to the config directory
//!
//! A [`Config`] is an explicit instance constructed once at startup and
//! passed by reference to the components that need it.

use anyhow::{anyhow, Result};
use serde_yaml::Value;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// Embedded default configuration.
const DEFAULT_CONFIG: &str = include_str!("spoolsonic.yaml");

/// Environment variable naming the config directory.
const ENV_CONFIG_DIR: &str = "SPOOLSONIC_CONFIG";

/// Prefix for environment variable overrides.
const ENV_PREFIX: &str = "SPOOLSONIC__";

/// YAML-backed configuration tree.
#[derive(Debug)]
pub struct Config {
    config_dir: String,
    path: String,
    data: Mutex<Value>,
}

impl Config {
    /// Loads the configuration from `directory` (or, when empty, from
    /// `$SPOOLSONIC_CONFIG`, falling back to `.spoolsonic` in the current
    /// directory).
    ///
    /// The embedded defaults are merged with the external `config.yaml` if
    /// present, then environment overrides are applied, and the merged
    /// result is written back.
    pub fn load_config(directory: &str) -> Result<Self> {
        let config_dir = Self::find_config_dir(directory);
        fs::create_dir_all(&config_dir)?;
        tracing::info!(config_dir = %config_dir, "Using config directory");

        let config_file_path = Path::new(&config_dir).join("config.yaml");
        let path = config_file_path.to_string_lossy().to_string();

        let mut merged: Value = serde_yaml::from_str(DEFAULT_CONFIG)?;
        match fs::read(&path) {
            Ok(data) => {
                tracing::info!(config_file = %path, "Loaded config file");
                let external: Value = serde_yaml::from_slice(&data)?;
                merge_yaml(&mut merged, &external);
            }
            Err(_) => {
                tracing::info!(config_file = %path, "Config file not found, using embedded defaults");
            }
        }

        Self::apply_env_overrides(&mut merged);

        let config = Config {
            config_dir,
            path,
            data: Mutex::new(merged),
        };

        config.save()?;
        Ok(config)
    }

    fn find_config_dir(directory: &str) -> String {
        if !directory.is_empty() {
            return directory.to_string();
        }

        if let Ok(env_path) = env::var(ENV_CONFIG_DIR) {
            tracing::info!(env_var = ENV_CONFIG_DIR, path = %env_path, "Trying to load config from env");
            return env_path;
        }

        ".spoolsonic".to_string()
    }

    fn apply_env_overrides(config: &mut Value) {
        for (key, value) in env::vars() {
            if let Some(suffix) = key.strip_prefix(ENV_PREFIX) {
                let key_path = suffix
                    .split("__")
                    .map(|segment| segment.to_lowercase())
                    .collect::<Vec<_>>();
                let key_path: Vec<&str> = key_path.iter().map(String::as_str).collect();
                let _ = Self::set_value_internal(config, &key_path, convert_env_value(&value));
            }
        }
    }

    /// Writes the current configuration back to `config.yaml`.
    pub fn save(&self) -> Result<()> {
        let data = self.data.lock().unwrap();
        let yaml = serde_yaml::to_string(&*data)?;
        fs::write(&self.path, yaml)?;
        Ok(())
    }

    /// Directory the configuration lives in; managed directories resolve
    /// against it.
    pub fn config_dir(&self) -> &str {
        &self.config_dir
    }

    /// Reads the value at `path` (e.g. `&["stream_cache", "size"]`).
    pub fn get_value(&self, path: &[&str]) -> Result<Value> {
        let data = self.data.lock().unwrap();
        Self::get_value_internal(&data, path)
    }

    fn get_value_internal(data: &Value, path: &[&str]) -> Result<Value> {
        let mut current = data;
        for (i, key) in path.iter().enumerate() {
            if let Value::Mapping(map) = current {
                match map.get(&Value::String(key.to_string())) {
                    Some(next) => current = next,
                    None => return Err(anyhow!("Path {} does not exist", path[..=i].join("."))),
                }
            } else {
                return Err(anyhow!("Path {} is not a mapping", path[..i].join(".")));
            }
        }
        Ok(current.clone())
    }

    /// Sets the value at `path` and saves the file.
    pub fn set_value(&self, path: &[&str], value: Value) -> Result<()> {
        {
            let mut data = self.data.lock().unwrap();
            Self::set_value_internal(&mut data, path, value)?;
        }
        self.save()
    }

    fn set_value_internal(data: &mut Value, path: &[&str], value: Value) -> Result<()> {
        let Some((head, rest)) = path.split_first() else {
            *data = value;
            return Ok(());
        };

        if !matches!(data, Value::Mapping(_)) {
            *data = Value::Mapping(serde_yaml::Mapping::new());
        }
        let Value::Mapping(map) = data else {
            unreachable!()
        };

        let key = Value::String(head.to_string());
        let entry = map
            .entry(key)
            .or_insert_with(|| Value::Mapping(serde_yaml::Mapping::new()));
        Self::set_value_internal(entry, rest, value)
    }

    /// String at `path`, or `default` when the path is absent.
    pub fn get_string_or(&self, path: &[&str], default: &str) -> String {
        match self.get_value(path) {
            Ok(Value::String(s)) => s,
            Ok(Value::Number(n)) => n.to_string(),
            _ => default.to_string(),
        }
    }

    /// Byte size at `path`: either a plain number of bytes or a string with
    /// a binary/decimal unit suffix (`512MiB`, `1GB`, ...).
    pub fn get_size_or(&self, path: &[&str], default: i64) -> Result<i64> {
        match self.get_value(path) {
            Ok(Value::Number(n)) => n
                .as_i64()
                .ok_or_else(|| anyhow!("size at {} is not an integer", path.join("."))),
            Ok(Value::String(s)) => parse_size(&s),
            _ => Ok(default),
        }
    }

    /// Duration at `path`: either a plain number of seconds or a string
    /// with a unit suffix (`90s`, `15m`, `1h`, `7d`).
    pub fn get_duration_or(&self, path: &[&str], default: Duration) -> Result<Duration> {
        match self.get_value(path) {
            Ok(Value::Number(n)) => {
                let secs = n
                    .as_u64()
                    .ok_or_else(|| anyhow!("duration at {} is not a positive integer", path.join(".")))?;
                Ok(Duration::from_secs(secs))
            }
            Ok(Value::String(s)) => parse_duration(&s),
            _ => Ok(default),
        }
    }

    /// Directory at `path`, created on first use. A relative value resolves
    /// against the config directory; the resolved path is persisted.
    pub fn get_managed_dir(&self, path: &[&str], default: &str) -> Result<String> {
        let configured = match self.get_value(path) {
            Ok(Value::String(s)) => s,
            _ => {
                self.set_value(path, Value::String(default.to_string()))?;
                default.to_string()
            }
        };

        let dir = if Path::new(&configured).is_absolute() {
            PathBuf::from(&configured)
        } else {
            Path::new(&self.config_dir).join(&configured)
        };

        fs::create_dir_all(&dir)?;
        Ok(dir.to_string_lossy().to_string())
    }
}

fn convert_env_value(value: &str) -> Value {
    if let Ok(parsed) = serde_yaml::from_str::<Value>(value) {
        return parsed;
    }
    Value::String(value.to_string())
}

/// Merges `external` over `default`; mappings merge recursively, scalars and
/// sequences are replaced.
fn merge_yaml(default: &mut Value, external: &Value) {
    match (default, external) {
        (Value::Mapping(dmap), Value::Mapping(emap)) => {
            for (k, v) in emap {
                match dmap.get_mut(k) {
                    Some(dv) => merge_yaml(dv, v),
                    None => {
                        dmap.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (d, e) => *d = e.clone(),
    }
}

/// Parses byte sizes like `512`, `512MiB`, `1.5GB`, `64k`.
pub fn parse_size(input: &str) -> Result<i64> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.' && c != '-')
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid size `{}`", input))?;

    let multiplier: i64 = match unit.trim().to_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1024,
        "m" | "mb" | "mib" => 1024 * 1024,
        "g" | "gb" | "gib" => 1024 * 1024 * 1024,
        "t" | "tb" | "tib" => 1024_i64.pow(4),
        other => return Err(anyhow!("unknown size unit `{}` in `{}`", other, input)),
    };

    Ok((value * multiplier as f64) as i64)
}

/// Parses durations like `45`, `90s`, `15m`, `1h`, `7d`.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let value: u64 = number
        .parse()
        .map_err(|_| anyhow!("invalid duration `{}`", input))?;

    let seconds = match unit.trim() {
        "" | "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86_400,
        other => return Err(anyhow!("unknown duration unit `{}` in `{}`", other, input)),
    };

    Ok(Duration::from_secs(seconds))
}
