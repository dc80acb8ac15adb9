use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

pub const DEFAULT_DEBOUNCE_MS: u64 = 100;
const SETTINGS_FILE: &str = "dispatcher.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    pub debounce_ms: u64,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
        }
    }
}

impl DispatcherSettings {
    pub fn with_debounce_ms(debounce_ms: u64) -> Self {
        Self { debounce_ms }
    }

    pub fn quiet_interval(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Defaults, then `dispatcher.toml` in the working directory if present, then
/// the environment.
pub fn load_settings() -> DispatcherSettings {
    layered_settings(Path::new(SETTINGS_FILE), env_var)
}

/// Like [`load_settings`] but the file is mandatory.
pub fn load_settings_from(path: &Path) -> anyhow::Result<DispatcherSettings> {
    settings_from_file(path, env_var)
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn layered_settings(path: &Path, lookup: impl Fn(&str) -> Option<String>) -> DispatcherSettings {
    let mut settings = match read_settings_file(path) {
        Ok(settings) => settings,
        Err(err) => {
            tracing::warn!("dispatch: ignoring {}: {err:#}", path.display());
            DispatcherSettings::default()
        }
    };
    apply_env(&mut settings, lookup);
    settings
}

fn settings_from_file(
    path: &Path,
    lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<DispatcherSettings> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file {}", path.display()))?;
    let mut settings = parse_settings(&raw)
        .with_context(|| format!("failed to parse settings file {}", path.display()))?;
    apply_env(&mut settings, lookup);
    Ok(settings)
}

fn read_settings_file(path: &Path) -> anyhow::Result<DispatcherSettings> {
    if !path.exists() {
        return Ok(DispatcherSettings::default());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file {}", path.display()))?;
    parse_settings(&raw)
}

fn parse_settings(raw: &str) -> anyhow::Result<DispatcherSettings> {
    toml::from_str(raw).context("invalid dispatcher settings")
}

fn apply_env(settings: &mut DispatcherSettings, lookup: impl Fn(&str) -> Option<String>) {
    for key in ["DEBOUNCE_MS", "APP__DEBOUNCE_MS"] {
        if let Some(parsed) = lookup(key).and_then(|v| v.trim().parse::<u64>().ok()) {
            settings.debounce_ms = parsed;
        }
    }
}
