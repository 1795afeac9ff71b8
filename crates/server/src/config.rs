use std::fs;

use anyhow::Context;
use serde::Deserialize;
use server_api::DrawPolicy;
use shared::path::MAX_SCAN_MS;
use tracing::warn;

pub const SETTINGS_FILE: &str = "draw_server.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub broadcast_capacity: usize,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
    pub default_duration_ms: u64,
    pub default_base_hz: Option<f64>,
}

impl Default for Settings {
    fn default() -> Self {
        let policy = DrawPolicy::default();
        Self {
            server_bind: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/draws.db".into(),
            broadcast_capacity: 256,
            min_duration_ms: policy.min_duration_ms,
            max_duration_ms: policy.max_duration_ms,
            default_duration_ms: policy.default_duration_ms,
            default_base_hz: policy.default_base_hz,
        }
    }
}

/// Keys accepted in `draw_server.toml`. Unknown keys are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileSettings {
    bind_addr: Option<String>,
    database_url: Option<String>,
    broadcast_capacity: Option<usize>,
    min_duration_ms: Option<u64>,
    max_duration_ms: Option<u64>,
    default_duration_ms: Option<u64>,
    default_base_hz: Option<f64>,
}

impl Settings {
    pub fn draw_policy(&self) -> DrawPolicy {
        let min_duration_ms = self.min_duration_ms.min(MAX_SCAN_MS);
        let max_duration_ms = self.max_duration_ms.clamp(min_duration_ms, MAX_SCAN_MS);
        DrawPolicy {
            min_duration_ms,
            max_duration_ms,
            default_duration_ms: self
                .default_duration_ms
                .clamp(min_duration_ms, max_duration_ms),
            default_base_hz: self.default_base_hz.filter(|hz| hz.is_finite() && *hz > 0.0),
        }
    }

    fn apply_file(&mut self, raw: &str) -> anyhow::Result<()> {
        let file_cfg: FileSettings =
            toml::from_str(raw).with_context(|| format!("invalid {SETTINGS_FILE}"))?;
        if let Some(v) = file_cfg.bind_addr {
            self.server_bind = v;
        }
        if let Some(v) = file_cfg.database_url {
            self.database_url = v;
        }
        if let Some(v) = file_cfg.broadcast_capacity {
            self.broadcast_capacity = v;
        }
        if let Some(v) = file_cfg.min_duration_ms {
            self.min_duration_ms = v;
        }
        if let Some(v) = file_cfg.max_duration_ms {
            self.max_duration_ms = v;
        }
        if let Some(v) = file_cfg.default_duration_ms {
            self.default_duration_ms = v;
        }
        if file_cfg.default_base_hz.is_some() {
            self.default_base_hz = file_cfg.default_base_hz;
        }
        Ok(())
    }

    /// Later names win, so `APP__*` overrides the short form.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        for key in ["SERVER_BIND", "APP__BIND_ADDR"] {
            if let Some(v) = var(key) {
                self.server_bind = v;
            }
        }
        for key in ["DATABASE_URL", "APP__DATABASE_URL"] {
            if let Some(v) = var(key) {
                self.database_url = v;
            }
        }
        if let Some(v) = parsed(&var, "APP__BROADCAST_CAPACITY") {
            self.broadcast_capacity = v;
        }
        if let Some(v) = parsed(&var, "APP__MIN_DURATION_MS") {
            self.min_duration_ms = v;
        }
        if let Some(v) = parsed(&var, "APP__MAX_DURATION_MS") {
            self.max_duration_ms = v;
        }
        if let Some(v) = parsed(&var, "APP__DEFAULT_DURATION_MS") {
            self.default_duration_ms = v;
        }
        if let Some(v) = parsed(&var, "APP__DEFAULT_BASE_HZ") {
            self.default_base_hz = Some(v);
        }
    }
}

fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(SETTINGS_FILE) {
        if let Err(error) = settings.apply_file(&raw) {
            warn!(%error, "ignoring settings file");
        }
    }
    settings.apply_env(|key| std::env::var(key).ok());
    if settings.broadcast_capacity == 0 {
        settings.broadcast_capacity = Settings::default().broadcast_capacity;
    }

    settings
}

/// Turns a plain path or a loosely written sqlite URL into one sqlx accepts.
/// Parent directories are created later by `Storage::new`.
pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite://") {
        if has_windows_drive(path) {
            return format!("sqlite:{}", path.replace('\\', "/"));
        }
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        if has_windows_drive(&path) {
            return format!("sqlite:{path}");
        }
        return format!("sqlite://{path}");
    }

    if raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    let path = raw_database_url.replace('\\', "/");
    if has_windows_drive(&path) {
        return format!("sqlite:{path}");
    }
    format!("sqlite://{path}")
}

fn has_windows_drive(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'/' || bytes[2] == b'\\')
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
