//! Runtime configuration.
//!
//! Everything has a working default so a fresh install talks to a backend on
//! `localhost:8001`. Each value can be overridden through a `LAUREL_*`
//! environment variable; malformed values are logged and ignored.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::api::normalize_backend_url;

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8001";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RECONNECT_ATTEMPTS: u32 = 10;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 1_000;
const DEFAULT_SOCKET_PATH: &str = "socket.io";

const ENV_BACKEND_URL: &str = "LAUREL_BACKEND_URL";
const ENV_DATA_DIR: &str = "LAUREL_DATA_DIR";
const ENV_HTTP_TIMEOUT: &str = "LAUREL_HTTP_TIMEOUT_SECS";
const ENV_RECONNECT_ATTEMPTS: &str = "LAUREL_RECONNECT_ATTEMPTS";
const ENV_RECONNECT_DELAY: &str = "LAUREL_RECONNECT_DELAY_MS";
const ENV_SOCKET_PATH: &str = "LAUREL_SOCKET_PATH";
const ENV_LOG_JSON: &str = "LAUREL_LOG_JSON";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend origin without the `/api` suffix.
    pub backend_url: String,
    /// Holds the offline cache database and the `logs/` directory.
    pub data_dir: PathBuf,
    pub http_timeout_secs: u64,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub socket_path: String,
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            data_dir: default_data_dir(),
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            socket_path: DEFAULT_SOCKET_PATH.to_string(),
            log_json: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Some(url) = env_string(ENV_BACKEND_URL) {
            config.backend_url = url;
        }
        if let Some(dir) = env_string(ENV_DATA_DIR) {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(secs) = env_parsed::<u64>(ENV_HTTP_TIMEOUT).filter(|s| *s > 0) {
            config.http_timeout_secs = secs;
        }
        if let Some(attempts) = env_parsed::<u32>(ENV_RECONNECT_ATTEMPTS) {
            config.reconnect_attempts = attempts;
        }
        if let Some(ms) = env_parsed::<u64>(ENV_RECONNECT_DELAY) {
            config.reconnect_delay_ms = ms;
        }
        if let Some(path) = env_string(ENV_SOCKET_PATH) {
            config.socket_path = path.trim_matches('/').to_string();
        }
        if let Some(flag) = env_string(ENV_LOG_JSON) {
            config.log_json = matches!(
                flag.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }

        config.backend_url = normalize_backend_url(&config.backend_url);
        config
    }

    /// Base for REST calls, e.g. `http://localhost:8001/api`.
    pub fn api_base(&self) -> String {
        format!("{}/api", normalize_backend_url(&self.backend_url))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn cache_path(&self) -> PathBuf {
        self.data_dir.join("offline.db")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env_string(key)?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring malformed configuration value");
            None
        }
    }
}

fn default_data_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                .join(".local")
                .join("share")
        });
    base.join("laurel-pos")
}
