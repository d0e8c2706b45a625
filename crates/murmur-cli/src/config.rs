//! Configuration file support

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use murmur_chat::ChatConfig;
use murmur_store::{FileKv, RemoteConfig};
use murmur_stream::{RetryConfig, StreamConfig};

/// Configuration for murmur
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend base URL (default: http://localhost:8081)
    pub server_url: Option<String>,
    /// Local cache directory
    pub cache_dir: Option<String>,
    pub stream: StreamSettings,
    pub remote: RemoteSettings,
    pub chat: ChatSettings,
}

/// Streaming session timing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub connect_timeout_secs: Option<u64>,
    /// 0 disables stall detection
    pub idle_timeout_secs: Option<u64>,
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub backoff_factor: Option<f64>,
    pub max_delay_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    pub default_title: Option<String>,
    /// Empty string turns the greeting off
    pub greeting: Option<String>,
    pub title_max_chars: Option<usize>,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("murmur")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("MURMUR_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from the default path
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// Load config from `path`; missing or malformed files yield defaults
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Warning: Failed to parse config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    /// Save config to `path`
    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, content)
    }

    /// Create a default config file if it doesn't exist
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }

        let defaults = Config {
            server_url: Some(RemoteConfig::default().base_url),
            ..Config::default()
        };
        defaults.save_to(&path)?;
        Ok(path)
    }

    pub fn server_url(&self) -> String {
        self.server_url
            .clone()
            .unwrap_or_else(|| RemoteConfig::default().base_url)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(FileKv::default_dir)
    }

    pub fn stream_config(&self) -> StreamConfig {
        let defaults = StreamConfig::default();
        let retry_defaults = RetryConfig::default();
        let s = &self.stream;

        StreamConfig {
            connect_timeout: s
                .connect_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
            idle_timeout: match s.idle_timeout_secs {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.idle_timeout,
            },
            retry: RetryConfig {
                max_attempts: s.max_attempts.unwrap_or(retry_defaults.max_attempts),
                base_delay: s
                    .base_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(retry_defaults.base_delay),
                backoff_factor: s.backoff_factor.unwrap_or(retry_defaults.backoff_factor),
                max_delay: s
                    .max_delay_secs
                    .map(Duration::from_secs)
                    .unwrap_or(retry_defaults.max_delay),
            },
        }
    }

    pub fn remote_config(&self, base_url: String) -> RemoteConfig {
        RemoteConfig {
            base_url,
            timeout: self
                .remote
                .request_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(RemoteConfig::default().timeout),
        }
    }

    pub fn chat_config(&self) -> ChatConfig {
        let defaults = ChatConfig::default();
        let c = &self.chat;

        ChatConfig {
            default_title: c.default_title.clone().unwrap_or(defaults.default_title),
            greeting: match &c.greeting {
                Some(text) if text.trim().is_empty() => None,
                Some(text) => Some(text.clone()),
                None => defaults.greeting,
            },
            title_max_chars: c.title_max_chars.unwrap_or(defaults.title_max_chars),
        }
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# murmur configuration file
# Place at ~/.config/murmur/config.toml (Linux) or set MURMUR_CONFIG_PATH

# Backend serving /api/ai/chat and /conversations
server_url = "http://localhost:8081"

# Where conversations are cached locally (optional)
# cache_dir = "~/.local/share/murmur/cache"

[stream]
connect_timeout_secs = 15
# Seconds without any event before an open stream counts as stalled (0 = off)
idle_timeout_secs = 60
max_attempts = 3
base_delay_ms = 1000
backoff_factor = 2.0
max_delay_secs = 30

[remote]
request_timeout_secs = 15

[chat]
default_title = "New conversation"
# Set to "" to start conversations without a greeting
# greeting = "Hi! I'm your coding assistant."
title_max_chars = 30
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_parses() {
        let config: Config = toml::from_str(example_config()).unwrap();
        assert_eq!(config.server_url.as_deref(), Some("http://localhost:8081"));
        assert_eq!(config.stream_config(), StreamConfig::default());
        assert_eq!(config.remote_config(config.server_url()), RemoteConfig::default());
        assert_eq!(config.chat_config(), ChatConfig::default());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.stream_config(), StreamConfig::default());
        assert_eq!(config.server_url(), "http://localhost:8081");
    }

    #[test]
    fn test_overrides() {
        let config: Config = toml::from_str(
            r#"
            [stream]
            idle_timeout_secs = 0
            max_attempts = 5
            base_delay_ms = 250

            [chat]
            greeting = ""
            "#,
        )
        .unwrap();

        let stream = config.stream_config();
        assert_eq!(stream.idle_timeout, None);
        assert_eq!(stream.retry.max_attempts, 5);
        assert_eq!(stream.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.chat_config().greeting, None);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = Config {
            server_url: Some("http://chat.internal:9000".into()),
            ..Config::default()
        };

        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path), config);
    }

    #[test]
    fn test_malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "server_url = [").unwrap();
        assert_eq!(Config::load_from(&path), Config::default());
        assert_eq!(Config::load_from(&dir.path().join("absent.toml")), Config::default());
    }
}
