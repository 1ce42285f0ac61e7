//! Client configuration.
//!
//! Stored as a `client.properties` file of `key=value` lines so existing
//! deployments keep their config format. Unknown keys are preserved on save.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::client_id;
use crate::error::{Error, Result};

/// Default server endpoint.
pub const DEFAULT_SERVER_URL: &str = "http://localhost:8080/api";

/// Default sync root, relative to the working directory.
pub const DEFAULT_SYNC_PATH: &str = "./sync";

/// Default reconciliation interval in seconds.
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 10;

/// Client settings, loaded from and saved to `client.properties`.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    pub sync_path: PathBuf,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub auth_token: Option<String>,
    pub refresh_token: Option<String>,
    pub sync_interval_secs: u64,
    /// Use a random per-installation client id instead of the
    /// username-derived one.
    pub device_unique: bool,

    /// Keys we don't understand, carried through load/save untouched.
    extra: BTreeMap<String, String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            sync_path: PathBuf::from(DEFAULT_SYNC_PATH),
            client_id: None,
            username: None,
            auth_token: None,
            refresh_token: None,
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            device_unique: false,
            extra: BTreeMap::new(),
        }
    }
}

impl ClientConfig {
    /// Default config file location: `./client.properties`.
    pub fn default_path() -> PathBuf {
        PathBuf::from("client.properties")
    }

    /// Load from the default location; a missing file yields the defaults.
    pub fn load_default() -> Result<Self> {
        Self::load(&Self::default_path())
    }

    /// Load a properties file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(Error::Io(e)),
        };

        let mut config = Self::default();
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(Error::InvalidConfig(format!(
                    "line {}: expected key=value, got '{}'",
                    line_no + 1,
                    line
                )));
            };
            let key = key.trim();
            let value = value.trim().to_string();

            match key {
                "server.url" => config.server_url = value,
                "sync.path" => config.sync_path = PathBuf::from(value),
                "client.id" => config.client_id = non_empty(value),
                "user.username" => config.username = non_empty(value),
                "auth.token" => config.auth_token = non_empty(value),
                "auth.refresh_token" => config.refresh_token = non_empty(value),
                "sync.interval" => {
                    config.sync_interval_secs = value.parse().map_err(|_| {
                        Error::InvalidConfig(format!("sync.interval is not a number: '{}'", value))
                    })?
                }
                "client.device_unique" => config.device_unique = value == "true",
                _ => {
                    config.extra.insert(key.to_string(), value);
                }
            }
        }

        Ok(config)
    }

    /// Write the config back out as a properties file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut lines = vec![
            format!("server.url={}", self.server_url),
            format!("sync.path={}", self.sync_path.display()),
            format!("sync.interval={}", self.sync_interval_secs),
            format!("client.device_unique={}", self.device_unique),
        ];
        if let Some(ref id) = self.client_id {
            lines.push(format!("client.id={}", id));
        }
        if let Some(ref username) = self.username {
            lines.push(format!("user.username={}", username));
        }
        if let Some(ref token) = self.auth_token {
            lines.push(format!("auth.token={}", token));
        }
        if let Some(ref token) = self.refresh_token {
            lines.push(format!("auth.refresh_token={}", token));
        }
        for (key, value) in &self.extra {
            lines.push(format!("{}={}", key, value));
        }
        lines.push(String::new());

        std::fs::write(path, lines.join("\n"))?;
        Ok(())
    }

    /// Resolve (and persist in memory) the client id for this installation.
    ///
    /// Username-derived by default; random when `device_unique` is set or no
    /// user is logged in. Stable once assigned.
    pub fn effective_client_id(&mut self) -> String {
        if let Some(ref id) = self.client_id {
            return id.clone();
        }
        let id = match (&self.username, self.device_unique) {
            (Some(username), false) => client_id::derive_client_id(username),
            _ => client_id::random_client_id(),
        };
        self.client_id = Some(id.clone());
        id
    }

    /// Websocket URL for the event socket, derived from `server_url`.
    pub fn ws_url(&self) -> String {
        let base = self
            .server_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{}/sync/ws", base.trim_end_matches('/'))
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.server_url, "http://localhost:8080/api");
        assert_eq!(config.sync_path, PathBuf::from("./sync"));
        assert_eq!(config.sync_interval_secs, 10);
        assert!(!config.device_unique);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig::load(&dir.path().join("nope.properties")).unwrap();
        assert_eq!(config.server_url, DEFAULT_SERVER_URL);
    }

    #[test]
    fn test_load_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.properties");

        let mut config = ClientConfig::default();
        config.username = Some("alice".to_string());
        config.auth_token = Some("tok".to_string());
        config.sync_interval_secs = 30;
        config.save(&path).unwrap();

        let loaded = ClientConfig::load(&path).unwrap();
        assert_eq!(loaded.username.as_deref(), Some("alice"));
        assert_eq!(loaded.auth_token.as_deref(), Some("tok"));
        assert_eq!(loaded.sync_interval_secs, 30);
    }

    #[test]
    fn test_unknown_keys_survive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.properties");
        std::fs::write(&path, "server.url=http://s/api\ncustom.flag=yes\n").unwrap();

        let config = ClientConfig::load(&path).unwrap();
        config.save(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("custom.flag=yes"));
    }

    #[test]
    fn test_comments_and_blanks_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.properties");
        std::fs::write(&path, "# comment\n\nsync.interval=42\n").unwrap();

        let config = ClientConfig::load(&path).unwrap();
        assert_eq!(config.sync_interval_secs, 42);
    }

    #[test]
    fn test_bad_interval_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.properties");
        std::fs::write(&path, "sync.interval=soon\n").unwrap();

        assert!(ClientConfig::load(&path).is_err());
    }

    #[test]
    fn test_effective_client_id_deterministic_by_default() {
        let mut config = ClientConfig {
            username: Some("alice".to_string()),
            ..Default::default()
        };
        let id = config.effective_client_id();
        assert_eq!(id, crate::client_id::derive_client_id("alice"));
        // Stable on repeat calls
        assert_eq!(config.effective_client_id(), id);
    }

    #[test]
    fn test_effective_client_id_device_unique() {
        let mut config = ClientConfig {
            username: Some("alice".to_string()),
            device_unique: true,
            ..Default::default()
        };
        let id = config.effective_client_id();
        assert_ne!(id, crate::client_id::derive_client_id("alice"));
        assert_eq!(config.effective_client_id(), id);
    }

    #[test]
    fn test_ws_url_derivation() {
        let config = ClientConfig {
            server_url: "https://sync.example.com/api".to_string(),
            ..Default::default()
        };
        assert_eq!(config.ws_url(), "wss://sync.example.com/api/sync/ws");
    }
}
