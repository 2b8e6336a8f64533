// Local client configuration.
//
// Global config: `~/.webinar/config.toml`
// Identity cache: `~/.webinar/identity.json`

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::security::write_private_file;

pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8080";

/// Root directory for client state: `~/.webinar/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".webinar"))
}

/// Path to the global config file: `~/.webinar/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

/// Path to the identity cache: `~/.webinar/identity.json`.
pub fn identity_cache_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("identity.json"))
}

/// Client configuration at `~/.webinar/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Relay base URL (e.g. `https://live.example.com`).
    pub server_url: Option<String>,
    /// Name shown to hosts when registering.
    pub display_name: Option<String>,
    /// Phone used for registration when none is given on the command line.
    pub phone: Option<String>,
}

impl ClientConfig {
    /// Load from `~/.webinar/config.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        global_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let path = global_config_path().ok_or_else(|| {
            ConfigError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "could not determine home directory",
            ))
        })?;
        self.save_to(&path)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        write_private_file(path, contents.as_bytes())
            .map_err(|error| ConfigError::Io(std::io::Error::other(error.to_string())))
    }

    /// Command-line value, then config file, then the local default.
    pub fn resolve_server_url(&self, flag: Option<&str>) -> String {
        flag.map(str::to_string)
            .or_else(|| self.server_url.clone())
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string())
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {e}"),
            Self::Parse(e) => write!(f, "config parse error: {e}"),
            Self::Serialize(e) => write!(f, "config serialize error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn client_config_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let cfg = ClientConfig {
            server_url: Some("https://live.example.com".into()),
            display_name: Some("Sara".into()),
            phone: Some("09123456789".into()),
        };
        cfg.save_to(&path).unwrap();
        assert_eq!(ClientConfig::load_from(&path).unwrap(), cfg);
    }

    #[test]
    fn missing_fields_use_defaults() {
        let cfg: ClientConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, ClientConfig::default());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let error =
            toml::from_str::<ClientConfig>("participant_id = \"abc\"").expect_err("should fail");
        assert!(error.to_string().contains("unknown field `participant_id`"));
    }

    #[test]
    fn server_url_prefers_flag_then_file() {
        let cfg = ClientConfig { server_url: Some("https://file.example".into()), ..Default::default() };
        assert_eq!(cfg.resolve_server_url(Some("https://flag.example")), "https://flag.example");
        assert_eq!(cfg.resolve_server_url(None), "https://file.example");
        assert_eq!(ClientConfig::default().resolve_server_url(None), DEFAULT_SERVER_URL);
    }

    #[test]
    fn paths_live_under_dot_webinar() {
        let dir = global_dir().expect("home directory");
        assert!(dir.ends_with(".webinar"));
        assert!(identity_cache_path().unwrap().ends_with(".webinar/identity.json"));
    }
}
