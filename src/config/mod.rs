//! Configuration and credential storage

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::auth::{StoredToken, TokenStore};
use crate::switch::AmiConfig;

/// Application configuration
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the contact-center backend
    pub api_base_url: Option<String>,
    /// Agent identifier used for queue and status lookups
    pub agent_id: Option<String>,
    /// Stored session bearer token
    pub session_token: Option<StoredToken>,
    /// Switch management endpoint used for queue membership actions
    pub switch: Option<AmiConfig>,
}

/// Overrides the config file location.
pub const CONFIG_ENV: &str = "AGENT_DESK_CONFIG";

impl Config {
    /// Config file path: `$AGENT_DESK_CONFIG` or the platform config dir.
    pub fn config_path() -> Result<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }
        let dirs = ProjectDirs::from("com", "agent-desk", "agent-desk")
            .context("Could not determine config directory")?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        match fs::read_to_string(&path) {
            Ok(content) => Self::parse(&content)
                .with_context(|| format!("Invalid config file {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Write the config, readable only by the owner since it holds the token.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
                .context("Failed to set config permissions")?;
        }

        tracing::debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn agent_id(&self) -> Result<&str> {
        self.agent_id
            .as_deref()
            .context("No agent id configured. Run 'agent-desk login --agent <ID>'.")
    }
}

impl TokenStore for Config {
    fn get_session_token(&self) -> Option<StoredToken> {
        self.session_token.clone()
    }

    fn set_session_token(&mut self, token: String, expires_in: Option<u64>) {
        self.session_token = Some(StoredToken::new(token, expires_in));
    }

    fn clear_tokens(&mut self) {
        self.session_token = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config = Config::parse(
            r#"
api_base_url = "https://desk.example.com"
agent_id = "42"

[session_token]
token = "abc"
expires_at = 4102444800

[switch]
host = "pbx.example.com"
username = "desk"
secret = "pw"
"#,
        )
        .unwrap();

        assert_eq!(config.agent_id().unwrap(), "42");
        assert_eq!(config.get_session_token().unwrap().token, "abc");
        let switch = config.switch.unwrap();
        assert_eq!(switch.port, crate::switch::ami::DEFAULT_PORT);
    }

    #[test]
    fn test_clear_tokens_keeps_endpoints() {
        let mut config = Config {
            api_base_url: Some("https://desk.example.com".into()),
            ..Config::default()
        };
        config.set_session_token("abc".into(), None);
        config.clear_tokens();
        assert!(config.get_session_token().is_none());
        assert!(config.api_base_url.is_some());
        assert!(config.agent_id().is_err());
    }
}
