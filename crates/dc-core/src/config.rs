use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::warn;

const BASE_URL_ENV: &str = "DIFY_API_BASE_URL";
const TOKEN_ENV: &str = "DIFY_API_TOKEN";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{TOKEN_ENV} not set and no token or token_cmd configured")]
    MissingToken,
}

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the Dify API, e.g. `https://api.dify.ai/v1`.
    pub base_url: String,
    /// App API token. Prefer `token_cmd` or the env var over storing it here.
    pub token: Option<String>,
    /// Command to run to get the token (e.g., "pass show dify/app").
    /// The command is run via `sh -c`.
    pub token_cmd: Option<String>,
    /// Seconds allowed for establishing a connection.
    pub connect_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost/v1".to_string(),
            token: None,
            token_cmd: None,
            connect_timeout_secs: 10,
        }
    }
}

impl ApiConfig {
    /// Resolve the token from `token`, then `token_cmd`, then `DIFY_API_TOKEN`.
    pub fn resolve_token(&self) -> Result<String, ConfigError> {
        if let Some(token) = self.token.as_deref().filter(|t| !t.is_empty()) {
            return Ok(token.to_string());
        }

        if let Some(cmd) = &self.token_cmd {
            match Command::new("sh").arg("-c").arg(cmd).output() {
                Ok(output) if output.status.success() => {
                    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
                    if !token.is_empty() {
                        return Ok(token);
                    }
                }
                Ok(output) => warn!("token_cmd exited with {}", output.status),
                Err(e) => warn!("token_cmd failed to run: {e}"),
            }
        }

        std::env::var(TOKEN_ENV)
            .ok()
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::MissingToken)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// End-user identifier sent with every request.
    pub user: String,
    /// Server-side conversation to continue.
    pub conversation_id: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user: default_user(),
            conversation_id: None,
        }
    }
}

/// `user-<unix millis>`, unique enough per run.
fn default_user() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("user-{millis}")
}

impl Config {
    pub fn load_or_default() -> Self {
        let path = config_path();
        let mut config = match Self::load(&path) {
            Ok(config) => config,
            Err(ConfigError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                Config::default()
            }
            Err(e) => {
                eprintln!("warning: {}: {e}", path.display());
                Config::default()
            }
        };
        config.apply_env();
        config
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&contents)?)
    }

    /// Environment overrides, applied on top of the file.
    pub fn apply_env(&mut self) {
        if let Ok(base_url) = std::env::var(BASE_URL_ENV) {
            if !base_url.is_empty() {
                self.api.base_url = base_url;
            }
        }
    }
}

fn config_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".config")
        });
    base.join("difychat").join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.api.base_url, "http://localhost/v1");
        assert!(cfg.api.token.is_none());
        assert_eq!(cfg.api.connect_timeout(), Duration::from_secs(10));
        assert!(cfg.session.user.starts_with("user-"));
        assert!(cfg.session.conversation_id.is_none());
    }

    #[test]
    fn parse_api_config() {
        let toml_str = r#"
[api]
base_url = "https://api.dify.ai/v1"
token_cmd = "pass show dify"
connect_timeout_secs = 3
"#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.api.base_url, "https://api.dify.ai/v1");
        assert_eq!(cfg.api.token_cmd.as_deref(), Some("pass show dify"));
        assert_eq!(cfg.api.connect_timeout_secs, 3);
    }

    #[test]
    fn parse_session_config() {
        let toml_str = r#"
[session]
user = "alice"
conversation_id = "c-123"
"#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.session.user, "alice");
        assert_eq!(cfg.session.conversation_id.as_deref(), Some("c-123"));
        assert_eq!(cfg.api, ApiConfig::default());
    }

    #[test]
    fn parse_empty_toml() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.api, ApiConfig::default());
        assert!(cfg.session.user.starts_with("user-"));
    }

    #[test]
    fn resolve_token_prefers_inline() {
        let cfg = ApiConfig {
            token: Some("inline".to_string()),
            token_cmd: Some("echo from_cmd".to_string()),
            ..Default::default()
        };
        assert_eq!(cfg.resolve_token().unwrap(), "inline");
    }

    #[test]
    fn resolve_token_from_cmd() {
        let cfg = ApiConfig {
            token_cmd: Some("echo test_token_123".to_string()),
            ..Default::default()
        };
        assert_eq!(cfg.resolve_token().unwrap(), "test_token_123");
    }

    #[test]
    fn resolve_token_cmd_failure_fallback() {
        // If token_cmd fails, the env var is tried next
        let cfg = ApiConfig {
            token_cmd: Some("exit 1".to_string()),
            ..Default::default()
        };

        // Depends on DIFY_API_TOKEN; we only check the error kind when unset
        match cfg.resolve_token() {
            Ok(token) => assert!(!token.is_empty()),
            Err(e) => assert!(matches!(e, ConfigError::MissingToken)),
        }
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[api]\nbase_url = \"http://dify.internal/v1\"").unwrap();

        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.api.base_url, "http://dify.internal/v1");
    }

    #[test]
    fn load_reports_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[api\nbase_url = 1").unwrap();

        assert!(matches!(
            Config::load(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(&dir.path().join("nope.toml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
