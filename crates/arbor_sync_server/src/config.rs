use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (default: 0.0.0.0)
    pub host: String,
    /// Server port (default: 3030)
    pub port: u16,
    /// Directory for persisted document state (default: ./arbor_data)
    pub data_dir: PathBuf,
    /// How long an unreferenced replica lingers before being flushed and
    /// dropped (default: 10 seconds)
    pub close_grace: Duration,
    /// CORS allowed origins (comma-separated)
    pub cors_origins: Vec<String>,
    /// Access tokens, each `token:username:permission` (comma-separated;
    /// permission is `rw` or `ro`)
    pub tokens: Vec<TokenEntry>,
}

/// One entry of the `ARBOR_TOKENS` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenEntry {
    pub token: String,
    pub username: String,
    pub read_write: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .unwrap_or_else(|_| "3030".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let data_dir =
            PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "./arbor_data".to_string()));

        let close_grace_secs: u64 = env::var("CLOSE_GRACE_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidCloseGrace)?;

        let cors_origins = env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5174,http://localhost:5175".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let tokens = env::var("ARBOR_TOKENS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(TokenEntry::parse)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Config {
            host,
            port,
            data_dir,
            close_grace: Duration::from_secs(close_grace_secs),
            cors_origins,
            tokens,
        })
    }

    /// Get the server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl TokenEntry {
    fn parse(entry: &str) -> Result<Self, ConfigError> {
        let mut parts = entry.splitn(3, ':');
        let (Some(token), Some(username), Some(permission)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(ConfigError::InvalidToken(entry.to_string()));
        };
        let read_write = match permission {
            "rw" => true,
            "ro" => false,
            _ => return Err(ConfigError::InvalidToken(entry.to_string())),
        };
        if token.is_empty() || username.is_empty() {
            return Err(ConfigError::InvalidToken(entry.to_string()));
        }
        Ok(TokenEntry {
            token: token.to_string(),
            username: username.to_string(),
            read_write,
        })
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidCloseGrace,
    InvalidToken(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "Invalid PORT environment variable"),
            ConfigError::InvalidCloseGrace => {
                write!(f, "Invalid CLOSE_GRACE_SECS environment variable")
            }
            ConfigError::InvalidToken(entry) => {
                write!(
                    f,
                    "Invalid ARBOR_TOKENS entry '{}' (expected token:username:rw|ro)",
                    entry
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {}
