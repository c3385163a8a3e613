use std::{env, fmt, net::SocketAddr, time::Duration};

use super::server_bind_address;

pub const DEFAULT_API_BASE_URL: &str = "https://api.twitch.tv/helix/";
pub const DEFAULT_LEASE_SECONDS: u64 = 864_000;
pub const DEFAULT_CONFIRM_TIMEOUT_SECS: u64 = 30;

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Which kind of OAuth token `TWITCH_ACCESS_TOKEN` holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    App,
    User,
}

/// Bearer credential used for authenticated subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessTokenConfig {
    pub token: String,
    pub kind: TokenKind,
    pub scopes: Vec<String>,
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    /// Public base URL the hub calls back on, without a trailing slash.
    pub callback_url: String,
    pub client_id: String,
    pub api_base_url: String,
    pub lease_seconds: u64,
    pub wait_for_confirm: bool,
    pub confirm_timeout: Duration,
    pub secret: Option<String>,
    pub access_token: Option<AccessTokenConfig>,
    pub auto_renew: bool,
    pub unsubscribe_on_stop: bool,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        let callback_url = required("WEBHOOK_CALLBACK_URL")?
            .trim_end_matches('/')
            .to_string();
        let client_id = required("TWITCH_CLIENT_ID")?;
        let api_base_url = optional("TWITCH_API_BASE_URL")
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());

        let lease_seconds = parse_u64("WEBHOOK_LEASE_SECONDS", DEFAULT_LEASE_SECONDS)?;
        let wait_for_confirm = parse_bool("WEBHOOK_WAIT_FOR_CONFIRM", true)?;
        let confirm_timeout = Duration::from_secs(parse_u64(
            "WEBHOOK_CONFIRM_TIMEOUT_SECS",
            DEFAULT_CONFIRM_TIMEOUT_SECS,
        )?);
        let auto_renew = parse_bool("WEBHOOK_AUTO_RENEW", true)?;
        let unsubscribe_on_stop = parse_bool("WEBHOOK_UNSUBSCRIBE_ON_STOP", true)?;

        let access_token = match optional("TWITCH_ACCESS_TOKEN") {
            Some(token) => Some(AccessTokenConfig {
                token,
                kind: parse_token_kind()?,
                scopes: optional("TWITCH_TOKEN_SCOPES")
                    .map(|raw| raw.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default(),
            }),
            None => None,
        };

        Ok(Self {
            bind_addr,
            environment,
            callback_url,
            client_id,
            api_base_url,
            lease_seconds,
            wait_for_confirm,
            confirm_timeout,
            secret: optional("WEBHOOK_SECRET"),
            access_token,
            auto_renew,
            unsubscribe_on_stop,
        })
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::Missing(name))
}

fn parse_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match optional(name) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            name,
            value: raw,
        }),
        None => Ok(default),
    }
}

fn parse_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match optional(name) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue { name, value: raw }),
        },
        None => Ok(default),
    }
}

fn parse_token_kind() -> Result<TokenKind, ConfigError> {
    match optional("TWITCH_TOKEN_TYPE").as_deref() {
        None | Some("app") => Ok(TokenKind::App),
        Some("user") => Ok(TokenKind::User),
        Some(other) => Err(ConfigError::InvalidValue {
            name: "TWITCH_TOKEN_TYPE",
            value: other.to_string(),
        }),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    Missing(&'static str),
    InvalidValue { name: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::Missing(name) => write!(f, "{name} must be set"),
            Self::InvalidValue { name, value } => write!(f, "invalid {name} value: {value}"),
        }
    }
}

impl std::error::Error for ConfigError {}
