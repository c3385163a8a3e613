use std::{fmt, net::SocketAddr, time::Duration};

use twi_hook_core::AuthType;
use twi_hook_twitch::TWITCH_API_BASE_URL;
use twi_hook_util::{AccessTokenConfig, AppConfig, TokenKind};
use url::Url;

use crate::error::WebhookError;

pub const MIN_LEASE_SECONDS: u64 = 300;
pub const MAX_LEASE_SECONDS: u64 = 864_000;
const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);

/// Library-level settings of a [`crate::TwitchWebHook`].
#[derive(Debug, Clone)]
pub struct HookSettings {
    /// Public base URL the hub calls back on, without a trailing slash.
    pub callback_url: String,
    pub client_id: String,
    pub api_base_url: Url,
    pub bind_addr: SocketAddr,
    pub lease_seconds: u64,
    pub wait_for_confirm: bool,
    pub confirm_timeout: Duration,
    pub secret: Option<String>,
    pub auto_renew: bool,
    pub unsubscribe_on_stop: bool,
}

impl HookSettings {
    /// Settings with the default lease, confirmation wait and renewal policy.
    pub fn new(
        callback_url: impl Into<String>,
        client_id: impl Into<String>,
        bind_addr: SocketAddr,
    ) -> Result<Self, WebhookError> {
        let callback_url = callback_url.into().trim_end_matches('/').to_string();
        Url::parse(&callback_url).map_err(|err| {
            WebhookError::Configuration(format!("callback url {callback_url:?} is invalid: {err}"))
        })?;

        Ok(Self {
            callback_url,
            client_id: client_id.into(),
            api_base_url: Url::parse(TWITCH_API_BASE_URL)?,
            bind_addr,
            lease_seconds: MAX_LEASE_SECONDS,
            wait_for_confirm: true,
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
            secret: None,
            auto_renew: true,
            unsubscribe_on_stop: true,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, WebhookError> {
        let mut settings = Self::new(&config.callback_url, &config.client_id, config.bind_addr)?;
        settings.api_base_url = parse_base_url(&config.api_base_url)?;
        settings.lease_seconds = config.lease_seconds;
        settings.wait_for_confirm = config.wait_for_confirm;
        settings.confirm_timeout = config.confirm_timeout;
        settings.secret = config.secret.clone();
        settings.auto_renew = config.auto_renew;
        settings.unsubscribe_on_stop = config.unsubscribe_on_stop;
        Ok(settings)
    }

    pub fn uses_https(&self) -> bool {
        self.callback_url.starts_with("https://")
    }

    pub(crate) fn validate_lease(&self) -> Result<(), WebhookError> {
        if (MIN_LEASE_SECONDS..=MAX_LEASE_SECONDS).contains(&self.lease_seconds) {
            Ok(())
        } else {
            Err(WebhookError::Configuration(format!(
                "lease_seconds must be in range {MIN_LEASE_SECONDS} to {MAX_LEASE_SECONDS} (got {})",
                self.lease_seconds
            )))
        }
    }
}

/// `Url::join` drops the last segment unless the base ends with `/`.
fn parse_base_url(raw: &str) -> Result<Url, WebhookError> {
    let normalized = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    Ok(Url::parse(&normalized)?)
}

/// Bearer credential enabling authenticated subscriptions.
#[derive(Clone)]
pub struct Authentication {
    pub access_token: String,
    pub auth_type: AuthType,
    pub scopes: Vec<String>,
}

impl Authentication {
    pub fn app(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            auth_type: AuthType::App,
            scopes: Vec::new(),
        }
    }

    pub fn user(access_token: impl Into<String>, scopes: Vec<String>) -> Self {
        Self {
            access_token: access_token.into(),
            auth_type: AuthType::User,
            scopes,
        }
    }

    /// Returns `true` when this credential covers `required` with every scope listed.
    pub fn satisfies(&self, required: AuthType, scopes: &[&str]) -> bool {
        let has_scopes = || {
            scopes
                .iter()
                .all(|scope| self.scopes.iter().any(|held| held == scope))
        };
        match required {
            AuthType::None => true,
            AuthType::User | AuthType::App => self.auth_type == required && has_scopes(),
        }
    }
}

impl fmt::Debug for Authentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authentication")
            .field("access_token", &"<redacted>")
            .field("auth_type", &self.auth_type)
            .field("scopes", &self.scopes)
            .finish()
    }
}

impl From<AccessTokenConfig> for Authentication {
    fn from(value: AccessTokenConfig) -> Self {
        match value.kind {
            TokenKind::App => Self {
                access_token: value.token,
                auth_type: AuthType::App,
                scopes: value.scopes,
            },
            TokenKind::User => Self::user(value.token, value.scopes),
        }
    }
}
