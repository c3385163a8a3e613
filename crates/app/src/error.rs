use thiserror::Error;
use twi_hook_core::UrlBuildError;
use twi_hook_twitch::HubError;
use uuid::Uuid;

/// Errors surfaced by the webhook manager's public operations.
///
/// A hub answering with anything but `202` and a confirmation that never
/// arrives are not errors; those come back as an unsuccessful outcome.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("authentication required: {0}")]
    AuthenticationRequired(String),
    #[error("no subscription found for uuid {0}")]
    UnknownSubscription(Uuid),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("webhook server is already running")]
    AlreadyRunning,
    #[error("hub request failed: {0}")]
    Hub(#[from] HubError),
    #[error("failed to build topic url: {0}")]
    TopicUrl(#[from] UrlBuildError),
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("webhook server io error: {0}")]
    Io(#[from] std::io::Error),
}
