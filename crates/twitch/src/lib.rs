pub mod hub;

pub use hub::{
    HubClient, HubError, HubMode, HubRequest, HubResponse, ListSubscriptionsParams,
    WebhookSubscription, WebhookSubscriptionPage,
};

/// Base URL of the Helix API; topic URLs and the hub endpoint hang off it.
pub const TWITCH_API_BASE_URL: &str = "https://api.twitch.tv/helix/";
