use serde_json::json;

use crate::normalizer::{fields_to_enum, make_fields_datetime, NormalizerError};
use crate::payload::Payload;
use crate::types::{
    AuthType, HypeTrainContributionMethod, SCOPE_CHANNEL_READ_HYPE_TRAIN,
    SCOPE_CHANNEL_READ_SUBSCRIPTIONS,
};

/// Webhook topics this service knows how to subscribe to and receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    UserFollows,
    UserChanged,
    StreamChanged,
    ExtensionTransactionCreated,
    ModeratorChangeEvents,
    ChannelBanChangeEvents,
    HypeTrainEvents,
    SubscriptionEvents,
}

/// Credential a topic requires before a subscribe request may be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthRequirement {
    pub auth_type: AuthType,
    pub scopes: &'static [&'static str],
    /// Refuse outright unless the hook runs in authenticated mode.
    pub authenticated_mode: bool,
}

/// What a notification with an empty `data` array turns into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyData {
    Null,
    Offline,
}

impl Topic {
    pub const ALL: [Topic; 8] = [
        Topic::UserFollows,
        Topic::UserChanged,
        Topic::StreamChanged,
        Topic::ExtensionTransactionCreated,
        Topic::ModeratorChangeEvents,
        Topic::ChannelBanChangeEvents,
        Topic::HypeTrainEvents,
        Topic::SubscriptionEvents,
    ];

    /// Local path the remote hub calls back on.
    pub fn callback_path(self) -> &'static str {
        match self {
            Self::UserFollows => "/users/follows",
            Self::UserChanged => "/users/changed",
            Self::StreamChanged => "/streams",
            Self::ExtensionTransactionCreated => "/extensions/transactions",
            Self::ModeratorChangeEvents => "/moderation/moderators/events",
            Self::ChannelBanChangeEvents => "/moderation/banned/events",
            Self::HypeTrainEvents => "/hypetrain/events",
            Self::SubscriptionEvents => "/subscriptions/events",
        }
    }

    /// Helix resource path (relative to the API base) used as the hub topic.
    pub fn api_path(self) -> &'static str {
        match self {
            Self::UserFollows => "users/follows",
            Self::UserChanged => "users",
            Self::StreamChanged => "streams",
            Self::ExtensionTransactionCreated => "extensions/transactions",
            Self::ModeratorChangeEvents => "moderation/moderators/events",
            Self::ChannelBanChangeEvents => "moderation/banned/events",
            Self::HypeTrainEvents => "hypetrain/events",
            Self::SubscriptionEvents => "subscriptions/events",
        }
    }

    /// Label used for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserFollows => "user_follows",
            Self::UserChanged => "user_changed",
            Self::StreamChanged => "stream_changed",
            Self::ExtensionTransactionCreated => "extension_transaction_created",
            Self::ModeratorChangeEvents => "moderator_change_events",
            Self::ChannelBanChangeEvents => "channel_ban_change_events",
            Self::HypeTrainEvents => "hype_train_events",
            Self::SubscriptionEvents => "subscription_events",
        }
    }

    pub fn timestamp_fields(self) -> &'static [&'static str] {
        match self {
            Self::UserFollows => &["followed_at"],
            Self::UserChanged => &[],
            Self::StreamChanged => &["started_at"],
            Self::ExtensionTransactionCreated => &["timestamp"],
            Self::ModeratorChangeEvents
            | Self::ChannelBanChangeEvents
            | Self::SubscriptionEvents => &["event_timestamp"],
            Self::HypeTrainEvents => &[
                "event_timestamp",
                "cooldown_end_time",
                "expires_at",
                "started_at",
            ],
        }
    }

    pub fn enum_fields(self) -> &'static [&'static str] {
        match self {
            Self::HypeTrainEvents => &["type"],
            _ => &[],
        }
    }

    pub fn empty_data(self) -> EmptyData {
        match self {
            Self::StreamChanged => EmptyData::Offline,
            _ => EmptyData::Null,
        }
    }

    pub fn auth(self) -> AuthRequirement {
        let (auth_type, scopes, authenticated_mode): (_, &'static [&'static str], _) = match self
        {
            Self::UserFollows | Self::StreamChanged => (AuthType::None, &[], false),
            Self::ExtensionTransactionCreated => (AuthType::App, &[], true),
            Self::UserChanged | Self::ModeratorChangeEvents | Self::ChannelBanChangeEvents => {
                (AuthType::User, &[], false)
            }
            Self::SubscriptionEvents => {
                (AuthType::User, &[SCOPE_CHANNEL_READ_SUBSCRIPTIONS], false)
            }
            Self::HypeTrainEvents => (AuthType::User, &[SCOPE_CHANNEL_READ_HYPE_TRAIN], false),
        };
        AuthRequirement {
            auth_type,
            scopes,
            authenticated_mode,
        }
    }

    /// Resolves the topic whose callback path equals `path`.
    pub fn from_callback_path(path: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|topic| topic.callback_path() == path)
    }

    /// Turns a raw notification body into the payload handed to callbacks.
    ///
    /// Returns `Ok(None)` when there is nothing to dispatch: the body was not
    /// an object with a `data` array, or the array was empty for a topic
    /// without an offline sentinel.
    pub fn extract_payload(
        self,
        body: Option<serde_json::Value>,
    ) -> Result<Option<Payload>, NormalizerError> {
        let Some(first) = body
            .as_ref()
            .and_then(|body| body.get("data"))
            .and_then(serde_json::Value::as_array)
            .map(|data| data.first().cloned())
        else {
            return Ok(None);
        };

        let mut payload = match first {
            Some(entry) => Payload::from(entry),
            None => match self.empty_data() {
                EmptyData::Offline => return Ok(Some(Payload::from(json!({"type": "offline"})))),
                EmptyData::Null => return Ok(None),
            },
        };

        let timestamps = self.timestamp_fields();
        if !timestamps.is_empty() {
            make_fields_datetime(&mut payload, timestamps)?;
        }
        let enums = self.enum_fields();
        if !enums.is_empty() {
            fields_to_enum(&mut payload, enums, HypeTrainContributionMethod::Unknown);
        }

        Ok(Some(payload))
    }
}
