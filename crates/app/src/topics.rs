use std::sync::Arc;

use twi_hook_core::{BuildOptions, Payload, QueryValue, Topic};
use uuid::Uuid;

use crate::error::WebhookError;
use crate::handshake::{SubscribeOutcome, TwitchWebHook};
use crate::registry::EventHandler;

fn boxed<F>(handler: F) -> Option<EventHandler>
where
    F: Fn(Uuid, &Payload) + Send + Sync + 'static,
{
    Some(Arc::new(handler))
}

/// Optional filters for [`TwitchWebHook::subscribe_subscription_events`].
#[derive(Debug, Clone, Default)]
pub struct SubscriptionEventFilter {
    pub user_id: Option<String>,
    pub gifter_id: Option<String>,
    pub gifter_name: Option<String>,
}

impl TwitchWebHook {
    /// Follows from `from_id`, to `to_id`, or between the two. At least one is required.
    pub async fn subscribe_user_follow<F>(
        &self,
        from_id: Option<&str>,
        to_id: Option<&str>,
        handler: F,
    ) -> Result<SubscribeOutcome, WebhookError>
    where
        F: Fn(Uuid, &Payload) + Send + Sync + 'static,
    {
        if from_id.is_none() && to_id.is_none() {
            return Err(WebhookError::InvalidArgument(
                "at least one of from_id and to_id is required".to_string(),
            ));
        }
        self.subscribe_topic(
            Topic::UserFollows,
            &[
                ("first", 1u32.into()),
                ("from_id", from_id.into()),
                ("to_id", to_id.into()),
            ],
            BuildOptions::remove_none(),
            boxed(handler),
        )
        .await
    }

    /// Stream goes live, changes, or goes offline (payload `{"type": "offline"}`).
    pub async fn subscribe_stream_changed<F>(
        &self,
        user_id: &str,
        handler: F,
    ) -> Result<SubscribeOutcome, WebhookError>
    where
        F: Fn(Uuid, &Payload) + Send + Sync + 'static,
    {
        self.subscribe_topic(
            Topic::StreamChanged,
            &[("user_id", user_id.into())],
            BuildOptions::remove_none(),
            boxed(handler),
        )
        .await
    }

    pub async fn subscribe_user_changed<F>(
        &self,
        user_id: &str,
        handler: F,
    ) -> Result<SubscribeOutcome, WebhookError>
    where
        F: Fn(Uuid, &Payload) + Send + Sync + 'static,
    {
        self.subscribe_topic(
            Topic::UserChanged,
            &[("id", user_id.into())],
            BuildOptions::remove_none(),
            boxed(handler),
        )
        .await
    }

    /// Requires authenticated mode with an app token.
    pub async fn subscribe_extension_transaction_created<F>(
        &self,
        extension_id: &str,
        handler: F,
    ) -> Result<SubscribeOutcome, WebhookError>
    where
        F: Fn(Uuid, &Payload) + Send + Sync + 'static,
    {
        self.subscribe_topic(
            Topic::ExtensionTransactionCreated,
            &[("extension_id", extension_id.into()), ("first", 1u32.into())],
            BuildOptions::remove_none(),
            boxed(handler),
        )
        .await
    }

    pub async fn subscribe_moderator_change_events<F>(
        &self,
        broadcaster_id: &str,
        user_id: Option<&str>,
        handler: F,
    ) -> Result<SubscribeOutcome, WebhookError>
    where
        F: Fn(Uuid, &Payload) + Send + Sync + 'static,
    {
        self.subscribe_topic(
            Topic::ModeratorChangeEvents,
            &moderation_params(broadcaster_id, user_id),
            BuildOptions::remove_none(),
            boxed(handler),
        )
        .await
    }

    pub async fn subscribe_channel_ban_change_events<F>(
        &self,
        broadcaster_id: &str,
        user_id: Option<&str>,
        handler: F,
    ) -> Result<SubscribeOutcome, WebhookError>
    where
        F: Fn(Uuid, &Payload) + Send + Sync + 'static,
    {
        self.subscribe_topic(
            Topic::ChannelBanChangeEvents,
            &moderation_params(broadcaster_id, user_id),
            BuildOptions::remove_none(),
            boxed(handler),
        )
        .await
    }

    /// Requires a user token with `channel:read:subscriptions`.
    pub async fn subscribe_subscription_events<F>(
        &self,
        broadcaster_id: &str,
        filter: SubscriptionEventFilter,
        handler: F,
    ) -> Result<SubscribeOutcome, WebhookError>
    where
        F: Fn(Uuid, &Payload) + Send + Sync + 'static,
    {
        self.subscribe_topic(
            Topic::SubscriptionEvents,
            &[
                ("broadcaster_id", broadcaster_id.into()),
                ("first", 1u32.into()),
                ("gifter_id", filter.gifter_id.into()),
                ("gifter_name", filter.gifter_name.into()),
                ("user_id", filter.user_id.into()),
            ],
            BuildOptions::remove_none(),
            boxed(handler),
        )
        .await
    }

    /// Requires a user token with `channel:read:hype_train`.
    pub async fn subscribe_hype_train_events<F>(
        &self,
        broadcaster_id: &str,
        handler: F,
    ) -> Result<SubscribeOutcome, WebhookError>
    where
        F: Fn(Uuid, &Payload) + Send + Sync + 'static,
    {
        self.subscribe_topic(
            Topic::HypeTrainEvents,
            &[("broadcaster_id", broadcaster_id.into()), ("first", 1u32.into())],
            BuildOptions::remove_none(),
            boxed(handler),
        )
        .await
    }
}

fn moderation_params(
    broadcaster_id: &str,
    user_id: Option<&str>,
) -> [(&'static str, QueryValue); 3] {
    [
        ("broadcaster_id", broadcaster_id.into()),
        ("first", 1u32.into()),
        ("user_id", user_id.into()),
    ]
}
