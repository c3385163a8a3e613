use std::time::Duration;

use metrics::counter;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::handshake::TwitchWebHook;
use crate::registry::SubscriptionState;

/// Outcome of one renewal pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RenewalReport {
    pub renewed: usize,
    pub rejected: usize,
    pub failed: usize,
}

/// Background worker that re-subscribes every active record before its lease runs out.
#[derive(Clone)]
pub struct RenewalWorker {
    hook: TwitchWebHook,
    interval: Duration,
}

impl RenewalWorker {
    pub fn new(hook: TwitchWebHook, interval: Duration) -> Self {
        Self { hook, interval }
    }

    /// Runs the worker loop in the background.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self) {
        // First tick one full interval after start; subscriptions are fresh.
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.run_once().await;
        }
    }

    /// Renews each record that is currently `Active`.
    pub async fn run_once(&self) -> RenewalReport {
        let mut report = RenewalReport::default();
        let ids = self
            .hook
            .registry()
            .ids_in_state(SubscriptionState::Active)
            .await;

        for id in ids {
            match self.hook.renew_subscription(id).await {
                Ok(true) => {
                    report.renewed += 1;
                    counter!("subscription_renewals_total", "result" => "renewed").increment(1);
                }
                Ok(false) => {
                    report.rejected += 1;
                    counter!("subscription_renewals_total", "result" => "rejected").increment(1);
                    warn!(stage = "renewal", %id, "hub rejected subscription renewal");
                }
                Err(err) => {
                    report.failed += 1;
                    counter!("subscription_renewals_total", "result" => "error").increment(1);
                    error!(stage = "renewal", %id, error = %err, "subscription renewal failed");
                }
            }
        }

        info!(
            stage = "renewal",
            renewed = report.renewed,
            rejected = report.rejected,
            failed = report.failed,
            "renewal pass completed"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use twi_hook_core::Topic;
    use url::Url;

    use crate::settings::HookSettings;

    fn hook(server: &MockServer) -> TwitchWebHook {
        let mut settings = HookSettings::new(
            "https://hook.example",
            "client-id",
            "127.0.0.1:0".parse().expect("addr"),
        )
        .expect("settings");
        settings.api_base_url = Url::parse(&server.url("/helix/")).expect("url");
        settings.auto_renew = false;
        TwitchWebHook::new(settings).expect("hook")
    }

    #[tokio::test]
    async fn renews_only_active_records() {
        let server = MockServer::start_async().await;
        let hook = hook(&server);
        let registry = hook.registry();

        let active = registry
            .create(
                Topic::StreamChanged,
                "https://api.twitch.tv/helix/streams?user_id=1".to_string(),
                None,
            )
            .await
            .id;
        registry.mark_active(active).await;
        registry
            .create(
                Topic::StreamChanged,
                "https://api.twitch.tv/helix/streams?user_id=2".to_string(),
                None,
            )
            .await;

        let renew = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/helix/webhooks/hub")
                    .x_www_form_urlencoded_tuple("hub.mode", "subscribe")
                    .x_www_form_urlencoded_tuple(
                        "hub.topic",
                        "https://api.twitch.tv/helix/streams?user_id=1",
                    )
                    .x_www_form_urlencoded_tuple(
                        "hub.callback",
                        &format!("https://hook.example/streams?uuid={active}"),
                    );
                then.status(202);
            })
            .await;

        let report = RenewalWorker::new(hook.clone(), Duration::from_secs(60))
            .run_once()
            .await;

        renew.assert_hits_async(1).await;
        assert_eq!(
            report,
            RenewalReport {
                renewed: 1,
                rejected: 0,
                failed: 0
            }
        );
    }

    #[tokio::test]
    async fn rejected_renewal_is_reported() {
        let server = MockServer::start_async().await;
        let hook = hook(&server);
        let id = hook
            .registry()
            .create(Topic::UserFollows, "topic".to_string(), None)
            .await
            .id;
        hook.registry().mark_active(id).await;

        server
            .mock_async(|when, then| {
                when.method(POST).path("/helix/webhooks/hub");
                then.status(409);
            })
            .await;

        let report = RenewalWorker::new(hook, Duration::from_secs(60))
            .run_once()
            .await;
        assert_eq!(report.rejected, 1);
        assert_eq!(report.renewed, 0);
    }
}
