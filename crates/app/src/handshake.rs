use std::{collections::HashSet, net::SocketAddr, sync::Arc, time::Duration};

use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use reqwest::Client;
use tokio::{
    net::TcpListener,
    sync::{oneshot, watch, Mutex, RwLock},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, error, info, warn};
use twi_hook_core::{build_url, AuthType, BuildOptions, Payload, QueryValue, Topic};
use twi_hook_twitch::{HubClient, HubMode, HubRequest, HubResponse, ListSubscriptionsParams};
use uuid::Uuid;

use crate::error::WebhookError;
use crate::registry::{
    EventHandler, SubscriptionRecord, SubscriptionRegistry, SubscriptionState, SweepTracker,
};
use crate::renewal::RenewalWorker;
use crate::router::{app_router, AppState};
use crate::settings::{Authentication, HookSettings};

const LIST_PAGE_SIZE: u32 = 100;
const RENEW_MARGIN_SECS: u64 = 60;

/// Result of a subscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOutcome {
    pub id: Uuid,
    /// Hub accepted the request and, when waiting is enabled, the
    /// subscription was confirmed within the timeout.
    pub success: bool,
}

struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
    renewal: Option<JoinHandle<()>>,
}

struct HookInner {
    settings: HookSettings,
    hub: HubClient,
    registry: SubscriptionRegistry,
    sweep: Arc<SweepTracker>,
    auth: RwLock<Option<Authentication>>,
    server: Mutex<Option<ServerHandle>>,
    metrics: Option<PrometheusHandle>,
}

/// Manages WebSub subscriptions against the Twitch hub and runs the callback
/// server the hub verifies and notifies.
///
/// Cheap to clone; clones share the same registry and server.
#[derive(Clone)]
pub struct TwitchWebHook {
    inner: Arc<HookInner>,
}

impl TwitchWebHook {
    pub fn new(settings: HookSettings) -> Result<Self, WebhookError> {
        Self::build(settings, None)
    }

    /// Like [`TwitchWebHook::new`], additionally serving `/metrics` from `handle`.
    pub fn with_metrics(
        settings: HookSettings,
        handle: PrometheusHandle,
    ) -> Result<Self, WebhookError> {
        Self::build(settings, Some(handle))
    }

    fn build(
        settings: HookSettings,
        metrics: Option<PrometheusHandle>,
    ) -> Result<Self, WebhookError> {
        let http = Client::builder()
            .build()
            .map_err(|err| WebhookError::Hub(err.into()))?;
        let hub = HubClient::new(
            settings.client_id.clone(),
            settings.api_base_url.clone(),
            http,
        );
        Ok(Self {
            inner: Arc::new(HookInner {
                settings,
                hub,
                registry: SubscriptionRegistry::new(),
                sweep: Arc::new(SweepTracker::new()),
                auth: RwLock::new(None),
                server: Mutex::new(None),
                metrics,
            }),
        })
    }

    pub fn settings(&self) -> &HookSettings {
        &self.inner.settings
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }

    /// Enables authenticated mode. The callback URL must use HTTPS.
    pub async fn authenticate(&self, auth: Authentication) -> Result<(), WebhookError> {
        if !self.inner.settings.uses_https() {
            return Err(WebhookError::Configuration(
                "authenticated mode requires an https callback url".to_string(),
            ));
        }
        info!(
            stage = "handshake",
            auth_type = auth.auth_type.as_str(),
            scopes = auth.scopes.len(),
            "authenticated mode enabled"
        );
        *self.inner.auth.write().await = Some(auth);
        Ok(())
    }

    /// Swaps the bearer token of the current credential, keeping type and scopes.
    pub async fn set_access_token(&self, token: impl Into<String>) -> Result<(), WebhookError> {
        match self.inner.auth.write().await.as_mut() {
            Some(auth) => {
                auth.access_token = token.into();
                Ok(())
            }
            None => Err(WebhookError::AuthenticationRequired(
                "no credential to update; call authenticate first".to_string(),
            )),
        }
    }

    pub async fn is_authenticated(&self) -> bool {
        self.inner.auth.read().await.is_some()
    }

    async fn access_token(&self) -> Option<String> {
        self.inner
            .auth
            .read()
            .await
            .as_ref()
            .map(|auth| auth.access_token.clone())
    }

    async fn check_auth(&self, topic: Topic) -> Result<(), WebhookError> {
        let requirement = topic.auth();
        let auth = self.inner.auth.read().await;
        if requirement.authenticated_mode && auth.is_none() {
            return Err(WebhookError::AuthenticationRequired(format!(
                "{} requires authenticated mode",
                topic.as_str()
            )));
        }
        let satisfied = match auth.as_ref() {
            Some(auth) => auth.satisfies(requirement.auth_type, requirement.scopes),
            None => requirement.auth_type == AuthType::None,
        };
        if satisfied {
            Ok(())
        } else {
            Err(WebhookError::AuthenticationRequired(format!(
                "{} requires a {} token with scopes [{}]",
                topic.as_str(),
                requirement.auth_type.as_str(),
                requirement.scopes.join(", ")
            )))
        }
    }

    /// Registers a subscription for `topic` and asks the hub to verify it.
    pub(crate) async fn subscribe_topic(
        &self,
        topic: Topic,
        params: &[(&str, QueryValue)],
        options: BuildOptions,
        handler: Option<EventHandler>,
    ) -> Result<SubscribeOutcome, WebhookError> {
        self.check_auth(topic).await?;

        let base = self.inner.hub.base_url().join(topic.api_path())?;
        let topic_url = build_url(base.as_str(), params, options)?;

        let record = self
            .inner
            .registry
            .create(topic, topic_url, handler)
            .await;
        let id = record.id;

        let response = match self.post_hub(HubMode::Subscribe, &record).await {
            Ok(response) => response,
            Err(err) => {
                self.inner.registry.remove(id).await;
                return Err(err);
            }
        };
        if !response.is_accepted() {
            self.inner.registry.remove(id).await;
            return Ok(SubscribeOutcome { id, success: false });
        }

        if !self.inner.settings.wait_for_confirm {
            return Ok(SubscribeOutcome { id, success: true });
        }

        let confirmed = self.wait_for_state(id, SubscriptionState::Active).await;
        if !confirmed {
            warn!(
                stage = "handshake",
                %id,
                topic = topic.as_str(),
                timeout_secs = self.inner.settings.confirm_timeout.as_secs(),
                "subscription was not confirmed in time"
            );
            self.inner.registry.remove(id).await;
        }
        Ok(SubscribeOutcome {
            id,
            success: confirmed,
        })
    }

    /// Sends an unsubscribe for `id`.
    ///
    /// Returns `true` once the hub accepted the request and, when waiting is
    /// enabled, confirmed it.
    pub async fn unsubscribe(&self, id: Uuid) -> Result<bool, WebhookError> {
        let record = self
            .inner
            .registry
            .get(id)
            .await
            .ok_or(WebhookError::UnknownSubscription(id))?;

        // Watch before sending so a fast confirmation finds a waiter and
        // leaves the record for this call to remove.
        let waiter = if self.inner.settings.wait_for_confirm {
            self.inner.registry.watch(id).await
        } else {
            None
        };

        let response = self.post_hub(HubMode::Unsubscribe, &record).await?;
        if !response.is_accepted() {
            return Ok(false);
        }
        self.inner.registry.mark_pending_unsubscribe(id).await;

        let Some(waiter) = waiter else {
            return Ok(!self.inner.settings.wait_for_confirm);
        };

        if self.await_state(waiter, SubscriptionState::Removed).await {
            self.inner.registry.remove(id).await;
            Ok(true)
        } else {
            warn!(
                stage = "handshake",
                %id,
                topic = record.topic.as_str(),
                "unsubscribe was not confirmed in time"
            );
            Ok(false)
        }
    }

    /// Re-sends the subscribe request for an existing record.
    pub async fn renew_subscription(&self, id: Uuid) -> Result<bool, WebhookError> {
        let record = self
            .inner
            .registry
            .get(id)
            .await
            .ok_or(WebhookError::UnknownSubscription(id))?;
        let response = self.post_hub(HubMode::Subscribe, &record).await?;
        Ok(response.is_accepted())
    }

    /// Adds another handler for notifications delivered to `id`.
    pub async fn add_handler<F>(&self, id: Uuid, handler: F) -> Result<(), WebhookError>
    where
        F: Fn(Uuid, &Payload) + Send + Sync + 'static,
    {
        if self.inner.registry.add_handler(id, Arc::new(handler)).await {
            Ok(())
        } else {
            Err(WebhookError::UnknownSubscription(id))
        }
    }

    pub async fn subscription(&self, id: Uuid) -> Option<SubscriptionRecord> {
        self.inner.registry.get(id).await
    }

    /// Unsubscribes every hub subscription whose callback points at this hook,
    /// including ones left over from earlier runs.
    ///
    /// Requires authenticated mode. Returns `true` when every request was
    /// accepted and, when waiting is enabled, every confirmation arrived.
    pub async fn unsubscribe_all(&self) -> Result<bool, WebhookError> {
        let token = self.access_token().await.ok_or_else(|| {
            WebhookError::AuthenticationRequired(
                "listing webhook subscriptions requires authenticated mode".to_string(),
            )
        })?;

        let mut listed = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .inner
                .hub
                .list_subscriptions(
                    &token,
                    &ListSubscriptionsParams {
                        first: LIST_PAGE_SIZE,
                        after: cursor.as_deref(),
                    },
                )
                .await?;
            let exhausted = page.data.is_empty();
            listed.extend(page.data);
            match page.cursor {
                Some(next) if !exhausted => cursor = Some(next),
                _ => break,
            }
        }

        let ours: Vec<_> = listed
            .into_iter()
            .filter(|sub| sub.callback.starts_with(&self.inner.settings.callback_url))
            .filter_map(|sub| sub.callback_uuid().map(|uuid| (uuid, sub)))
            .collect();
        info!(
            stage = "handshake",
            count = ours.len(),
            "unsubscribing all hub subscriptions for this callback"
        );

        let uuids: HashSet<String> = ours.iter().map(|(uuid, _)| uuid.clone()).collect();
        self.inner.sweep.begin(uuids.iter().cloned());

        let mut all_accepted = true;
        for (uuid, sub) in &ours {
            let request = HubRequest {
                callback: &sub.callback,
                mode: HubMode::Unsubscribe,
                topic: &sub.topic,
                lease_seconds: self.inner.settings.lease_seconds,
                secret: self.inner.settings.secret.as_deref(),
            };
            match self.send_hub(&request).await {
                Ok(response) if response.is_accepted() => {
                    if let Ok(id) = Uuid::parse_str(uuid) {
                        self.inner.registry.mark_pending_unsubscribe(id).await;
                    }
                }
                Ok(_) => {
                    all_accepted = false;
                    self.inner.sweep.confirm(uuid);
                }
                Err(err) => {
                    error!(stage = "handshake", %uuid, error = %err, "bulk unsubscribe request failed");
                    all_accepted = false;
                    self.inner.sweep.confirm(uuid);
                }
            }
        }

        let mut confirmed = true;
        if self.inner.settings.wait_for_confirm {
            confirmed = self.wait_for_sweep().await;
            if !confirmed {
                warn!(
                    stage = "handshake",
                    remaining = self.inner.sweep.remaining(),
                    "bulk unsubscribe left confirmations outstanding"
                );
            }
        }

        for uuid in &uuids {
            let Ok(id) = Uuid::parse_str(uuid) else {
                continue;
            };
            if self.inner.registry.state(id).await == Some(SubscriptionState::Removed) {
                self.inner.registry.remove(id).await;
            }
        }

        Ok(all_accepted && confirmed)
    }

    /// Binds the callback server and starts serving.
    pub async fn start(&self) -> Result<SocketAddr, WebhookError> {
        let settings = &self.inner.settings;
        settings.validate_lease()?;

        let mut server = self.inner.server.lock().await;
        if server.is_some() {
            return Err(WebhookError::AlreadyRunning);
        }

        let listener = TcpListener::bind(settings.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let router = app_router(self.app_state());

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(err) = result {
                error!(stage = "app", error = %err, "webhook server terminated");
            }
        });

        let renewal = settings.auto_renew.then(|| {
            let period = Duration::from_secs(settings.lease_seconds - RENEW_MARGIN_SECS);
            RenewalWorker::new(self.clone(), period).spawn()
        });

        info!(
            stage = "app",
            %local_addr,
            callback_url = %settings.callback_url,
            auto_renew = settings.auto_renew,
            "webhook server started"
        );
        *server = Some(ServerHandle {
            local_addr,
            shutdown,
            task,
            renewal,
        });
        Ok(local_addr)
    }

    /// Unsubscribes known records (when configured) and shuts the server down.
    ///
    /// Does nothing when the server is not running.
    pub async fn stop(&self) {
        // Held until the server task has exited so `start` cannot race a
        // server that is still shutting down.
        let mut server = self.inner.server.lock().await;
        match server.as_ref() {
            Some(handle) => {
                if let Some(renewal) = &handle.renewal {
                    renewal.abort();
                }
            }
            None => return,
        }

        if self.inner.settings.unsubscribe_on_stop {
            for id in self.inner.registry.ids().await {
                match self.unsubscribe(id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(stage = "app", %id, "unsubscribe during shutdown did not complete")
                    }
                    Err(err) => {
                        warn!(stage = "app", %id, error = %err, "unsubscribe during shutdown failed")
                    }
                }
            }
        }

        let Some(handle) = server.take() else {
            return;
        };
        let _ = handle.shutdown.send(());
        if let Err(err) = handle.task.await {
            error!(stage = "app", error = %err, "webhook server task panicked");
        }
        info!(stage = "app", local_addr = %handle.local_addr, "webhook server stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.inner.server.lock().await.is_some()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .server
            .lock()
            .await
            .as_ref()
            .map(|handle| handle.local_addr)
    }

    pub(crate) fn app_state(&self) -> AppState {
        AppState::new(
            self.inner.registry.clone(),
            self.inner.sweep.clone(),
            self.inner.settings.wait_for_confirm,
            self.inner
                .settings
                .secret
                .as_ref()
                .map(|secret| Arc::from(secret.as_bytes())),
            self.inner.metrics.clone(),
        )
    }

    async fn post_hub(
        &self,
        mode: HubMode,
        record: &SubscriptionRecord,
    ) -> Result<HubResponse, WebhookError> {
        let callback = format!(
            "{}{}",
            self.inner.settings.callback_url, record.callback_path
        );
        let request = HubRequest {
            callback: &callback,
            mode,
            topic: &record.topic_url,
            lease_seconds: self.inner.settings.lease_seconds,
            secret: self.inner.settings.secret.as_deref(),
        };
        let response = self.send_hub(&request).await?;
        if response.is_accepted() {
            debug!(
                stage = "handshake",
                id = %record.id,
                mode = mode.as_str(),
                topic = %record.topic_url,
                "hub accepted request"
            );
        }
        Ok(response)
    }

    async fn send_hub(&self, request: &HubRequest<'_>) -> Result<HubResponse, WebhookError> {
        let token = self.access_token().await;
        let mode = request.mode.as_str();
        let response = match self.inner.hub.send(request, token.as_deref()).await {
            Ok(response) => response,
            Err(err) => {
                counter!("hub_requests_total", "mode" => mode, "result" => "error").increment(1);
                return Err(err.into());
            }
        };

        if response.is_accepted() {
            counter!("hub_requests_total", "mode" => mode, "result" => "accepted").increment(1);
        } else {
            counter!("hub_requests_total", "mode" => mode, "result" => "rejected").increment(1);
            warn!(
                stage = "handshake",
                mode,
                status = response.status.as_u16(),
                body = %response.body,
                topic = request.topic,
                "hub rejected request"
            );
        }
        Ok(response)
    }

    async fn wait_for_state(&self, id: Uuid, target: SubscriptionState) -> bool {
        match self.inner.registry.watch(id).await {
            Some(rx) => self.await_state(rx, target).await,
            None => false,
        }
    }

    async fn await_state(
        &self,
        mut rx: watch::Receiver<SubscriptionState>,
        target: SubscriptionState,
    ) -> bool {
        // A removal only satisfies a wait that targets removal.
        timeout(self.inner.settings.confirm_timeout, async move {
            rx.wait_for(|state| {
                state.reached(target)
                    && (target == SubscriptionState::Removed
                        || *state != SubscriptionState::Removed)
            })
            .await
            .is_ok()
        })
        .await
        .unwrap_or(false)
    }

    async fn wait_for_sweep(&self) -> bool {
        let mut rx = self.inner.sweep.subscribe();
        timeout(self.inner.settings.confirm_timeout, async move {
            rx.wait_for(|pending| pending.is_empty()).await.is_ok()
        })
        .await
        .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, http::StatusCode};
    use httpmock::prelude::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;
    use url::Url;

    fn settings(server: &MockServer, wait: bool) -> HookSettings {
        let mut settings = HookSettings::new(
            "https://hook.example",
            "client-id",
            "127.0.0.1:0".parse().expect("addr"),
        )
        .expect("settings");
        settings.api_base_url = Url::parse(&server.url("/helix/")).expect("url");
        settings.wait_for_confirm = wait;
        settings.confirm_timeout = Duration::from_millis(300);
        settings.auto_renew = false;
        settings
    }

    async fn deliver_challenge(hook: &TwitchWebHook, mode: &str, id: Uuid) -> StatusCode {
        let uri = format!("/streams?hub.mode={mode}&hub.challenge=ch&uuid={id}");
        app_router(hook.app_state())
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .expect("router responds")
            .status()
    }

    async fn first_id(hook: &TwitchWebHook) -> Uuid {
        loop {
            if let Some(id) = hook.registry().ids().await.first() {
                return *id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn subscribe_without_wait_returns_after_accept() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/helix/webhooks/hub")
                    .x_www_form_urlencoded_tuple("hub.mode", "subscribe")
                    .x_www_form_urlencoded_tuple(
                        "hub.topic",
                        &server.url("/helix/streams?user_id=123"),
                    );
                then.status(202);
            })
            .await;

        let hook = TwitchWebHook::new(settings(&server, false)).expect("hook");
        let outcome = hook
            .subscribe_topic(
                Topic::StreamChanged,
                &[("user_id", "123".into())],
                BuildOptions::remove_none(),
                None,
            )
            .await
            .expect("subscribe");

        mock.assert_async().await;
        assert!(outcome.success);
        let record = hook.subscription(outcome.id).await.expect("record kept");
        assert_eq!(record.state, SubscriptionState::PendingSubscribe);
        assert_eq!(
            record.callback_path,
            format!("/streams?uuid={}", outcome.id)
        );
    }

    #[tokio::test]
    async fn subscribe_waits_for_confirmation() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/helix/webhooks/hub");
                then.status(202);
            })
            .await;

        let hook = TwitchWebHook::new(settings(&server, true)).expect("hook");
        let confirmer = hook.clone();
        let challenge = tokio::spawn(async move {
            let id = first_id(&confirmer).await;
            deliver_challenge(&confirmer, "subscribe", id).await
        });

        let outcome = hook
            .subscribe_topic(
                Topic::StreamChanged,
                &[("user_id", "123".into())],
                BuildOptions::remove_none(),
                None,
            )
            .await
            .expect("subscribe");

        assert_eq!(challenge.await.expect("challenge task"), StatusCode::OK);
        assert!(outcome.success);
        assert_eq!(
            hook.registry().state(outcome.id).await,
            Some(SubscriptionState::Active)
        );
    }

    #[tokio::test]
    async fn subscribe_timeout_drops_record() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/helix/webhooks/hub");
                then.status(202);
            })
            .await;

        let hook = TwitchWebHook::new(settings(&server, true)).expect("hook");
        let outcome = hook
            .subscribe_topic(
                Topic::StreamChanged,
                &[("user_id", "123".into())],
                BuildOptions::remove_none(),
                None,
            )
            .await
            .expect("subscribe");

        assert!(!outcome.success);
        assert!(hook.registry().is_empty().await);
    }

    #[tokio::test]
    async fn rejected_subscribe_is_not_an_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/helix/webhooks/hub");
                then.status(400).body("invalid topic");
            })
            .await;

        let hook = TwitchWebHook::new(settings(&server, true)).expect("hook");
        let outcome = hook
            .subscribe_topic(
                Topic::StreamChanged,
                &[("user_id", "123".into())],
                BuildOptions::remove_none(),
                None,
            )
            .await
            .expect("subscribe");

        assert!(!outcome.success);
        assert!(hook.registry().is_empty().await);
    }

    #[tokio::test]
    async fn authenticated_topic_needs_credentials() {
        let server = MockServer::start_async().await;
        let hook = TwitchWebHook::new(settings(&server, false)).expect("hook");

        let err = hook
            .subscribe_topic(
                Topic::ExtensionTransactionCreated,
                &[("extension_id", "ext".into()), ("first", 1u32.into())],
                BuildOptions::remove_none(),
                None,
            )
            .await
            .expect_err("auth required");
        assert!(matches!(err, WebhookError::AuthenticationRequired(_)));
        assert!(hook.registry().is_empty().await);
    }

    #[tokio::test]
    async fn authenticate_requires_https() {
        let server = MockServer::start_async().await;
        let mut plain = settings(&server, false);
        plain.callback_url = "http://hook.example".to_string();
        let hook = TwitchWebHook::new(plain).expect("hook");

        let err = hook
            .authenticate(Authentication::app("token"))
            .await
            .expect_err("https required");
        assert!(matches!(err, WebhookError::Configuration(_)));
        assert!(!hook.is_authenticated().await);
    }

    #[tokio::test]
    async fn authenticated_requests_carry_bearer() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/helix/webhooks/hub")
                    .header("Authorization", "Bearer rotated");
                then.status(202);
            })
            .await;

        let hook = TwitchWebHook::new(settings(&server, false)).expect("hook");
        hook.authenticate(Authentication::app("initial"))
            .await
            .expect("authenticate");
        hook.set_access_token("rotated").await.expect("rotate");

        let outcome = hook
            .subscribe_topic(
                Topic::ExtensionTransactionCreated,
                &[("extension_id", "ext".into()), ("first", 1u32.into())],
                BuildOptions::remove_none(),
                None,
            )
            .await
            .expect("subscribe");
        mock.assert_async().await;
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn unsubscribe_unknown_id_errors() {
        let server = MockServer::start_async().await;
        let hook = TwitchWebHook::new(settings(&server, false)).expect("hook");
        let id = Uuid::new_v4();

        assert!(matches!(
            hook.unsubscribe(id).await,
            Err(WebhookError::UnknownSubscription(found)) if found == id
        ));
        assert!(matches!(
            hook.renew_subscription(id).await,
            Err(WebhookError::UnknownSubscription(_))
        ));
        assert!(matches!(
            hook.add_handler(id, |_, _| {}).await,
            Err(WebhookError::UnknownSubscription(_))
        ));
    }

    #[tokio::test]
    async fn unsubscribe_waits_and_removes_record() {
        let server = MockServer::start_async().await;
        let unsubscribe = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/helix/webhooks/hub")
                    .x_www_form_urlencoded_tuple("hub.mode", "unsubscribe");
                then.status(202);
            })
            .await;

        let hook = TwitchWebHook::new(settings(&server, true)).expect("hook");
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();
        let handler: EventHandler = Arc::new(move |_: Uuid, _: &Payload| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let record = hook
            .registry()
            .create(
                Topic::StreamChanged,
                "https://api.twitch.tv/helix/streams?user_id=1".to_string(),
                Some(handler),
            )
            .await;
        hook.registry().mark_active(record.id).await;

        let confirmer = hook.clone();
        let id = record.id;
        let challenge = tokio::spawn(async move {
            loop {
                if confirmer.registry().state(id).await
                    == Some(SubscriptionState::PendingUnsubscribe)
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            deliver_challenge(&confirmer, "unsubscribe", id).await
        });

        assert!(hook.unsubscribe(id).await.expect("unsubscribe"));
        assert_eq!(challenge.await.expect("challenge task"), StatusCode::OK);
        unsubscribe.assert_async().await;
        assert!(hook.subscription(id).await.is_none());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejected_unsubscribe_keeps_record() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/helix/webhooks/hub");
                then.status(404);
            })
            .await;

        let hook = TwitchWebHook::new(settings(&server, true)).expect("hook");
        let id = hook
            .registry()
            .create(Topic::StreamChanged, "topic".to_string(), None)
            .await
            .id;
        hook.registry().mark_active(id).await;

        assert!(!hook.unsubscribe(id).await.expect("unsubscribe"));
        assert_eq!(
            hook.registry().state(id).await,
            Some(SubscriptionState::Active)
        );
    }

    #[tokio::test]
    async fn late_unsubscribe_confirmation_drops_record() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/helix/webhooks/hub")
                    .x_www_form_urlencoded_tuple("hub.mode", "unsubscribe");
                then.status(202);
            })
            .await;

        let mut settings = settings(&server, true);
        settings.confirm_timeout = Duration::from_millis(100);
        let hook = TwitchWebHook::new(settings).expect("hook");
        let id = hook
            .registry()
            .create(Topic::StreamChanged, "topic".to_string(), None)
            .await
            .id;
        hook.registry().mark_active(id).await;

        assert!(!hook.unsubscribe(id).await.expect("unsubscribe"));
        assert_eq!(
            hook.registry().state(id).await,
            Some(SubscriptionState::PendingUnsubscribe)
        );

        assert_eq!(
            deliver_challenge(&hook, "unsubscribe", id).await,
            StatusCode::OK
        );
        assert!(hook.subscription(id).await.is_none());
        assert_eq!(hook.registry().len().await, 0);
    }

    #[tokio::test]
    async fn unsubscribe_without_wait_returns_accept() {
        let server = MockServer::start_async().await;
        let unsubscribe = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/helix/webhooks/hub")
                    .x_www_form_urlencoded_tuple("hub.mode", "unsubscribe");
                then.status(202);
            })
            .await;

        let hook = TwitchWebHook::new(settings(&server, false)).expect("hook");
        let id = hook
            .registry()
            .create(Topic::UserChanged, "topic".to_string(), None)
            .await
            .id;
        hook.registry().mark_active(id).await;

        assert!(hook.unsubscribe(id).await.expect("unsubscribe"));
        unsubscribe.assert_async().await;
        let record = hook.subscription(id).await.expect("record kept");
        assert_eq!(record.state, SubscriptionState::PendingUnsubscribe);
        assert!(record.handlers.is_empty());

        assert_eq!(
            deliver_challenge(&hook, "unsubscribe", id).await,
            StatusCode::OK
        );
        assert!(hook.subscription(id).await.is_none());
    }

    #[tokio::test]
    async fn unsubscribe_all_sweeps_matching_callbacks() {
        let server = MockServer::start_async().await;
        let ours = Uuid::new_v4();
        let list = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/helix/webhooks/subscriptions")
                    .header("Authorization", "Bearer app-token");
                then.status(200).json_body(json!({
                    "total": 2,
                    "data": [
                        {
                            "topic": "https://api.twitch.tv/helix/streams?user_id=1",
                            "callback": format!("https://hook.example/streams?uuid={ours}"),
                            "expires_at": "2030-01-01T00:00:00Z"
                        },
                        {
                            "topic": "https://api.twitch.tv/helix/streams?user_id=2",
                            "callback": "https://elsewhere.example/streams?uuid=x",
                            "expires_at": "2030-01-01T00:00:00Z"
                        }
                    ],
                    "pagination": {}
                }));
            })
            .await;
        let unsubscribe = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/helix/webhooks/hub")
                    .x_www_form_urlencoded_tuple("hub.mode", "unsubscribe")
                    .x_www_form_urlencoded_tuple(
                        "hub.callback",
                        &format!("https://hook.example/streams?uuid={ours}"),
                    );
                then.status(202);
            })
            .await;

        let hook = TwitchWebHook::new(settings(&server, false)).expect("hook");
        hook.authenticate(Authentication::app("app-token"))
            .await
            .expect("authenticate");

        assert!(hook.unsubscribe_all().await.expect("sweep"));
        list.assert_async().await;
        unsubscribe.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn unsubscribe_all_requires_authentication() {
        let server = MockServer::start_async().await;
        let hook = TwitchWebHook::new(settings(&server, false)).expect("hook");
        assert!(matches!(
            hook.unsubscribe_all().await,
            Err(WebhookError::AuthenticationRequired(_))
        ));
    }

    #[tokio::test]
    async fn start_and_stop_server() {
        let server = MockServer::start_async().await;
        let mut settings = settings(&server, false);
        settings.unsubscribe_on_stop = false;
        let hook = TwitchWebHook::new(settings).expect("hook");

        let addr = hook.start().await.expect("start");
        assert!(matches!(
            hook.start().await,
            Err(WebhookError::AlreadyRunning)
        ));
        assert_eq!(hook.local_addr().await, Some(addr));

        let body = reqwest::get(format!("http://{addr}/"))
            .await
            .expect("request")
            .text()
            .await
            .expect("body");
        assert_eq!(body, "twitch webhook");

        hook.stop().await;
        assert!(!hook.is_running().await);
        hook.stop().await;
    }

    #[tokio::test]
    async fn start_waits_for_stop_to_finish() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/helix/webhooks/hub")
                    .x_www_form_urlencoded_tuple("hub.mode", "unsubscribe");
                then.status(202).delay(Duration::from_millis(200));
            })
            .await;
        let hook = TwitchWebHook::new(settings(&server, false)).expect("hook");
        let addr = hook.start().await.expect("start");
        hook.registry()
            .create(Topic::StreamChanged, "topic".to_string(), None)
            .await;

        let stopper = hook.clone();
        let stopping = tokio::spawn(async move { stopper.stop().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let old_body = reqwest::get(format!("http://{addr}/"))
            .await
            .expect("old server still serving")
            .text()
            .await
            .expect("body");
        assert_eq!(old_body, "twitch webhook");

        hook.start().await.expect("restart");
        assert!(stopping.is_finished());
        assert!(hook.is_running().await);

        hook.stop().await;
        assert!(!hook.is_running().await);
    }

    #[tokio::test]
    async fn start_rejects_invalid_lease() {
        let server = MockServer::start_async().await;
        let mut settings = settings(&server, false);
        settings.lease_seconds = 10;
        let hook = TwitchWebHook::new(settings).expect("hook");
        assert!(matches!(
            hook.start().await,
            Err(WebhookError::Configuration(_))
        ));
    }
}
