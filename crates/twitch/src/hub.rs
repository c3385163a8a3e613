use chrono::{DateTime, Utc};
use reqwest::{Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;
use url::Url;

/// Client for the Helix WebSub hub (`webhooks/hub`) and its listing endpoint.
#[derive(Clone)]
pub struct HubClient {
    http: Client,
    base_url: Url,
    client_id: String,
}

impl HubClient {
    /// Creates a new hub client rooted at the Helix base URL.
    pub fn new(client_id: impl Into<String>, base_url: Url, http: Client) -> Self {
        Self {
            http,
            base_url,
            client_id: client_id.into(),
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Posts a subscribe or unsubscribe request to the hub.
    ///
    /// The hub answers `202 Accepted` when it will go on to verify the
    /// callback; every status is returned so the caller decides.
    pub async fn send(
        &self,
        request: &HubRequest<'_>,
        access_token: Option<&str>,
    ) -> Result<HubResponse, HubError> {
        let url = self.base_url.join("webhooks/hub")?;
        let lease = request.lease_seconds.to_string();
        let mut form = vec![
            ("hub.callback", request.callback),
            ("hub.mode", request.mode.as_str()),
            ("hub.topic", request.topic),
            ("hub.lease_seconds", lease.as_str()),
        ];
        if let Some(secret) = request.secret {
            form.push(("hub.secret", secret));
        }

        let response = self
            .request(Method::POST, url, access_token)
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        Ok(HubResponse { status, body })
    }

    /// Lists webhook subscriptions owned by the authenticated client.
    pub async fn list_subscriptions(
        &self,
        access_token: &str,
        params: &ListSubscriptionsParams<'_>,
    ) -> Result<WebhookSubscriptionPage, HubError> {
        let mut url = self.base_url.join("webhooks/subscriptions")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("first", &params.first.to_string());
            if let Some(after) = params.after {
                query.append_pair("after", after);
            }
        }

        let response = self
            .request(Method::GET, url, Some(access_token))
            .send()
            .await?;

        parse_json::<WebhookSubscriptionListResponse>(response)
            .await
            .map(WebhookSubscriptionPage::from)
    }

    fn request(
        &self,
        method: Method,
        url: Url,
        access_token: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let builder = self
            .http
            .request(method, url)
            .header("Client-ID", &self.client_id);
        match access_token {
            Some(token) => builder.header("Authorization", format!("Bearer {token}")),
            None => builder,
        }
    }
}

/// Hub verb carried in `hub.mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubMode {
    Subscribe,
    Unsubscribe,
}

impl HubMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

/// Form parameters for a hub request.
pub struct HubRequest<'a> {
    pub callback: &'a str,
    pub mode: HubMode,
    pub topic: &'a str,
    pub lease_seconds: u64,
    pub secret: Option<&'a str>,
}

/// Status and body returned by the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubResponse {
    pub status: StatusCode,
    pub body: String,
}

impl HubResponse {
    pub fn is_accepted(&self) -> bool {
        self.status == StatusCode::ACCEPTED
    }
}

/// Parameters when listing webhook subscriptions.
pub struct ListSubscriptionsParams<'a> {
    pub first: u32,
    pub after: Option<&'a str>,
}

/// Page of webhook subscriptions.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookSubscriptionPage {
    pub data: Vec<WebhookSubscription>,
    pub cursor: Option<String>,
}

impl From<WebhookSubscriptionListResponse> for WebhookSubscriptionPage {
    fn from(value: WebhookSubscriptionListResponse) -> Self {
        Self {
            data: value.data,
            cursor: value
                .pagination
                .and_then(|p| p.cursor)
                .filter(|cursor| !cursor.is_empty()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct WebhookSubscriptionListResponse {
    data: Vec<WebhookSubscription>,
    pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Deserialize)]
struct Pagination {
    cursor: Option<String>,
}

/// A subscription as reported by the hub.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct WebhookSubscription {
    pub topic: String,
    pub callback: String,
    pub expires_at: DateTime<Utc>,
}

impl WebhookSubscription {
    /// Returns the `uuid` query parameter of the callback URL, if any.
    pub fn callback_uuid(&self) -> Option<String> {
        let url = Url::parse(&self.callback).ok()?;
        url.query_pairs()
            .find(|(key, _)| key == "uuid")
            .map(|(_, value)| value.into_owned())
    }
}

/// Errors produced by the hub client.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

async fn parse_json<T>(response: Response) -> Result<T, HubError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(HubError::Status { status, body });
    }

    Ok(response.json().await?)
}
