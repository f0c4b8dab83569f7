use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use tokio::time::sleep;

use super::types::{GmailMessageList, GmailProfile};
use super::{GmailMessage, MailProvider, OAuthProvider, ProviderError, TokenGrant, GMAIL_SCOPES};
use crate::config::AppConfig;
use crate::credentials::OAuthClientCredentials;

const MAX_RATE_LIMIT_RETRIES: usize = 3;
const MAX_BACKOFF_SECONDS: u64 = 16;
const REDACTED_BODY_MAX_LEN: usize = 200;

#[derive(Debug, Clone, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

/// HTTPS client for the Google token endpoint and the Gmail REST API.
#[derive(Debug, Clone)]
pub struct GoogleClient {
    client: Client,
    token_url: String,
    auth_url: String,
    api_base: String,
}

impl GoogleClient {
    pub fn new(
        token_url: impl Into<String>,
        auth_url: impl Into<String>,
        api_base: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            token_url: token_url.into(),
            auth_url: auth_url.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, ProviderError> {
        Self::new(
            config.token_url.clone(),
            config.auth_url.clone(),
            config.gmail_api_base.clone(),
            config.request_timeout(),
        )
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenGrant, ProviderError> {
        let response = self.client.post(&self.token_url).form(form).send().await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body: redact_response_body(&body),
            });
        }

        let payload: OAuthTokenResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::Decode(format!("oauth token response: {e}")))?;
        Ok(TokenGrant {
            access_token: payload.access_token,
            refresh_token: payload.refresh_token.filter(|t| !t.is_empty()),
            expires_in: payload.expires_in.unwrap_or(3600),
        })
    }

    /// GET with bounded back-off on 429 responses, honouring `Retry-After`.
    async fn fetch_with_retry(&self, token: &str, url: Url) -> Result<String, ProviderError> {
        let mut backoff_seconds = 1u64;

        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            let response = self
                .client
                .get(url.clone())
                .bearer_auth(token)
                .header("accept", "application/json")
                .send()
                .await?;

            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                if attempt == MAX_RATE_LIMIT_RETRIES {
                    break;
                }

                let retry_after_seconds = response
                    .headers()
                    .get("retry-after")
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(backoff_seconds);

                sleep(Duration::from_secs(retry_after_seconds)).await;
                backoff_seconds = (backoff_seconds * 2).min(MAX_BACKOFF_SECONDS);
                continue;
            }

            let status = response.status();
            let body = response.text().await?;
            if !status.is_success() {
                return Err(ProviderError::Status {
                    status: status.as_u16(),
                    body: redact_response_body(&body),
                });
            }

            return Ok(body);
        }

        Err(ProviderError::RateLimited(MAX_RATE_LIMIT_RETRIES))
    }

    fn api_url(&self, path: &str) -> Result<Url, ProviderError> {
        Url::parse(&format!("{}/{}", self.api_base, path.trim_start_matches('/')))
            .map_err(|e| ProviderError::Config(format!("gmail api url: {e}")))
    }
}

#[async_trait]
impl OAuthProvider for GoogleClient {
    fn authorize_url(
        &self,
        credentials: &OAuthClientCredentials,
        state: &str,
    ) -> Result<String, ProviderError> {
        let scope = GMAIL_SCOPES.join(" ");
        let url = Url::parse_with_params(
            &self.auth_url,
            &[
                ("client_id", credentials.client_id.as_str()),
                ("redirect_uri", credentials.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", scope.as_str()),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("state", state),
            ],
        )
        .map_err(|e| ProviderError::Config(format!("oauth authorize url: {e}")))?;
        Ok(url.to_string())
    }

    async fn exchange_code(
        &self,
        credentials: &OAuthClientCredentials,
        code: &str,
    ) -> Result<TokenGrant, ProviderError> {
        self.token_request(&[
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
            ("redirect_uri", credentials.redirect_uri.as_str()),
            ("code", code),
            ("grant_type", "authorization_code"),
        ])
        .await
    }

    async fn refresh_access_token(
        &self,
        credentials: &OAuthClientCredentials,
        refresh_token: &str,
    ) -> Result<TokenGrant, ProviderError> {
        self.token_request(&[
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ])
        .await
    }
}

#[async_trait]
impl MailProvider for GoogleClient {
    async fn list_message_ids(
        &self,
        access_token: &str,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<String>, ProviderError> {
        let mut url = self.api_url("users/me/messages")?;
        url.query_pairs_mut()
            .append_pair("q", query)
            .append_pair("maxResults", &max_results.to_string());

        let body = self.fetch_with_retry(access_token, url).await?;
        let list: GmailMessageList = serde_json::from_str(&body)
            .map_err(|e| ProviderError::Decode(format!("gmail message list: {e}")))?;
        Ok(list
            .messages
            .unwrap_or_default()
            .into_iter()
            .map(|stub| stub.id)
            .collect())
    }

    async fn get_message(
        &self,
        access_token: &str,
        message_id: &str,
    ) -> Result<GmailMessage, ProviderError> {
        let mut url = self.api_url(&format!("users/me/messages/{message_id}"))?;
        url.query_pairs_mut().append_pair("format", "full");

        let body = self.fetch_with_retry(access_token, url).await?;
        serde_json::from_str(&body)
            .map_err(|e| ProviderError::Decode(format!("gmail message {message_id}: {e}")))
    }

    async fn profile_email(&self, access_token: &str) -> Result<String, ProviderError> {
        let url = self.api_url("users/me/profile")?;
        let body = self.fetch_with_retry(access_token, url).await?;
        let profile: GmailProfile = serde_json::from_str(&body)
            .map_err(|e| ProviderError::Decode(format!("gmail profile: {e}")))?;
        Ok(profile.email_address)
    }
}

pub(crate) fn redact_response_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= REDACTED_BODY_MAX_LEN {
        trimmed.to_string()
    } else {
        let mut cut = REDACTED_BODY_MAX_LEN;
        while !trimmed.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…[truncated {} bytes]", &trimmed[..cut], trimmed.len())
    }
}
