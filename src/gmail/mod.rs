//! Google OAuth and Gmail API access.
//!
//! [`OAuthProvider`] and [`MailProvider`] are the seams the rest of the crate
//! talks to; [`GoogleClient`] implements both over HTTPS.

use async_trait::async_trait;
use thiserror::Error;

use crate::credentials::OAuthClientCredentials;

pub mod client;
pub mod types;

pub use client::GoogleClient;
pub use types::GmailMessage;

/// Scopes requested on the consent screen.
pub const GMAIL_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/gmail.readonly",
    "https://www.googleapis.com/auth/gmail.send",
    "https://www.googleapis.com/auth/userinfo.email",
];

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("provider returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("rate limited after {0} retries")]
    RateLimited(usize),

    #[error("decode provider response: {0}")]
    Decode(String),

    #[error("invalid provider configuration: {0}")]
    Config(String),
}

/// Result of a code exchange or refresh-token grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: u64,
}

#[async_trait]
pub trait OAuthProvider: Send + Sync {
    /// Consent URL for the given client; `state` round-trips to the callback.
    fn authorize_url(
        &self,
        credentials: &OAuthClientCredentials,
        state: &str,
    ) -> Result<String, ProviderError>;

    async fn exchange_code(
        &self,
        credentials: &OAuthClientCredentials,
        code: &str,
    ) -> Result<TokenGrant, ProviderError>;

    async fn refresh_access_token(
        &self,
        credentials: &OAuthClientCredentials,
        refresh_token: &str,
    ) -> Result<TokenGrant, ProviderError>;
}

#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Message ids matching a Gmail search query, newest first.
    async fn list_message_ids(
        &self,
        access_token: &str,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<String>, ProviderError>;

    async fn get_message(
        &self,
        access_token: &str,
        message_id: &str,
    ) -> Result<GmailMessage, ProviderError>;

    /// Mailbox address the access token belongs to.
    async fn profile_email(&self, access_token: &str) -> Result<String, ProviderError>;
}
