//! OAuth token lifecycle: near-expiry detection, refresh, demotion to
//! `invalid`, and the authorization-code entry point that creates tokens.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::Pacing;
use crate::credentials::CredentialResolver;
use crate::db::models::{OAuthToken, TokenStatus};
use crate::db::{AuthorizedToken, Database, DbError};
use crate::gmail::{MailProvider, OAuthProvider, ProviderError};

/// Tokens expiring sooner than this are refreshed before use.
pub const REFRESH_MARGIN_MINUTES: i64 = 5;
pub const REFRESH_BATCH_SIZE: usize = 5;
/// Longest access-token lifetime accepted from a grant.
pub const MAX_GRANT_LIFETIME_SECS: i64 = 24 * 60 * 60;

pub fn needs_refresh(expires_at: DateTime<Utc>) -> bool {
    needs_refresh_at(expires_at, Utc::now())
}

pub fn needs_refresh_at(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    expires_at - now < Duration::minutes(REFRESH_MARGIN_MINUTES)
}

/// Expiry for a grant issued at `now`. `expires_in` is capped at
/// [`MAX_GRANT_LIFETIME_SECS`]; `None` if the result is not representable.
pub fn grant_expiry(expires_in: u64, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(expires_in)
        .unwrap_or(i64::MAX)
        .min(MAX_GRANT_LIFETIME_SECS);
    now.checked_add_signed(Duration::seconds(secs))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    pub success: usize,
    pub failed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReauthAccount {
    pub user_id: String,
    pub email: String,
    pub status: TokenStatus,
    pub last_failed_at: Option<DateTime<Utc>>,
}

pub struct TokenRefresher {
    db: Arc<Database>,
    resolver: Arc<CredentialResolver>,
    oauth: Arc<dyn OAuthProvider>,
    pacing: Pacing,
}

impl TokenRefresher {
    pub fn new(
        db: Arc<Database>,
        resolver: Arc<CredentialResolver>,
        oauth: Arc<dyn OAuthProvider>,
        pacing: Pacing,
    ) -> Self {
        Self {
            db,
            resolver,
            oauth,
            pacing,
        }
    }

    /// Refresh one token. On any failure the token is marked `invalid` and
    /// `false` is returned; nothing is retried here.
    pub async fn refresh_token(&self, token: &OAuthToken) -> bool {
        let Some(refresh_token) = token.refresh_token.as_deref().filter(|t| !t.is_empty()) else {
            warn!(token_id = token.id, user_id = %token.user_id, "token has no refresh token");
            self.demote(token);
            return false;
        };

        let credentials = self.resolver.resolve_oauth_client(&token.user_id);
        let grant = match self
            .oauth
            .refresh_access_token(&credentials, refresh_token)
            .await
        {
            Ok(grant) => grant,
            Err(error) => {
                warn!(
                    token_id = token.id,
                    user_id = %token.user_id,
                    "token refresh failed: {error}"
                );
                self.demote(token);
                return false;
            }
        };

        let Some(expires_at) = grant_expiry(grant.expires_in, Utc::now()) else {
            warn!(
                token_id = token.id,
                expires_in = grant.expires_in,
                "token refresh returned an unusable lifetime"
            );
            return false;
        };
        match self.db.record_refresh_success(
            token.id,
            &grant.access_token,
            grant.refresh_token.as_deref(),
            expires_at,
        ) {
            Ok(()) => {
                debug!(token_id = token.id, user_id = %token.user_id, %expires_at, "token refreshed");
                true
            }
            Err(error) => {
                error!(token_id = token.id, "persist refreshed token: {error}");
                false
            }
        }
    }

    fn demote(&self, token: &OAuthToken) {
        if let Err(error) = self.db.mark_token_invalid(token.id, Utc::now()) {
            error!(token_id = token.id, "mark token invalid: {error}");
        }
    }

    /// Active tokens inside the refresh margin, read fresh on every call.
    pub fn tokens_needing_refresh(&self) -> Result<Vec<OAuthToken>, DbError> {
        let now = Utc::now();
        Ok(self
            .db
            .tokens_with_status(TokenStatus::Active)?
            .into_iter()
            .filter(|token| needs_refresh_at(token.expires_at, now))
            .collect())
    }

    pub async fn refresh_all_tokens(&self) -> Result<RefreshSummary> {
        let tokens = self
            .tokens_needing_refresh()
            .context("load tokens needing refresh")?;
        let mut summary = RefreshSummary {
            total: tokens.len(),
            ..RefreshSummary::default()
        };
        if tokens.is_empty() {
            debug!("no tokens need refresh");
            return Ok(summary);
        }

        info!(total = tokens.len(), "refreshing expiring tokens");
        let batches: Vec<&[OAuthToken]> = tokens.chunks(REFRESH_BATCH_SIZE).collect();
        let batch_count = batches.len();
        for (index, batch) in batches.into_iter().enumerate() {
            let results = join_all(batch.iter().map(|token| self.refresh_token(token))).await;
            for refreshed in results {
                if refreshed {
                    summary.success += 1;
                } else {
                    summary.failed += 1;
                }
            }

            if index + 1 < batch_count && !self.pacing.refresh_batch_pause.is_zero() {
                sleep(self.pacing.refresh_batch_pause).await;
            }
        }

        info!(
            success = summary.success,
            failed = summary.failed,
            total = summary.total,
            "token refresh pass complete"
        );
        Ok(summary)
    }

    /// The user's active token, refreshed inline if it is about to expire.
    pub async fn valid_token_for_user(&self, user_id: &str) -> Option<OAuthToken> {
        let token = match self.db.active_token_for_user(user_id) {
            Ok(Some(token)) => token,
            Ok(None) => {
                debug!(user_id, "no active gmail token");
                return None;
            }
            Err(error) => {
                error!(user_id, "load active token: {error}");
                return None;
            }
        };

        if !needs_refresh(token.expires_at) {
            return Some(token);
        }

        if !self.refresh_token(&token).await {
            return None;
        }

        match self.db.get_token(token.id) {
            Ok(refreshed) => refreshed,
            Err(error) => {
                error!(user_id, "reload refreshed token: {error}");
                None
            }
        }
    }

    pub async fn validate_token_for_user(&self, user_id: &str) -> bool {
        self.valid_token_for_user(user_id).await.is_some()
    }

    pub fn accounts_needing_reauth(&self) -> Result<Vec<ReauthAccount>, DbError> {
        Ok(self
            .db
            .tokens_with_status(TokenStatus::Invalid)?
            .into_iter()
            .map(|token| ReauthAccount {
                user_id: token.user_id,
                email: token.email,
                status: token.status,
                last_failed_at: token.last_failed_at,
            })
            .collect())
    }

    /// Consent URL for `user_id`, built from that user's resolved OAuth client.
    pub fn authorization_url(&self, user_id: &str) -> Result<String, ProviderError> {
        let credentials = self.resolver.resolve_oauth_client(user_id);
        if credentials.client_id.is_empty() {
            return Err(ProviderError::Config(
                "no oauth client id configured".to_string(),
            ));
        }
        self.oauth.authorize_url(&credentials, user_id)
    }

    /// Exchange an authorization code and store the resulting active token.
    pub async fn complete_authorization(
        &self,
        user_id: &str,
        code: &str,
        mail: &dyn MailProvider,
    ) -> Result<OAuthToken> {
        let credentials = self.resolver.resolve_oauth_client(user_id);
        let grant = self
            .oauth
            .exchange_code(&credentials, code)
            .await
            .context("exchange oauth authorization code")?;

        let email = mail
            .profile_email(&grant.access_token)
            .await
            .context("read gmail profile for new token")?;

        let refresh_token = match grant.refresh_token {
            Some(token) => token,
            None => self
                .db
                .tokens_with_status(TokenStatus::Active)?
                .into_iter()
                .chain(self.db.tokens_with_status(TokenStatus::Invalid)?)
                .find(|token| token.user_id == user_id && token.email == email)
                .and_then(|token| token.refresh_token)
                .ok_or_else(|| anyhow!("google returned no refresh token for {email}"))?,
        };

        let expires_at = grant_expiry(grant.expires_in, Utc::now())
            .ok_or_else(|| anyhow!("unusable token lifetime: {}s", grant.expires_in))?;
        let token = self.db.upsert_authorized_token(&AuthorizedToken {
            user_id: user_id.to_string(),
            email,
            access_token: grant.access_token,
            refresh_token,
            expires_at,
        })?;
        info!(user_id, email = %token.email, "gmail account authorized");
        Ok(token)
    }
}
