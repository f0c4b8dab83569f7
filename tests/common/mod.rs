#![allow(dead_code)]

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;
use tokio::time::Instant;
use uuid::Uuid;

use gmail_sync::config::Pacing;
use gmail_sync::credentials::{CredentialResolver, OAuthClientCredentials};
use gmail_sync::db::models::{EmailDirection, NewEmail, OAuthToken};
use gmail_sync::db::{AuthorizedToken, Database};
use gmail_sync::gmail::{GmailMessage, MailProvider, OAuthProvider, ProviderError, TokenGrant};
use gmail_sync::inbound::InboundSyncEngine;
use gmail_sync::scheduler::MailJobs;
use gmail_sync::server::AppState;
use gmail_sync::tokens::TokenRefresher;

pub const PLATFORM_CLIENT_ID: &str = "platform-client";

pub fn platform_credentials() -> OAuthClientCredentials {
    OAuthClientCredentials {
        client_id: PLATFORM_CLIENT_ID.to_string(),
        client_secret: "platform-secret".to_string(),
        redirect_uri: "https://app.example.com/auth/gmail/callback".to_string(),
    }
}

/// Records when calls start and how many overlap.
#[derive(Default)]
pub struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
    starts: Mutex<Vec<Instant>>,
}

impl InFlight {
    /// Hold a call open for `latency`, counting it while it is pending.
    pub async fn track(&self, latency: Option<StdDuration>) {
        self.starts.lock().expect("starts lock").push(Instant::now());
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Start offsets from `origin` in milliseconds, ascending.
    pub fn start_offsets_ms(&self, origin: Instant) -> Vec<u128> {
        let mut offsets: Vec<u128> = self
            .starts
            .lock()
            .expect("starts lock")
            .iter()
            .map(|start| start.duration_since(origin).as_millis())
            .collect();
        offsets.sort_unstable();
        offsets
    }
}

/// In-memory token endpoint. Refresh tokens registered with
/// [`FakeOAuth::revoke`] fail with `invalid_grant`.
#[derive(Default)]
pub struct FakeOAuth {
    revoked: Mutex<HashSet<String>>,
    issued: AtomicUsize,
    lifetime: Mutex<Option<u64>>,
    latency: Mutex<Option<StdDuration>>,
    pub refresh_calls: AtomicUsize,
    pub client_ids: Mutex<Vec<String>>,
    pub in_flight: InFlight,
}

impl FakeOAuth {
    /// `expires_in` reported by every later grant.
    pub fn set_lifetime(&self, expires_in: u64) {
        *self.lifetime.lock().expect("lifetime lock") = Some(expires_in);
    }

    pub fn set_latency(&self, latency: StdDuration) {
        *self.latency.lock().expect("latency lock") = Some(latency);
    }

    fn grant_lifetime(&self) -> u64 {
        self.lifetime.lock().expect("lifetime lock").unwrap_or(3600)
    }

    pub fn revoke(&self, refresh_token: &str) {
        self.revoked
            .lock()
            .expect("revoked lock")
            .insert(refresh_token.to_string());
    }

    pub fn refresh_count(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    fn next_access_token(&self) -> String {
        format!("ya29.issued-{}", self.issued.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl OAuthProvider for FakeOAuth {
    fn authorize_url(
        &self,
        credentials: &OAuthClientCredentials,
        state: &str,
    ) -> Result<String, ProviderError> {
        Ok(format!(
            "https://accounts.example.test/auth?client_id={}&state={state}",
            credentials.client_id
        ))
    }

    async fn exchange_code(
        &self,
        credentials: &OAuthClientCredentials,
        code: &str,
    ) -> Result<TokenGrant, ProviderError> {
        self.client_ids
            .lock()
            .expect("client ids lock")
            .push(credentials.client_id.clone());
        match code {
            "bad-code" => Err(ProviderError::Status {
                status: 400,
                body: r#"{"error":"invalid_grant"}"#.to_string(),
            }),
            "no-refresh" => Ok(TokenGrant {
                access_token: self.next_access_token(),
                refresh_token: None,
                expires_in: self.grant_lifetime(),
            }),
            _ => Ok(TokenGrant {
                access_token: self.next_access_token(),
                refresh_token: Some(format!("1//from-{code}")),
                expires_in: self.grant_lifetime(),
            }),
        }
    }

    async fn refresh_access_token(
        &self,
        credentials: &OAuthClientCredentials,
        refresh_token: &str,
    ) -> Result<TokenGrant, ProviderError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock().expect("latency lock");
        self.in_flight.track(latency).await;
        self.client_ids
            .lock()
            .expect("client ids lock")
            .push(credentials.client_id.clone());
        if self
            .revoked
            .lock()
            .expect("revoked lock")
            .contains(refresh_token)
        {
            return Err(ProviderError::Status {
                status: 400,
                body: r#"{"error":"invalid_grant","error_description":"Token has been expired or revoked."}"#
                    .to_string(),
            });
        }
        Ok(TokenGrant {
            access_token: self.next_access_token(),
            refresh_token: None,
            expires_in: self.grant_lifetime(),
        })
    }
}

/// In-memory mailbox shared by every access token.
pub struct FakeMail {
    messages: Mutex<Vec<GmailMessage>>,
    broken: Mutex<HashSet<String>>,
    latency: Mutex<Option<StdDuration>>,
    pub queries: Mutex<Vec<String>>,
    pub fetches: AtomicUsize,
    pub profile: String,
    pub listings: InFlight,
}

impl Default for FakeMail {
    fn default() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            broken: Mutex::new(HashSet::new()),
            latency: Mutex::new(None),
            queries: Mutex::new(Vec::new()),
            fetches: AtomicUsize::new(0),
            profile: "creator@gmail.com".to_string(),
            listings: InFlight::default(),
        }
    }
}

impl FakeMail {
    pub fn add(&self, message: GmailMessage) {
        self.messages.lock().expect("messages lock").push(message);
    }

    /// Make fetching this message id fail.
    pub fn break_message(&self, id: &str) {
        self.broken
            .lock()
            .expect("broken lock")
            .insert(id.to_string());
    }

    /// Delay applied to every inbox listing.
    pub fn set_latency(&self, latency: StdDuration) {
        *self.latency.lock().expect("latency lock") = Some(latency);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn recorded_queries(&self) -> Vec<String> {
        self.queries.lock().expect("queries lock").clone()
    }
}

#[async_trait]
impl MailProvider for FakeMail {
    async fn list_message_ids(
        &self,
        _access_token: &str,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<String>, ProviderError> {
        self.queries
            .lock()
            .expect("queries lock")
            .push(query.to_string());
        let latency = *self.latency.lock().expect("latency lock");
        self.listings.track(latency).await;
        Ok(self
            .messages
            .lock()
            .expect("messages lock")
            .iter()
            .take(max_results)
            .map(|message| message.id.clone())
            .collect())
    }

    async fn get_message(
        &self,
        _access_token: &str,
        message_id: &str,
    ) -> Result<GmailMessage, ProviderError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.broken.lock().expect("broken lock").contains(message_id) {
            return Err(ProviderError::Status {
                status: 500,
                body: "backend error".to_string(),
            });
        }
        self.messages
            .lock()
            .expect("messages lock")
            .iter()
            .find(|message| message.id == message_id)
            .cloned()
            .ok_or_else(|| ProviderError::Status {
                status: 404,
                body: "not found".to_string(),
            })
    }

    async fn profile_email(&self, _access_token: &str) -> Result<String, ProviderError> {
        Ok(self.profile.clone())
    }
}

/// Gmail `format=full` message with a single text/plain body.
pub fn plain_message(id: &str, from: &str, subject: &str, body: &str) -> GmailMessage {
    message_with_payload(
        id,
        from,
        subject,
        json!({
            "mimeType": "text/plain",
            "body": { "data": encode(body) }
        }),
    )
}

pub fn message_with_payload(
    id: &str,
    from: &str,
    subject: &str,
    mut payload: serde_json::Value,
) -> GmailMessage {
    payload["headers"] = json!([
        { "name": "From", "value": from },
        { "name": "To", "value": "Creator <creator@gmail.com>" },
        { "name": "Subject", "value": subject },
        { "name": "Date", "value": "Tue, 3 Mar 2026 10:15:00 +0000" }
    ]);
    serde_json::from_value(json!({
        "id": id,
        "threadId": format!("gmail-thread-{id}"),
        "labelIds": ["INBOX"],
        "payload": payload,
        "internalDate": "1772532900000"
    }))
    .expect("build gmail message")
}

pub fn encode(text: &str) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    URL_SAFE_NO_PAD.encode(text.as_bytes())
}

/// A temp database wired to fake Google services, removed on drop.
pub struct Harness {
    pub path: PathBuf,
    pub db: Arc<Database>,
    pub oauth: Arc<FakeOAuth>,
    pub mail: Arc<FakeMail>,
    pub tokens: Arc<TokenRefresher>,
    pub engine: Arc<InboundSyncEngine>,
    pub pacing: Pacing,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_pacing(Pacing::none())
    }

    pub fn with_pacing(pacing: Pacing) -> Self {
        let path = std::env::temp_dir().join(format!("gmail-sync-it-{}.db", Uuid::new_v4()));
        let db = Arc::new(Database::open(&path).expect("open test database"));
        let oauth = Arc::new(FakeOAuth::default());
        let mail = Arc::new(FakeMail::default());

        let resolver = Arc::new(CredentialResolver::new(
            Arc::clone(&db),
            platform_credentials(),
        ));
        let tokens = Arc::new(TokenRefresher::new(
            Arc::clone(&db),
            resolver,
            oauth.clone(),
            pacing,
        ));
        let engine = Arc::new(InboundSyncEngine::new(
            Arc::clone(&db),
            Arc::clone(&tokens),
            mail.clone(),
            pacing,
        ));

        Self {
            path,
            db,
            oauth,
            mail,
            tokens,
            engine,
            pacing,
        }
    }

    /// Active token for `user_id` expiring `expires_in` from now.
    pub fn seed_token(&self, user_id: &str, expires_in: Duration) -> OAuthToken {
        self.db
            .upsert_authorized_token(&AuthorizedToken {
                user_id: user_id.to_string(),
                email: format!("{user_id}@gmail.com"),
                access_token: format!("ya29.initial-{user_id}"),
                refresh_token: format!("1//refresh-{user_id}"),
                expires_at: Utc::now() + expires_in,
            })
            .expect("seed token")
    }

    pub fn seed_sent(&self, user_id: &str, to: &str, subject: &str, thread_id: &str) {
        self.db
            .insert_email(&NewEmail {
                user_id: user_id.to_string(),
                message_id: format!("sent-{}", Uuid::new_v4()),
                thread_id: Some(thread_id.to_string()),
                direction: EmailDirection::Sent,
                from_address: format!("{user_id}@gmail.com"),
                to_address: to.to_string(),
                subject: subject.to_string(),
                body: "Hi there".to_string(),
                timestamp: Utc::now() - Duration::days(1),
            })
            .expect("seed sent email");
    }

    pub fn jobs(&self, hours_back: u32) -> MailJobs {
        MailJobs::new(
            Arc::clone(&self.db),
            Arc::clone(&self.tokens),
            Arc::clone(&self.engine),
            self.pacing,
            hours_back,
        )
    }

    pub fn app_state(&self) -> Arc<AppState> {
        Arc::new(AppState {
            db: Arc::clone(&self.db),
            tokens: Arc::clone(&self.tokens),
            engine: Arc::clone(&self.engine),
            mail: self.mail.clone(),
            default_hours_back: 24,
        })
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
