//! Inbound mail ingestion: pull recent inbox messages through a
//! [`MailProvider`], dedupe them, thread them against sent mail and persist
//! them as `received` email rows. The webhook path in [`webhook`] shares the
//! same storage step.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::Pacing;
use crate::db::models::{to_db_timestamp, EmailDirection, NewEmail};
use crate::db::{Database, DbError};
use crate::gmail::{GmailMessage, MailProvider};
use crate::tokens::TokenRefresher;

pub mod body;
pub mod threading;
pub mod webhook;

pub use webhook::InboundDescriptor;

/// Upper bound on messages handled per sync call; the rest wait for the next pass.
pub const MAX_MESSAGES_PER_SYNC: usize = 50;
const LAST_SYNC_KEY_PREFIX: &str = "gmail_last_sync:";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,
    pub emails_synced: usize,
    pub new_emails: usize,
}

impl SyncResult {
    fn failed() -> Self {
        Self::default()
    }
}

pub fn last_sync_key(user_id: &str) -> String {
    format!("{LAST_SYNC_KEY_PREFIX}{user_id}")
}

/// Gmail search for inbox mail newer than `hours_back` hours (at least one).
pub fn inbox_query(hours_back: u32) -> String {
    format!("in:inbox newer_than:{}h", hours_back.max(1))
}

pub struct InboundSyncEngine {
    db: Arc<Database>,
    tokens: Arc<TokenRefresher>,
    mail: Arc<dyn MailProvider>,
    pacing: Pacing,
}

impl InboundSyncEngine {
    pub fn new(
        db: Arc<Database>,
        tokens: Arc<TokenRefresher>,
        mail: Arc<dyn MailProvider>,
        pacing: Pacing,
    ) -> Self {
        Self {
            db,
            tokens,
            mail,
            pacing,
        }
    }

    /// Pull inbox messages from the last `hours_back` hours for one user.
    ///
    /// Fails without touching the provider when the user has no usable
    /// token. Individual message failures are logged and skipped.
    pub async fn sync_recent_emails(&self, user_id: &str, hours_back: u32) -> SyncResult {
        let Some(token) = self.tokens.valid_token_for_user(user_id).await else {
            warn!(user_id, "no valid gmail token, sync skipped");
            return SyncResult::failed();
        };

        let query = inbox_query(hours_back);
        let message_ids = match self
            .mail
            .list_message_ids(&token.access_token, &query, MAX_MESSAGES_PER_SYNC)
            .await
        {
            Ok(ids) => ids,
            Err(error) => {
                warn!(user_id, %query, "list inbox messages failed: {error}");
                return SyncResult::failed();
            }
        };
        debug!(user_id, %query, count = message_ids.len(), "listed inbox messages");

        let mut result = SyncResult {
            success: true,
            ..SyncResult::default()
        };
        for (index, message_id) in message_ids.iter().enumerate() {
            if index > 0 && !self.pacing.message_delay.is_zero() {
                sleep(self.pacing.message_delay).await;
            }

            match self
                .process_inbound_message(user_id, &token.access_token, message_id)
                .await
            {
                Ok(inserted) => {
                    result.emails_synced += 1;
                    if inserted {
                        result.new_emails += 1;
                    }
                }
                Err(error) => {
                    warn!(user_id, message_id = %message_id, "skipping message: {error:#}");
                }
            }
        }

        if let Err(error) = self
            .db
            .set_sync_state(&last_sync_key(user_id), &to_db_timestamp(Utc::now()))
        {
            warn!(user_id, "record last sync time: {error}");
        }

        info!(
            user_id,
            emails_synced = result.emails_synced,
            new_emails = result.new_emails,
            "gmail sync complete"
        );
        result
    }

    /// Ingest one provider message. `Ok(false)` means it was already stored.
    pub async fn process_inbound_message(
        &self,
        user_id: &str,
        access_token: &str,
        message_id: &str,
    ) -> Result<bool> {
        if self
            .db
            .email_exists(user_id, message_id)
            .context("check for existing message")?
        {
            debug!(user_id, message_id, "message already ingested");
            return Ok(false);
        }

        let message = self
            .mail
            .get_message(access_token, message_id)
            .await
            .with_context(|| format!("fetch gmail message {message_id}"))?;

        let email = received_email(user_id, &message);
        store_received(&self.db, email).context("store inbound message")
    }

    /// Webhook entry point; see [`webhook::handle_inbound_webhook`].
    pub fn handle_inbound_webhook(&self, descriptor: &InboundDescriptor) -> bool {
        webhook::handle_inbound_webhook(&self.db, descriptor)
    }
}

/// Normalize a full Gmail message into a `received` row without a thread id.
pub fn received_email(user_id: &str, message: &GmailMessage) -> NewEmail {
    let date = message.header("Date");
    NewEmail {
        user_id: user_id.to_string(),
        message_id: message.id.clone(),
        thread_id: None,
        direction: EmailDirection::Received,
        from_address: parse_address(&message.header("From")),
        to_address: parse_address(&message.header("To")),
        subject: message.header("Subject"),
        body: body::extract_body(&message.payload_tree()),
        timestamp: received_at(&date, message.internal_date.as_deref()),
    }
}

/// Date header first, then Gmail's `internalDate` (epoch millis), then now.
fn received_at(date_header: &str, internal_date: Option<&str>) -> DateTime<Utc> {
    DateTime::parse_from_rfc2822(date_header.trim())
        .ok()
        .map(|date| date.with_timezone(&Utc))
        .or_else(|| {
            internal_date
                .and_then(|millis| millis.trim().parse::<i64>().ok())
                .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
        })
        .unwrap_or_else(Utc::now)
}

/// Thread and insert a `received` row. Thread lookup failures leave the
/// message unthreaded rather than dropping it.
pub(crate) fn store_received(db: &Database, mut email: NewEmail) -> Result<bool, DbError> {
    email.thread_id =
        match threading::resolve_thread_id(db, &email.user_id, &email.from_address, &email.subject)
        {
            Ok(thread_id) => thread_id,
            Err(error) => {
                warn!(user_id = %email.user_id, "thread lookup failed: {error}");
                None
            }
        };

    let inserted = db.insert_email(&email)?;
    if inserted {
        debug!(
            user_id = %email.user_id,
            message_id = %email.message_id,
            threaded = email.thread_id.is_some(),
            "stored inbound message"
        );
    } else {
        debug!(user_id = %email.user_id, message_id = %email.message_id, "duplicate inbound message");
    }
    Ok(inserted)
}

/// Bare address from a header value such as `"Alex" <alex@example.com>`.
/// Only the first entry of a comma-separated list is considered.
pub fn parse_address(raw: &str) -> String {
    addresses(raw).into_iter().next().unwrap_or_default()
}

/// Every bare address in a comma-separated header value.
pub fn addresses(raw: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in raw.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => {
                out.extend(bare_address(&current));
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    out.extend(bare_address(&current));
    out
}

fn bare_address(entry: &str) -> Option<String> {
    let entry = entry.trim();
    if entry.is_empty() {
        return None;
    }

    if let (Some(start), Some(end)) = (entry.rfind('<'), entry.rfind('>')) {
        if start < end {
            let address = entry[start + 1..end].trim();
            return (!address.is_empty()).then(|| address.to_string());
        }
    }

    Some(entry.trim_matches('"').trim().to_string())
}
