use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;

use self::models::{
    to_db_timestamp, Email, EmailDirection, NewEmail, OAuthToken, OrgCredentials, SyncState,
    TokenStatus,
};
use self::sealing::TokenSealer;

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("json serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("token sealing: {0}")]
    Sealing(String),

    #[error("{0}")]
    Config(String),
}

pub mod migrations;
pub mod models;
pub mod schema;
pub mod sealing;

const TOKEN_COLUMNS: &str = "id, user_id, email, access_token, refresh_token, expires_at, status, last_failed_at, updated_at";
const EMAIL_COLUMNS: &str = "id, user_id, message_id, thread_id, direction, from_address, to_address, subject, body, sent_at, received_at, status, created_at";

/// Token pair produced by an OAuth code exchange, ready to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizedToken {
    pub user_id: String,
    pub email: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenStatusCount {
    pub status: String,
    pub count: i64,
}

/// SQLite-backed store for tokens, organization credentials and emails.
///
/// The connection sits behind a mutex so the store can be shared across
/// tasks; every method is a short synchronous critical section.
pub struct Database {
    conn: Mutex<Connection>,
    path: PathBuf,
    sealer: Option<TokenSealer>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let db = Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
            sealer: None,
        };
        db.initialize()?;
        Ok(db)
    }

    /// Seal access/refresh tokens at rest with the given key.
    pub fn with_token_sealer(mut self, sealer: TokenSealer) -> Self {
        self.sealer = Some(sealer);
        self
    }

    pub fn initialize(&self) -> Result<(), DbError> {
        let conn = self.conn()?;
        migrations::migrate(&conn).map_err(|e| DbError::Config(format!("migration failed: {e}")))
    }

    pub fn default_db_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir()
            .ok_or_else(|| DbError::Config("failed to determine home directory".to_string()))?;
        Ok(home.join(".gmail-sync").join("gmail-sync.db"))
    }

    pub fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn
            .lock()
            .map_err(|_| DbError::Config("database connection mutex poisoned".to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn seal(&self, value: &str) -> Result<String, DbError> {
        match &self.sealer {
            Some(sealer) => sealer.seal(value),
            None => Ok(value.to_string()),
        }
    }

    fn open_secrets(&self, mut token: OAuthToken) -> Result<OAuthToken, DbError> {
        if let Some(sealer) = &self.sealer {
            token.access_token = sealer.open(&token.access_token)?;
            token.refresh_token = token
                .refresh_token
                .as_deref()
                .map(|value| sealer.open(value))
                .transpose()?;
        }
        Ok(token)
    }

    // --- gmail_tokens ---

    /// Insert or replace the token for (user, email) and mark it active.
    pub fn upsert_authorized_token(&self, token: &AuthorizedToken) -> Result<OAuthToken, DbError> {
        let access_token = self.seal(&token.access_token)?;
        let refresh_token = self.seal(&token.refresh_token)?;
        let id: i64 = self.conn()?.query_row(
            r#"
            INSERT INTO gmail_tokens (user_id, email, access_token, refresh_token, expires_at, status, last_failed_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 'active', NULL, ?6)
            ON CONFLICT(user_id, email) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                status = 'active',
                last_failed_at = NULL,
                updated_at = excluded.updated_at
            RETURNING id
            "#,
            params![
                token.user_id,
                token.email,
                access_token,
                refresh_token,
                to_db_timestamp(token.expires_at),
                to_db_timestamp(Utc::now()),
            ],
            |row| row.get(0),
        )?;

        self.get_token(id)?
            .ok_or_else(|| DbError::Config(format!("token {id} vanished after upsert")))
    }

    pub fn get_token(&self, id: i64) -> Result<Option<OAuthToken>, DbError> {
        let token = self
            .conn()?
            .query_row(
                &format!("SELECT {TOKEN_COLUMNS} FROM gmail_tokens WHERE id = ?1"),
                [id],
                OAuthToken::from_row,
            )
            .optional()?;
        token.map(|t| self.open_secrets(t)).transpose()
    }

    /// Most recently updated active token for a user, if any.
    pub fn active_token_for_user(&self, user_id: &str) -> Result<Option<OAuthToken>, DbError> {
        let token = self
            .conn()?
            .query_row(
                &format!(
                    "SELECT {TOKEN_COLUMNS} FROM gmail_tokens \
                     WHERE user_id = ?1 AND status = 'active' \
                     ORDER BY updated_at DESC, id DESC LIMIT 1"
                ),
                [user_id],
                OAuthToken::from_row,
            )
            .optional()?;
        token.map(|t| self.open_secrets(t)).transpose()
    }

    pub fn tokens_with_status(&self, status: TokenStatus) -> Result<Vec<OAuthToken>, DbError> {
        let tokens = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {TOKEN_COLUMNS} FROM gmail_tokens WHERE status = ?1 ORDER BY user_id ASC, id ASC"
            ))?;
            let rows = stmt
                .query_map([status.to_string()], OAuthToken::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        tokens.into_iter().map(|t| self.open_secrets(t)).collect()
    }

    pub fn record_refresh_success(
        &self,
        token_id: i64,
        access_token: &str,
        rotated_refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let access_token = self.seal(access_token)?;
        let refresh_token = rotated_refresh_token.map(|t| self.seal(t)).transpose()?;
        self.conn()?.execute(
            r#"
            UPDATE gmail_tokens SET
                access_token = ?2,
                refresh_token = COALESCE(?3, refresh_token),
                expires_at = ?4,
                status = 'active',
                updated_at = ?5
            WHERE id = ?1
            "#,
            params![
                token_id,
                access_token,
                refresh_token,
                to_db_timestamp(expires_at),
                to_db_timestamp(Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub fn mark_token_invalid(&self, token_id: i64, failed_at: DateTime<Utc>) -> Result<(), DbError> {
        let failed_at = to_db_timestamp(failed_at);
        self.conn()?.execute(
            "UPDATE gmail_tokens SET status = 'invalid', last_failed_at = ?2, updated_at = ?2 WHERE id = ?1",
            params![token_id, failed_at],
        )?;
        Ok(())
    }

    pub fn token_status_counts(&self) -> Result<Vec<TokenStatusCount>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) AS count FROM gmail_tokens GROUP BY status ORDER BY status ASC",
        )?;
        let counts = stmt
            .query_map([], |row| {
                Ok(TokenStatusCount {
                    status: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(counts)
    }

    // --- organizations ---

    pub fn organization_for_user(&self, user_id: &str) -> Result<Option<String>, DbError> {
        let org = self
            .conn()?
            .query_row(
                "SELECT org_id FROM user_organizations WHERE user_id = ?1 LIMIT 1",
                [user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(org)
    }

    pub fn set_membership(&self, user_id: &str, org_id: &str, role: &str) -> Result<(), DbError> {
        self.conn()?.execute(
            r#"
            INSERT INTO user_organizations (user_id, org_id, role) VALUES (?1, ?2, ?3)
            ON CONFLICT(user_id) DO UPDATE SET org_id = excluded.org_id, role = excluded.role
            "#,
            params![user_id, org_id, role],
        )?;
        Ok(())
    }

    pub fn org_credentials(&self, org_id: &str) -> Result<Option<OrgCredentials>, DbError> {
        let credentials = self
            .conn()?
            .query_row(
                "SELECT org_id, client_id, client_secret, redirect_uri, status \
                 FROM org_gmail_integrations WHERE org_id = ?1 LIMIT 1",
                [org_id],
                OrgCredentials::from_row,
            )
            .optional()?;
        Ok(credentials)
    }

    pub fn upsert_org_credentials(&self, credentials: &OrgCredentials) -> Result<(), DbError> {
        self.conn()?.execute(
            r#"
            INSERT INTO org_gmail_integrations (org_id, client_id, client_secret, redirect_uri, status, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
            ON CONFLICT(org_id) DO UPDATE SET
                client_id = excluded.client_id,
                client_secret = excluded.client_secret,
                redirect_uri = excluded.redirect_uri,
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
            params![
                credentials.org_id,
                credentials.client_id,
                credentials.client_secret,
                credentials.redirect_uri,
                credentials.status.to_string(),
            ],
        )?;
        Ok(())
    }

    // --- emails ---

    pub fn email_exists(&self, user_id: &str, message_id: &str) -> Result<bool, DbError> {
        let found: Option<i64> = self
            .conn()?
            .query_row(
                "SELECT 1 FROM emails WHERE user_id = ?1 AND message_id = ?2 LIMIT 1",
                params![user_id, message_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Insert an email row. Returns `false` when (user, message id) already
    /// exists; the unique index decides, so concurrent writers cannot both win.
    pub fn insert_email(&self, email: &NewEmail) -> Result<bool, DbError> {
        let timestamp = to_db_timestamp(email.timestamp);
        let (sent_at, received_at, status) = match email.direction {
            EmailDirection::Sent => (Some(timestamp), None, "sent"),
            EmailDirection::Received => (None, Some(timestamp), "received"),
        };

        let result = self.conn()?.execute(
            r#"
            INSERT INTO emails (
                id, user_id, message_id, thread_id, direction, from_address, to_address,
                subject, body, sent_at, received_at, status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                uuid::Uuid::new_v4().to_string(),
                email.user_id,
                email.message_id,
                email.thread_id,
                email.direction.to_string(),
                email.from_address,
                email.to_address,
                email.subject,
                email.body,
                sent_at,
                received_at,
                status,
            ],
        );

        match result {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(error, _))
                if error.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                Ok(false)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Most recent sent emails from `user_id` addressed to `to_address`.
    pub fn recent_sent_to(
        &self,
        user_id: &str,
        to_address: &str,
        limit: usize,
    ) -> Result<Vec<Email>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EMAIL_COLUMNS} FROM emails \
             WHERE user_id = ?1 AND direction = 'sent' AND lower(to_address) = lower(?2) \
             ORDER BY COALESCE(sent_at, created_at) DESC LIMIT ?3"
        ))?;
        let emails = stmt
            .query_map(params![user_id, to_address, limit as i64], Email::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(emails)
    }

    pub fn emails_for_user(&self, user_id: &str) -> Result<Vec<Email>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EMAIL_COLUMNS} FROM emails WHERE user_id = ?1 \
             ORDER BY COALESCE(received_at, sent_at, created_at) DESC"
        ))?;
        let emails = stmt
            .query_map([user_id], Email::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(emails)
    }

    // --- sync_state ---

    pub fn get_sync_state(&self, key: &str) -> Result<Option<SyncState>, DbError> {
        let state = self
            .conn()?
            .query_row(
                "SELECT key, value, updated_at FROM sync_state WHERE key = ? LIMIT 1",
                [key],
                SyncState::from_row,
            )
            .optional()?;
        Ok(state)
    }

    pub fn set_sync_state(&self, key: &str, value: &str) -> Result<(), DbError> {
        self.conn()?.execute(
            r#"
            INSERT INTO sync_state (key, value, updated_at)
            VALUES (?, ?, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![key, value],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use super::sealing::TokenSealer;
    use super::{AuthorizedToken, Database};
    use crate::db::models::{
        EmailDirection, IntegrationStatus, NewEmail, OrgCredentials, TokenStatus,
    };

    fn temp_db_path() -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("gmail-sync-test-{}.db", Uuid::new_v4()));
        path
    }

    fn authorized(user_id: &str) -> AuthorizedToken {
        AuthorizedToken {
            user_id: user_id.to_string(),
            email: format!("{user_id}@gmail.com"),
            access_token: "ya29.first".to_string(),
            refresh_token: "1//refresh".to_string(),
            expires_at: Utc::now() + Duration::hours(1),
        }
    }

    fn received(user_id: &str, message_id: &str) -> NewEmail {
        NewEmail {
            user_id: user_id.to_string(),
            message_id: message_id.to_string(),
            thread_id: None,
            direction: EmailDirection::Received,
            from_address: "brand@example.com".to_string(),
            to_address: "creator@example.com".to_string(),
            subject: "Hello".to_string(),
            body: "Body".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn token_upsert_reactivates_invalid_row() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");

        let token = db.upsert_authorized_token(&authorized("u1")).expect("upsert");
        db.mark_token_invalid(token.id, Utc::now()).expect("invalidate");
        assert!(db.active_token_for_user("u1").expect("lookup").is_none());
        assert_eq!(
            db.tokens_with_status(TokenStatus::Invalid)
                .expect("list invalid")
                .len(),
            1
        );

        let again = db.upsert_authorized_token(&authorized("u1")).expect("re-authorize");
        assert_eq!(again.id, token.id);
        assert_eq!(again.status, TokenStatus::Active);
        assert!(again.last_failed_at.is_none());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn refresh_success_keeps_refresh_token_unless_rotated() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        let token = db.upsert_authorized_token(&authorized("u1")).expect("upsert");

        let new_expiry = Utc::now() + Duration::hours(2);
        db.record_refresh_success(token.id, "ya29.second", None, new_expiry)
            .expect("record refresh");
        let loaded = db.get_token(token.id).expect("get").expect("exists");
        assert_eq!(loaded.access_token, "ya29.second");
        assert_eq!(loaded.refresh_token.as_deref(), Some("1//refresh"));

        db.record_refresh_success(token.id, "ya29.third", Some("1//rotated"), new_expiry)
            .expect("record rotated refresh");
        let loaded = db.get_token(token.id).expect("get").expect("exists");
        assert_eq!(loaded.refresh_token.as_deref(), Some("1//rotated"));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn sealed_tokens_are_not_stored_in_plaintext() {
        let path = temp_db_path();
        let sealer = TokenSealer::new([3u8; 32]);
        let db = Database::open(&path).expect("open db").with_token_sealer(sealer);
        let token = db.upsert_authorized_token(&authorized("u1")).expect("upsert");
        assert_eq!(token.access_token, "ya29.first");

        let raw: String = db
            .conn()
            .expect("conn")
            .query_row(
                "SELECT refresh_token FROM gmail_tokens WHERE id = ?1",
                [token.id],
                |row| row.get(0),
            )
            .expect("raw refresh token");
        assert!(!raw.contains("1//refresh"));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn duplicate_message_insert_reports_not_new() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");

        assert!(db.insert_email(&received("u1", "m-1")).expect("first insert"));
        assert!(!db.insert_email(&received("u1", "m-1")).expect("second insert"));
        assert!(db.insert_email(&received("u2", "m-1")).expect("other user"));
        assert!(db.email_exists("u1", "m-1").expect("exists"));
        assert_eq!(db.emails_for_user("u1").expect("list").len(), 1);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn recent_sent_to_orders_newest_first_and_limits() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");

        for i in 0..12 {
            db.insert_email(&NewEmail {
                message_id: format!("sent-{i}"),
                thread_id: Some(format!("thread-{i}")),
                direction: EmailDirection::Sent,
                from_address: "creator@example.com".to_string(),
                to_address: "Brand@Example.com".to_string(),
                timestamp: Utc::now() - Duration::minutes(60 - i),
                ..received("u1", "unused")
            })
            .expect("insert sent");
        }

        let recent = db
            .recent_sent_to("u1", "brand@example.com", 10)
            .expect("recent sent");
        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0].thread_id.as_deref(), Some("thread-11"));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn org_credentials_and_membership_roundtrip() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");

        db.set_membership("u1", "org-1", "admin").expect("membership");
        db.upsert_org_credentials(&OrgCredentials {
            org_id: "org-1".to_string(),
            client_id: "org-client".to_string(),
            client_secret: "org-secret".to_string(),
            redirect_uri: "https://org.example.com/callback".to_string(),
            status: IntegrationStatus::Inactive,
        })
        .expect("credentials");

        assert_eq!(
            db.organization_for_user("u1").expect("org").as_deref(),
            Some("org-1")
        );
        assert!(db.organization_for_user("nobody").expect("org").is_none());
        let creds = db.org_credentials("org-1").expect("load").expect("exists");
        assert_eq!(creds.status, IntegrationStatus::Inactive);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn sync_state_roundtrip() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        db.set_sync_state("cursor", "abc123").expect("set sync state");
        let state = db.get_sync_state("cursor").expect("get sync state");
        assert_eq!(state.expect("state").value.as_deref(), Some("abc123"));
        let _ = std::fs::remove_file(path);
    }
}
