use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::credentials::OAuthClientCredentials;
use crate::db::sealing::TokenSealer;
use crate::db::{Database, DbError};

pub const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const DEFAULT_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const DEFAULT_GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";

/// Process configuration, read from flags or the environment.
#[derive(Debug, Clone, Args)]
pub struct AppConfig {
    /// SQLite database path (defaults to ~/.gmail-sync/gmail-sync.db)
    #[arg(long, global = true, env = "GMAIL_SYNC_DB")]
    pub database: Option<PathBuf>,

    /// Platform OAuth client id used when a user's organization has none
    #[arg(long, global = true, env = "GMAIL_CLIENT_ID", default_value = "")]
    pub client_id: String,

    /// Platform OAuth client secret
    #[arg(
        long,
        global = true,
        env = "GMAIL_CLIENT_SECRET",
        default_value = "",
        hide_env_values = true
    )]
    pub client_secret: String,

    /// Platform OAuth redirect URI
    #[arg(long, global = true, env = "GMAIL_REDIRECT_URI", default_value = "")]
    pub redirect_uri: String,

    #[arg(long, global = true, env = "GMAIL_TOKEN_URL", default_value = DEFAULT_TOKEN_URL)]
    pub token_url: String,

    #[arg(long, global = true, env = "GMAIL_AUTH_URL", default_value = DEFAULT_AUTH_URL)]
    pub auth_url: String,

    #[arg(long, global = true, env = "GMAIL_API_BASE", default_value = DEFAULT_GMAIL_API_BASE)]
    pub gmail_api_base: String,

    /// Per-request timeout for Google calls, in seconds
    #[arg(long, global = true, env = "GMAIL_SYNC_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Look-back window used by scheduled syncs, in hours
    #[arg(long, global = true, env = "GMAIL_SYNC_SCHEDULED_HOURS", default_value_t = 1)]
    pub scheduled_hours_back: u32,

    /// Look-back window used by on-demand syncs when none is given, in hours
    #[arg(long, global = true, env = "GMAIL_SYNC_DEFAULT_HOURS", default_value_t = 24)]
    pub default_hours_back: u32,

    /// 64 hex chars; seals stored OAuth tokens with AES-256-GCM when set
    #[arg(long, global = true, env = "GMAIL_SYNC_TOKEN_KEY", hide_env_values = true)]
    pub token_key: Option<String>,
}

impl AppConfig {
    pub fn platform_credentials(&self) -> OAuthClientCredentials {
        OAuthClientCredentials {
            client_id: self.client_id.trim().to_string(),
            client_secret: self.client_secret.trim().to_string(),
            redirect_uri: self.redirect_uri.trim().to_string(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn database_path(&self) -> Result<PathBuf, DbError> {
        match &self.database {
            Some(path) => Ok(path.clone()),
            None => Database::default_db_path(),
        }
    }

    pub fn token_sealer(&self) -> Result<Option<TokenSealer>, DbError> {
        self.token_key
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(TokenSealer::from_hex)
            .transpose()
    }

    pub fn open_database(&self) -> Result<Database, DbError> {
        let db = Database::open(&self.database_path()?)?;
        Ok(match self.token_sealer()? {
            Some(sealer) => db.with_token_sealer(sealer),
            None => db,
        })
    }
}

/// Delays inserted between batches and messages to stay under provider rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub refresh_batch_pause: Duration,
    pub sync_batch_pause: Duration,
    pub message_delay: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            refresh_batch_pause: Duration::from_secs(1),
            sync_batch_pause: Duration::from_secs(2),
            message_delay: Duration::from_millis(100),
        }
    }
}

impl Pacing {
    pub fn none() -> Self {
        Self {
            refresh_batch_pause: Duration::ZERO,
            sync_batch_pause: Duration::ZERO,
            message_delay: Duration::ZERO,
        }
    }
}
