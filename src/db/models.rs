use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Result as SqlResult, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenStatus {
    Active,
    Expired,
    Invalid,
}

impl Display for TokenStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Expired => write!(f, "expired"),
            Self::Invalid => write!(f, "invalid"),
        }
    }
}

impl FromStr for TokenStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "expired" => Ok(Self::Expired),
            "invalid" => Ok(Self::Invalid),
            other => Err(format!("invalid token status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationStatus {
    Active,
    Inactive,
}

impl Display for IntegrationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Inactive => write!(f, "inactive"),
        }
    }
}

impl FromStr for IntegrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            other => Err(format!("invalid integration status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmailDirection {
    Sent,
    Received,
}

impl Display for EmailDirection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sent => write!(f, "sent"),
            Self::Received => write!(f, "received"),
        }
    }
}

impl FromStr for EmailDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sent" => Ok(Self::Sent),
            "received" => Ok(Self::Received),
            other => Err(format!("invalid email direction: {other}")),
        }
    }
}

/// OAuth access/refresh pair for one (user, mailbox).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OAuthToken {
    pub id: i64,
    pub user_id: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub access_token: String,
    #[serde(skip_serializing)]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub status: TokenStatus,
    pub last_failed_at: Option<DateTime<Utc>>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrgCredentials {
    pub org_id: String,
    pub client_id: String,
    #[serde(skip_serializing)]
    pub client_secret: String,
    pub redirect_uri: String,
    pub status: IntegrationStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Email {
    pub id: String,
    pub user_id: String,
    pub message_id: String,
    pub thread_id: Option<String>,
    pub direction: EmailDirection,
    pub from_address: String,
    pub to_address: String,
    pub subject: String,
    pub body: String,
    pub sent_at: Option<String>,
    pub received_at: Option<String>,
    pub status: String,
    pub created_at: Option<String>,
}

/// Insert payload for an `emails` row; the store assigns the row id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEmail {
    pub user_id: String,
    pub message_id: String,
    pub thread_id: Option<String>,
    pub direction: EmailDirection,
    pub from_address: String,
    pub to_address: String,
    pub subject: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncState {
    pub key: String,
    pub value: Option<String>,
    pub updated_at: Option<String>,
}

/// Timestamps are stored as fixed-width RFC3339 so text ordering matches time ordering.
pub fn to_db_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_db_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|value| value.with_timezone(&Utc))
}

fn conversion_error(column: &str, raw: &str, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        raw.len(),
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{column}: {message}"),
        )),
    )
}

fn parse_column<T>(row: &Row<'_>, column: &str) -> SqlResult<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(column)?;
    T::from_str(&raw).map_err(|e| conversion_error(column, &raw, e))
}

fn timestamp_column(row: &Row<'_>, column: &str) -> SqlResult<DateTime<Utc>> {
    let raw: String = row.get(column)?;
    parse_db_timestamp(&raw)
        .ok_or_else(|| conversion_error(column, &raw, "invalid RFC3339 timestamp".to_string()))
}

impl OAuthToken {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        let last_failed_at: Option<String> = row.get("last_failed_at")?;
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            email: row.get("email")?,
            access_token: row.get("access_token")?,
            refresh_token: row.get("refresh_token")?,
            expires_at: timestamp_column(row, "expires_at")?,
            status: parse_column(row, "status")?,
            last_failed_at: last_failed_at.as_deref().and_then(parse_db_timestamp),
            updated_at: row.get("updated_at")?,
        })
    }
}

impl OrgCredentials {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            org_id: row.get("org_id")?,
            client_id: row.get("client_id")?,
            client_secret: row.get("client_secret")?,
            redirect_uri: row.get("redirect_uri")?,
            status: parse_column(row, "status")?,
        })
    }
}

impl Email {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            message_id: row.get("message_id")?,
            thread_id: row.get("thread_id")?,
            direction: parse_column(row, "direction")?,
            from_address: row.get("from_address")?,
            to_address: row.get("to_address")?,
            subject: row.get("subject")?,
            body: row.get("body")?,
            sent_at: row.get("sent_at")?,
            received_at: row.get("received_at")?,
            status: row.get("status")?,
            created_at: row.get("created_at")?,
        })
    }
}

impl SyncState {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            key: row.get("key")?,
            value: row.get("value")?,
            updated_at: row.get("updated_at")?,
        })
    }
}
