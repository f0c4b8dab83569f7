pub mod json;
pub mod table;

use anyhow::Result;
use serde::Serialize;

use crate::db::TokenStatusCount;
use crate::inbound::SyncResult;
use crate::scheduler::SyncAllSummary;
use crate::tokens::{ReauthAccount, RefreshSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Table
        }
    }
}

/// Token validity for one user plus the store-wide status breakdown.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenStatusReport {
    pub user_id: String,
    pub valid: bool,
    pub counts: Vec<TokenStatusCount>,
}

pub fn format_sync_result(format: OutputFormat, user_id: &str, result: &SyncResult) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_sync_result(user_id, result)),
        OutputFormat::Json => json::format(result),
    }
}

pub fn format_sync_all(format: OutputFormat, summary: &SyncAllSummary) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_sync_all(summary)),
        OutputFormat::Json => json::format(summary),
    }
}

pub fn format_refresh_summary(format: OutputFormat, summary: &RefreshSummary) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_refresh_summary(summary)),
        OutputFormat::Json => json::format(summary),
    }
}

pub fn format_reauth_accounts(format: OutputFormat, accounts: &[ReauthAccount]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_reauth_accounts(accounts)),
        OutputFormat::Json => json::format(accounts),
    }
}

pub fn format_token_status(format: OutputFormat, report: &TokenStatusReport) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_token_status(report)),
        OutputFormat::Json => json::format(report),
    }
}
