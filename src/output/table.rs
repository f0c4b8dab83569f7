use chrono::{DateTime, Utc};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::inbound::SyncResult;
use crate::output::TokenStatusReport;
use crate::scheduler::SyncAllSummary;
use crate::tokens::{ReauthAccount, RefreshSummary};

const USER_WIDTH: usize = 36;
const EMAIL_WIDTH: usize = 32;
const FAILED_WIDTH: usize = 12;

pub fn format_sync_result(user_id: &str, result: &SyncResult) -> String {
    if !result.success {
        return format!("Sync failed for {user_id} (no valid token or provider error).");
    }
    format!(
        "Synced {} message(s) for {user_id}, {} new.",
        result.emails_synced, result.new_emails
    )
}

pub fn format_sync_all(summary: &SyncAllSummary) -> String {
    format!(
        "Accounts: {}  ok: {}  failed: {}  new emails: {}",
        summary.total, summary.success, summary.failed, summary.new_emails
    )
}

pub fn format_refresh_summary(summary: &RefreshSummary) -> String {
    if summary.total == 0 {
        return "No tokens needed refresh.".to_string();
    }
    format!(
        "Refreshed {}/{} token(s), {} failed.",
        summary.success, summary.total, summary.failed
    )
}

pub fn format_reauth_accounts(accounts: &[ReauthAccount]) -> String {
    if accounts.is_empty() {
        return "No accounts need re-authorization.".to_string();
    }

    let mut out = String::new();
    out.push_str(&format!(
        "{:<user$}  {:<email$}  {:<failed$}\n",
        "User",
        "Email",
        "Failed",
        user = USER_WIDTH,
        email = EMAIL_WIDTH,
        failed = FAILED_WIDTH
    ));
    out.push_str(&format!(
        "{}  {}  {}\n",
        "-".repeat(USER_WIDTH),
        "-".repeat(EMAIL_WIDTH),
        "-".repeat(FAILED_WIDTH)
    ));

    for account in accounts {
        let failed = account
            .last_failed_at
            .map(relative_date)
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "{:<user$}  {:<email$}  {:<failed$}\n",
            truncate_for_width(&account.user_id, USER_WIDTH),
            truncate_for_width(&account.email, EMAIL_WIDTH),
            truncate_for_width(&failed, FAILED_WIDTH),
            user = USER_WIDTH,
            email = EMAIL_WIDTH,
            failed = FAILED_WIDTH
        ));
    }

    out
}

pub fn format_token_status(report: &TokenStatusReport) -> String {
    let mut out = String::new();
    let verdict = if report.valid { "valid" } else { "not valid" };
    out.push_str(&format!("Token for {}: {verdict}\n", report.user_id));

    if !report.counts.is_empty() {
        out.push('\n');
        out.push_str("Tokens by status\n");
        out.push_str("----------------\n");
        for row in &report.counts {
            out.push_str(&format!("{:<10} {:>8}\n", row.status, row.count));
        }
    }

    out
}

fn relative_date(at: DateTime<Utc>) -> String {
    let delta = Utc::now().signed_duration_since(at);
    if delta.num_seconds() < 0 {
        return "in future".to_string();
    }
    if delta.num_minutes() < 1 {
        return "just now".to_string();
    }
    if delta.num_hours() < 1 {
        return format!("{}m ago", delta.num_minutes());
    }
    if delta.num_hours() < 24 {
        return format!("{}h ago", delta.num_hours());
    }
    if delta.num_days() == 1 {
        return "yesterday".to_string();
    }
    if delta.num_days() < 7 {
        return format!("{}d ago", delta.num_days());
    }
    at.format("%Y-%m-%d").to_string()
}

fn truncate_for_width(value: &str, max_width: usize) -> String {
    if UnicodeWidthStr::width(value) <= max_width {
        return value.to_string();
    }

    if max_width <= 1 {
        return "…".to_string();
    }

    let mut out = String::new();
    let mut width = 0usize;
    for c in value.chars() {
        let cw = UnicodeWidthChar::width(c).unwrap_or(0);
        if width + cw + 1 > max_width {
            break;
        }
        out.push(c);
        width += cw;
    }
    out.push('…');
    out
}
