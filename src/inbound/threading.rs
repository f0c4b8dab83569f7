//! Subject-based reply threading against previously sent mail.

use crate::db::models::Email;
use crate::db::{Database, DbError};

const REPLY_PREFIXES: &[&str] = &["re:", "fwd:", "fw:"];
pub const SENT_LOOKBACK_LIMIT: usize = 10;

/// Strip leading reply/forward markers (`Re:`, `Fwd:`, `Fw:` in any case),
/// including stacked ones such as `Re: Fwd:`.
pub fn clean_subject(subject: &str) -> String {
    let mut rest = subject.trim();
    loop {
        let lowered = rest.to_ascii_lowercase();
        let Some(prefix) = REPLY_PREFIXES.iter().find(|p| lowered.starts_with(*p)) else {
            return rest.to_string();
        };
        rest = rest[prefix.len()..].trim_start();
    }
}

/// Thread id of the first candidate whose subject contains `cleaned`,
/// compared case-insensitively.
pub fn match_thread(cleaned: &str, candidates: &[Email]) -> Option<String> {
    if cleaned.is_empty() {
        return None;
    }
    let needle = cleaned.to_lowercase();
    candidates
        .iter()
        .find(|email| email.subject.to_lowercase().contains(&needle))
        .and_then(|email| email.thread_id.clone())
}

/// Best-effort thread id for an inbound message from `sender` with `subject`.
pub fn resolve_thread_id(
    db: &Database,
    user_id: &str,
    sender: &str,
    subject: &str,
) -> Result<Option<String>, DbError> {
    let cleaned = clean_subject(subject);
    if cleaned.is_empty() || sender.trim().is_empty() {
        return Ok(None);
    }

    let recent = db.recent_sent_to(user_id, sender.trim(), SENT_LOOKBACK_LIMIT)?;
    Ok(match_thread(&cleaned, &recent))
}
