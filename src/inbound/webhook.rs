//! Push-delivered inbound mail. The recipient address carries the owning
//! user's id, either as a plus tag (`user+<id>@domain`) or as the whole
//! local part (`<id>@domain`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{addresses, parse_address, store_received};
use crate::db::models::{EmailDirection, NewEmail};
use crate::db::Database;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundDescriptor {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    pub message_id: String,
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
}

/// User id embedded in a recipient address, if any. Accepts a header-style
/// list and returns the first recipient that carries a UUID.
pub fn extract_user_id(recipient: &str) -> Option<String> {
    tagged_recipient(recipient).map(|(user_id, _)| user_id)
}

/// The first recipient carrying a user id, as `(user_id, address)`.
fn tagged_recipient(recipient: &str) -> Option<(String, String)> {
    addresses(recipient).into_iter().find_map(|address| {
        let user_id = user_id_from_address(&address)?;
        Some((user_id, address))
    })
}

fn user_id_from_address(address: &str) -> Option<String> {
    let (local, domain) = address.rsplit_once('@')?;
    if domain.trim().is_empty() {
        return None;
    }
    let candidate = match local.rsplit_once('+') {
        Some((_, tag)) => tag,
        None => local,
    };
    Uuid::parse_str(candidate.trim())
        .ok()
        .map(|id| id.hyphenated().to_string())
}

/// Store a pushed message. `false` means rejected or not stored; a message
/// that was already ingested counts as accepted.
pub fn handle_inbound_webhook(db: &Database, descriptor: &InboundDescriptor) -> bool {
    let Some((user_id, recipient)) = tagged_recipient(&descriptor.to) else {
        warn!(to = %descriptor.to, "inbound webhook rejected: no user id in recipient");
        return false;
    };

    let message_id = descriptor.message_id.trim();
    if message_id.is_empty() {
        warn!(user_id = %user_id, "inbound webhook rejected: missing message id");
        return false;
    }

    let email = NewEmail {
        user_id: user_id.clone(),
        message_id: message_id.to_string(),
        thread_id: None,
        direction: EmailDirection::Received,
        from_address: parse_address(&descriptor.from),
        to_address: recipient,
        subject: descriptor.subject.clone(),
        body: descriptor.body.clone(),
        timestamp: descriptor.received_at.unwrap_or_else(Utc::now),
    };

    match store_received(db, email) {
        Ok(inserted) => {
            info!(user_id = %user_id, message_id, inserted, "inbound webhook accepted");
            true
        }
        Err(err) => {
            error!(user_id = %user_id, message_id, "store inbound webhook message: {err}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{extract_user_id, tagged_recipient};

    const ID: &str = "3f2b8c1e-9a4d-4e7b-8c2f-1a2b3c4d5e6f";

    #[test]
    fn plus_tag_and_bare_local_part() {
        assert_eq!(
            extract_user_id(&format!("inbox+{ID}@mail.example.com")).as_deref(),
            Some(ID)
        );
        assert_eq!(extract_user_id(&format!("{ID}@mail.example.com")).as_deref(), Some(ID));
        assert_eq!(
            extract_user_id(&format!("Creator <inbox+{}@mail.example.com>", ID.to_uppercase()))
                .as_deref(),
            Some(ID)
        );
    }

    #[test]
    fn first_recipient_with_an_id_wins() {
        let to = format!("team@example.com, inbox+{ID}@mail.example.com");
        assert_eq!(extract_user_id(&to).as_deref(), Some(ID));
        assert_eq!(
            tagged_recipient(&to),
            Some((ID.to_string(), format!("inbox+{ID}@mail.example.com")))
        );
    }

    #[test]
    fn addresses_without_an_id_are_rejected() {
        assert!(extract_user_id("hello@example.com").is_none());
        assert!(extract_user_id("inbox+not-a-uuid@example.com").is_none());
        assert!(extract_user_id(&format!("{ID}@")).is_none());
        assert!(extract_user_id("").is_none());
    }
}
