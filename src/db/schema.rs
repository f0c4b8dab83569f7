use anyhow::Result;
use rusqlite::Connection;

/// OAuth tokens plus the organization tables used to pick an OAuth client.
pub fn create_token_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS gmail_tokens (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            email TEXT NOT NULL,
            access_token TEXT NOT NULL,
            refresh_token TEXT,
            expires_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active' CHECK(status IN ('active', 'expired', 'invalid')),
            last_failed_at TEXT,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            UNIQUE(user_id, email),
            CHECK(status <> 'active' OR refresh_token IS NOT NULL)
        );

        CREATE TABLE IF NOT EXISTS user_organizations (
            user_id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'member'
        );

        CREATE TABLE IF NOT EXISTS org_gmail_integrations (
            org_id TEXT PRIMARY KEY,
            client_id TEXT NOT NULL,
            client_secret TEXT NOT NULL,
            redirect_uri TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active' CHECK(status IN ('active', 'inactive')),
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );

        CREATE INDEX IF NOT EXISTS idx_gmail_tokens_status ON gmail_tokens(status);
        CREATE INDEX IF NOT EXISTS idx_user_organizations_org ON user_organizations(org_id);
        "#,
    )?;

    Ok(())
}

/// Ingested and sent mail. `(user_id, message_id)` is unique so concurrent
/// ingestion of the same provider message can only insert once.
pub fn create_email_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS emails (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            message_id TEXT NOT NULL,
            thread_id TEXT,
            direction TEXT NOT NULL CHECK(direction IN ('sent', 'received')),
            from_address TEXT NOT NULL DEFAULT '',
            to_address TEXT NOT NULL DEFAULT '',
            subject TEXT NOT NULL DEFAULT '',
            body TEXT NOT NULL DEFAULT '',
            sent_at TEXT,
            received_at TEXT,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_emails_user_message ON emails(user_id, message_id);
        CREATE INDEX IF NOT EXISTS idx_emails_sent_lookup ON emails(user_id, direction, to_address);
        CREATE INDEX IF NOT EXISTS idx_emails_thread_id ON emails(thread_id);
        "#,
    )?;

    Ok(())
}
