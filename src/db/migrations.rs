//! Ordered schema migrations. The applied version lives in `sync_state`
//! under `schema_version`; each step runs in its own transaction.

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::db::schema;

const SCHEMA_VERSION_KEY: &str = "schema_version";

type Step = fn(&Connection) -> Result<()>;

const MIGRATIONS: &[(u32, &str, Step)] = &[
    (1, "token and organization tables", schema::create_token_tables),
    (2, "email ingestion tables", schema::create_email_tables),
];

pub fn latest_version() -> u32 {
    MIGRATIONS.last().map(|(version, _, _)| *version).unwrap_or(0)
}

pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sync_state (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );
        "#,
    )
    .context("create sync_state table")?;

    let current = applied_version(conn)?;
    let latest = latest_version();
    if current > latest {
        bail!("database schema version {current} is newer than supported version {latest}");
    }

    for (version, name, step) in MIGRATIONS.iter().filter(|(v, _, _)| *v > current) {
        let tx = conn
            .unchecked_transaction()
            .with_context(|| format!("begin migration v{version}"))?;
        step(&tx).with_context(|| format!("apply migration v{version} ({name})"))?;
        record_version(&tx, *version)?;
        tx.commit()
            .with_context(|| format!("commit migration v{version}"))?;
        tracing::debug!(version, name, "applied schema migration");
    }

    Ok(())
}

fn applied_version(conn: &Connection) -> Result<u32> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM sync_state WHERE key = ?1",
            params![SCHEMA_VERSION_KEY],
            |row| row.get(0),
        )
        .optional()
        .context("read schema version")?;

    raw.map_or(Ok(0), |value| {
        value
            .parse::<u32>()
            .with_context(|| format!("invalid schema version in database: {value}"))
    })
}

fn record_version(conn: &Connection, version: u32) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO sync_state (key, value, updated_at)
        VALUES (?1, ?2, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
        params![SCHEMA_VERSION_KEY, version.to_string()],
    )
    .with_context(|| format!("record schema version {version}"))?;
    Ok(())
}
