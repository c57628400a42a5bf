// SQLite pool setup and schema migrations. One database per user; every
// sync worker and RPC handler goes through the same pool.

use crate::error::{Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;

/// Forward-only migration scripts, applied in order inside transactions.
/// Never edit a shipped entry; append a new one.
const MIGRATIONS: &[&str] = &[
    // v1: initial schema
    r#"
    CREATE TABLE accounts (
        email TEXT PRIMARY KEY,
        provider TEXT NOT NULL,
        last_seen_unix INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE mailboxes (
        account TEXT NOT NULL,
        name TEXT NOT NULL,
        role TEXT,
        uid_validity INTEGER NOT NULL DEFAULT 0,
        highest_modseq INTEGER NOT NULL DEFAULT 0,
        last_sync_unix INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (account, name)
    );

    CREATE TABLE emails (
        account TEXT NOT NULL,
        mailbox TEXT NOT NULL,
        uid INTEGER NOT NULL,
        message_id TEXT NOT NULL DEFAULT '',
        internal_date INTEGER NOT NULL DEFAULT 0,
        from_addr TEXT NOT NULL DEFAULT '',
        reply_to TEXT NOT NULL DEFAULT '',
        to_addr TEXT NOT NULL DEFAULT '',
        subject TEXT NOT NULL DEFAULT '',
        date TEXT NOT NULL DEFAULT '',
        snippet TEXT NOT NULL DEFAULT '',
        body_html TEXT NOT NULL DEFAULT '',
        unread INTEGER NOT NULL DEFAULT 1,
        refs_json TEXT NOT NULL DEFAULT '[]',
        has_attachments INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (account, mailbox, uid)
    );

    CREATE INDEX idx_emails_list ON emails(account, mailbox, internal_date DESC);
    CREATE INDEX idx_emails_message_id ON emails(account, message_id);

    CREATE TABLE attachments (
        account TEXT NOT NULL,
        mailbox TEXT NOT NULL,
        uid INTEGER NOT NULL,
        part_id TEXT NOT NULL,
        filename TEXT NOT NULL DEFAULT '',
        content_type TEXT NOT NULL DEFAULT '',
        size INTEGER NOT NULL DEFAULT 0,
        encoding TEXT NOT NULL DEFAULT '',
        PRIMARY KEY (account, mailbox, uid, part_id)
    );

    CREATE TABLE sync_locks (
        account TEXT PRIMARY KEY,
        pid INTEGER NOT NULL,
        start_token TEXT NOT NULL DEFAULT '',
        acquired_unix INTEGER NOT NULL
    );
    "#,
];

/// Open (or create) the cache database at `path` and bring the schema up to
/// date.
pub async fn open(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::cache_corrupt(format!("failed to create cache dir: {}", e)))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;

    migrate(&pool).await?;
    Ok(pool)
}

/// Open the cache, and if it is unreadable or fails migration, rename it
/// aside with a timestamp and start over with an empty database. The sync
/// engine repopulates it.
pub async fn open_or_reset(path: &Path) -> Result<SqlitePool> {
    match open(path).await {
        Ok(pool) => Ok(pool),
        Err(first_err) => {
            let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
            let aside = path.with_extension(format!("corrupt.{}", stamp));
            tracing::error!(
                error = %first_err,
                aside = %aside.display(),
                "Cache unusable, moving it aside and starting empty"
            );
            std::fs::rename(path, &aside)
                .map_err(|e| Error::cache_corrupt(format!("failed to sideline cache: {}", e)))?;
            open(path).await
        }
    }
}

/// In-memory database for tests.
pub async fn open_in_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    migrate(&pool).await?;
    Ok(pool)
}

async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")
        .execute(pool)
        .await?;

    let current: Option<(i64,)> = sqlx::query_as("SELECT version FROM schema_version")
        .fetch_optional(pool)
        .await?;
    let current = current.map(|(v,)| v).unwrap_or(0);

    let target = MIGRATIONS.len() as i64;
    if current > target {
        // A newer build wrote this cache; refusing to guess is the only safe
        // move.
        return Err(Error::cache_corrupt(format!(
            "cache schema version {} is newer than this build supports ({})",
            current, target
        )));
    }

    for (idx, script) in MIGRATIONS.iter().enumerate() {
        let version = idx as i64 + 1;
        if version <= current {
            continue;
        }
        let mut tx = pool.begin().await?;
        sqlx::raw_sql(script).execute(&mut *tx).await.map_err(|e| {
            Error::cache_corrupt(format!("migration {} failed: {}", version, e))
        })?;
        sqlx::query("DELETE FROM schema_version")
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
            .bind(version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::info!(version, "Applied cache migration");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_apply_once() {
        let pool = open_in_memory().await.unwrap();
        migrate(&pool).await.unwrap();

        let (version,): (i64,) = sqlx::query_as("SELECT version FROM schema_version")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(version, MIGRATIONS.len() as i64);
    }

    #[tokio::test]
    async fn future_schema_version_is_rejected() {
        let pool = open_in_memory().await.unwrap();
        sqlx::query("UPDATE schema_version SET version = 999")
            .execute(&pool)
            .await
            .unwrap();
        let err = migrate(&pool).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::CacheCorrupt);
    }
}
