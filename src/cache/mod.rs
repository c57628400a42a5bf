// Local email cache. All database access funnels through one `Cache` handle
// holding the shared pool; writes that must be atomic (the UIDVALIDITY wipe,
// body + attachment updates) run inside a single transaction.

mod emails;
mod locks;

use crate::error::Result;
use crate::models::{MailboxRole, MailboxState};
use sqlx::SqlitePool;
use std::path::Path;

#[derive(Clone)]
pub struct Cache {
    pool: SqlitePool,
}

impl Cache {
    /// Open the per-user cache database, sidelining it when corrupt.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = crate::db::open_or_reset(path).await?;
        Ok(Cache { pool })
    }

    /// In-memory cache for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = crate::db::open_in_memory().await?;
        Ok(Cache { pool })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Record that an account exists (used by `GetAccounts` aggregation).
    pub async fn touch_account(&self, email: &str, provider: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO accounts (email, provider, last_seen_unix) VALUES (?, ?, ?)
             ON CONFLICT(email) DO UPDATE SET provider = excluded.provider,
                 last_seen_unix = excluded.last_seen_unix",
        )
        .bind(email)
        .bind(provider)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mailbox_state(&self, account: &str, mailbox: &str) -> Result<Option<MailboxState>> {
        let row: Option<(i64, i64, i64)> = sqlx::query_as(
            "SELECT uid_validity, highest_modseq, last_sync_unix
             FROM mailboxes WHERE account = ? AND name = ?",
        )
        .bind(account)
        .bind(mailbox)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(uid_validity, highest_modseq, last_sync_unix)| MailboxState {
            account: account.to_string(),
            mailbox: mailbox.to_string(),
            uid_validity: uid_validity as u32,
            highest_modseq: highest_modseq as u64,
            last_sync_unix,
        }))
    }

    /// Update the CONDSTORE high-water mark and sync stamp after a run.
    pub async fn update_mailbox_state(
        &self,
        account: &str,
        mailbox: &str,
        uid_validity: u32,
        highest_modseq: u64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO mailboxes (account, name, uid_validity, highest_modseq, last_sync_unix)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(account, name) DO UPDATE SET
                 uid_validity = excluded.uid_validity,
                 highest_modseq = excluded.highest_modseq,
                 last_sync_unix = excluded.last_sync_unix",
        )
        .bind(account)
        .bind(mailbox)
        .bind(uid_validity as i64)
        .bind(highest_modseq as i64)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist a mailbox's resolved role so `GetLabels` can answer offline.
    pub async fn record_mailbox_role(
        &self,
        account: &str,
        mailbox: &str,
        role: Option<MailboxRole>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO mailboxes (account, name, role) VALUES (?, ?, ?)
             ON CONFLICT(account, name) DO UPDATE SET role = excluded.role",
        )
        .bind(account)
        .bind(mailbox)
        .bind(role.map(|r| r.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Known mailboxes with roles, for the offline `GetLabels` path.
    pub async fn known_mailboxes(&self, account: &str) -> Result<Vec<(String, Option<MailboxRole>)>> {
        let rows: Vec<(String, Option<String>)> =
            sqlx::query_as("SELECT name, role FROM mailboxes WHERE account = ? ORDER BY name")
                .bind(account)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(name, role)| (name, role.as_deref().and_then(MailboxRole::parse)))
            .collect())
    }

    pub async fn count_emails(&self, account: &str) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM emails WHERE account = ?")
            .bind(account)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    pub async fn count_mailbox_emails(&self, account: &str, mailbox: &str) -> Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM emails WHERE account = ? AND mailbox = ?")
                .bind(account)
                .bind(mailbox)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    pub async fn last_sync_unix(&self, account: &str) -> Result<i64> {
        let (stamp,): (Option<i64>,) =
            sqlx::query_as("SELECT MAX(last_sync_unix) FROM mailboxes WHERE account = ?")
                .bind(account)
                .fetch_one(&self.pool)
                .await?;
        Ok(stamp.unwrap_or(0))
    }

    /// Remove every row belonging to an account that left the store.
    pub fn purge_account<'a>(
        &'a self,
        account: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut tx: sqlx::Transaction<'_, sqlx::Sqlite> = self.pool.begin().await?;
            for table in ["attachments", "emails", "mailboxes", "sync_locks", "accounts"] {
                sqlx::query(&format!(
                    "DELETE FROM {} WHERE {} = ?",
                    table,
                    if table == "accounts" { "email" } else { "account" }
                ))
                .bind(account)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            Ok(())
        })
    }
}
