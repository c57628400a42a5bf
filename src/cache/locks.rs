// Persistent per-account sync locks. Stored in SQLite so single-flight
// holds across processes; a lock row whose (pid, start_token) no longer
// matches a live instance of this binary is stale and gets cleared.

use super::Cache;
use crate::error::Result;
use crate::models::SyncLock;
use crate::pidfile;

impl Cache {
    /// Try to take the per-account lock. Returns false when another holder
    /// has it.
    pub async fn acquire_lock(&self, account: &str) -> Result<bool> {
        let pid = std::process::id();
        let token = pidfile::process_start_token(pid).unwrap_or_default();
        let result = sqlx::query(
            "INSERT INTO sync_locks (account, pid, start_token, acquired_unix)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(account) DO NOTHING",
        )
        .bind(account)
        .bind(pid as i64)
        .bind(&token)
        .bind(chrono::Utc::now().timestamp())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Release the lock if this process holds it.
    pub async fn release_lock(&self, account: &str) -> Result<()> {
        sqlx::query("DELETE FROM sync_locks WHERE account = ? AND pid = ?")
            .bind(account)
            .bind(std::process::id() as i64)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Drop every lock whose holder is gone. A lock is stale when the PID is
    /// dead, belongs to a different binary, or the recorded start token does
    /// not match the process currently wearing that PID. Empty tokens are
    /// treated as stale rather than trusted.
    pub async fn cleanup_stale_locks(&self) -> Result<u64> {
        let locks = self.get_sync_locks().await?;
        let mut removed = 0;
        for lock in locks {
            if lock_is_live(&lock) {
                continue;
            }
            let result = sqlx::query("DELETE FROM sync_locks WHERE account = ? AND pid = ?")
                .bind(&lock.account)
                .bind(lock.pid as i64)
                .execute(self.pool())
                .await?;
            removed += result.rows_affected();
            tracing::info!(
                account = %lock.account,
                pid = lock.pid,
                "Removed stale sync lock"
            );
        }
        Ok(removed)
    }

    /// All current lock rows, for diagnostics.
    pub async fn get_sync_locks(&self) -> Result<Vec<SyncLock>> {
        let rows: Vec<(String, i64, String, i64)> =
            sqlx::query_as("SELECT account, pid, start_token, acquired_unix FROM sync_locks")
                .fetch_all(self.pool())
                .await?;
        Ok(rows
            .into_iter()
            .map(|(account, pid, start_token, acquired_unix)| SyncLock {
                account,
                pid: pid as u32,
                start_token,
                acquired_unix,
            })
            .collect())
    }
}

fn lock_is_live(lock: &SyncLock) -> bool {
    if lock.start_token.is_empty() {
        return false;
    }
    if !pidfile::is_our_process(lock.pid) {
        return false;
    }
    match pidfile::process_start_token(lock.pid) {
        Ok(token) => token == lock.start_token,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let cache = Cache::open_in_memory().await.unwrap();
        assert!(cache.acquire_lock("a@example.com").await.unwrap());
        assert!(!cache.acquire_lock("a@example.com").await.unwrap());
        // A different account is unaffected.
        assert!(cache.acquire_lock("b@example.com").await.unwrap());

        cache.release_lock("a@example.com").await.unwrap();
        assert!(cache.acquire_lock("a@example.com").await.unwrap());
    }

    // Start-token matching needs /proc; the policy test below covers the
    // portable fallback.
    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn cleanup_removes_dead_holders() {
        let cache = Cache::open_in_memory().await.unwrap();
        // A live lock held by this process stays; a lock from a PID far above
        // any kernel pid_max goes.
        assert!(cache.acquire_lock("live@example.com").await.unwrap());
        sqlx::query(
            "INSERT INTO sync_locks (account, pid, start_token, acquired_unix)
             VALUES ('dead@example.com', 999999999, 'bogus-token', 0)",
        )
        .execute(cache.pool())
        .await
        .unwrap();

        let removed = cache.cleanup_stale_locks().await.unwrap();
        assert_eq!(removed, 1);
        let remaining = cache.get_sync_locks().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].account, "live@example.com");
    }

    #[tokio::test]
    async fn cleanup_removes_empty_token_locks() {
        let cache = Cache::open_in_memory().await.unwrap();
        // Live PID but no token recorded: treated as stale by policy.
        sqlx::query(
            "INSERT INTO sync_locks (account, pid, start_token, acquired_unix)
             VALUES ('old@example.com', ?, '', 0)",
        )
        .bind(std::process::id() as i64)
        .execute(cache.pool())
        .await
        .unwrap();

        let removed = cache.cleanup_stale_locks().await.unwrap();
        assert_eq!(removed, 1);
    }
}
