// Email row operations. The UIDVALIDITY wipe and every body write run inside
// one transaction; envelope upserts never clobber a cached body.

use super::Cache;
use crate::error::Result;
use crate::models::{Attachment, Email};

impl Cache {
    /// Insert or update email rows for a mailbox. If the stored UIDVALIDITY
    /// differs from `uid_validity`, every cached row for the mailbox is
    /// deleted first and the new epoch recorded, all in the same transaction.
    pub async fn upsert_emails(
        &self,
        account: &str,
        mailbox: &str,
        uid_validity: u32,
        rows: &[Email],
    ) -> Result<()> {
        let mut tx: sqlx::Transaction<'_, sqlx::Sqlite> = self.pool().begin().await?;

        let stored: Option<(i64,)> =
            sqlx::query_as("SELECT uid_validity FROM mailboxes WHERE account = ? AND name = ?")
                .bind(account)
                .bind(mailbox)
                .fetch_optional(&mut *tx)
                .await?;

        if let Some((stored_validity,)) = stored {
            if stored_validity != uid_validity as i64 && stored_validity != 0 {
                tracing::warn!(
                    account,
                    mailbox,
                    old = stored_validity,
                    new = uid_validity,
                    "UIDVALIDITY changed, wiping cached mailbox"
                );
                sqlx::query("DELETE FROM attachments WHERE account = ? AND mailbox = ?")
                    .bind(account)
                    .bind(mailbox)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM emails WHERE account = ? AND mailbox = ?")
                    .bind(account)
                    .bind(mailbox)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        sqlx::query(
            "INSERT INTO mailboxes (account, name, uid_validity) VALUES (?, ?, ?)
             ON CONFLICT(account, name) DO UPDATE SET uid_validity = excluded.uid_validity",
        )
        .bind(account)
        .bind(mailbox)
        .bind(uid_validity as i64)
        .execute(&mut *tx)
        .await?;

        for email in rows {
            let refs_json = serde_json::to_string(&email.references).unwrap_or_else(|_| "[]".into());
            // body_html and snippet are deliberately absent from the update
            // set: envelope-only rows must not erase a fetched body.
            sqlx::query(
                "INSERT INTO emails
                 (account, mailbox, uid, message_id, internal_date, from_addr, reply_to,
                  to_addr, subject, date, snippet, body_html, unread, refs_json, has_attachments)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(account, mailbox, uid) DO UPDATE SET
                     message_id = excluded.message_id,
                     internal_date = excluded.internal_date,
                     from_addr = excluded.from_addr,
                     reply_to = excluded.reply_to,
                     to_addr = excluded.to_addr,
                     subject = excluded.subject,
                     date = excluded.date,
                     unread = excluded.unread,
                     refs_json = excluded.refs_json,
                     has_attachments = excluded.has_attachments",
            )
            .bind(account)
            .bind(mailbox)
            .bind(email.uid as i64)
            .bind(&email.message_id)
            .bind(email.internal_date)
            .bind(&email.from)
            .bind(&email.reply_to)
            .bind(&email.to)
            .bind(&email.subject)
            .bind(&email.date)
            .bind(&email.snippet)
            .bind(&email.body_html)
            .bind(email.unread as i64)
            .bind(&refs_json)
            .bind(email.has_attachments as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Idempotent unread flag update.
    pub async fn update_flags(
        &self,
        account: &str,
        mailbox: &str,
        uid: u32,
        unread: bool,
    ) -> Result<()> {
        sqlx::query("UPDATE emails SET unread = ? WHERE account = ? AND mailbox = ? AND uid = ?")
            .bind(unread as i64)
            .bind(account)
            .bind(mailbox)
            .bind(uid as i64)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Remove an email and its attachment rows.
    pub async fn delete_email(&self, account: &str, mailbox: &str, uid: u32) -> Result<()> {
        let mut tx: sqlx::Transaction<'_, sqlx::Sqlite> = self.pool().begin().await?;
        sqlx::query("DELETE FROM attachments WHERE account = ? AND mailbox = ? AND uid = ?")
            .bind(account)
            .bind(mailbox)
            .bind(uid as i64)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM emails WHERE account = ? AND mailbox = ? AND uid = ?")
            .bind(account)
            .bind(mailbox)
            .bind(uid as i64)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Store a fetched body (with snippet and attachment descriptors) in one
    /// transaction.
    pub async fn set_body(
        &self,
        account: &str,
        mailbox: &str,
        uid: u32,
        body_html: &str,
        snippet: &str,
        attachments: &[Attachment],
    ) -> Result<()> {
        let mut tx: sqlx::Transaction<'_, sqlx::Sqlite> = self.pool().begin().await?;
        sqlx::query(
            "UPDATE emails SET body_html = ?, snippet = ?, has_attachments = ?
             WHERE account = ? AND mailbox = ? AND uid = ?",
        )
        .bind(body_html)
        .bind(snippet)
        .bind(!attachments.is_empty() as i64)
        .bind(account)
        .bind(mailbox)
        .bind(uid as i64)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM attachments WHERE account = ? AND mailbox = ? AND uid = ?")
            .bind(account)
            .bind(mailbox)
            .bind(uid as i64)
            .execute(&mut *tx)
            .await?;
        for att in attachments {
            sqlx::query(
                "INSERT INTO attachments
                 (account, mailbox, uid, part_id, filename, content_type, size, encoding)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(account)
            .bind(mailbox)
            .bind(uid as i64)
            .bind(&att.part_id)
            .bind(&att.filename)
            .bind(&att.content_type)
            .bind(att.size)
            .bind(&att.encoding)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn load_email(&self, account: &str, mailbox: &str, uid: u32) -> Result<Option<Email>> {
        let row: Option<EmailRow> = sqlx::query_as(
            "SELECT uid, message_id, internal_date, from_addr, reply_to, to_addr, subject,
                    date, snippet, body_html, unread, refs_json, has_attachments
             FROM emails WHERE account = ? AND mailbox = ? AND uid = ?",
        )
        .bind(account)
        .bind(mailbox)
        .bind(uid as i64)
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(row) => {
                let mut email = row.into_email();
                email.attachments = self.load_attachments(account, mailbox, uid).await?;
                Ok(Some(email))
            }
            None => Ok(None),
        }
    }

    /// Newest-first listing by INTERNALDATE.
    pub async fn load_emails_limit(
        &self,
        account: &str,
        mailbox: &str,
        limit: u32,
    ) -> Result<Vec<Email>> {
        let rows: Vec<EmailRow> = sqlx::query_as(
            "SELECT uid, message_id, internal_date, from_addr, reply_to, to_addr, subject,
                    date, snippet, body_html, unread, refs_json, has_attachments
             FROM emails WHERE account = ? AND mailbox = ?
             ORDER BY internal_date DESC LIMIT ?",
        )
        .bind(account)
        .bind(mailbox)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(EmailRow::into_email).collect())
    }

    /// Load specific UIDs, newest first. Used to return search hits.
    pub async fn load_emails_by_uids(
        &self,
        account: &str,
        mailbox: &str,
        uids: &[u32],
    ) -> Result<Vec<Email>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; uids.len()].join(",");
        let sql = format!(
            "SELECT uid, message_id, internal_date, from_addr, reply_to, to_addr, subject,
                    date, snippet, body_html, unread, refs_json, has_attachments
             FROM emails WHERE account = ? AND mailbox = ? AND uid IN ({})
             ORDER BY internal_date DESC",
            placeholders
        );
        let mut query = sqlx::query_as::<_, EmailRow>(&sql).bind(account).bind(mailbox);
        for uid in uids {
            query = query.bind(*uid as i64);
        }
        let rows = query.fetch_all(self.pool()).await?;
        Ok(rows.into_iter().map(EmailRow::into_email).collect())
    }

    /// Plain-text fallback search over the cached columns. Only used when the
    /// IMAP search path fails.
    pub async fn search_cached(
        &self,
        account: &str,
        mailbox: &str,
        query: &str,
    ) -> Result<Vec<Email>> {
        let pattern = format!("%{}%", query.replace('%', "\\%").replace('_', "\\_"));
        let rows: Vec<EmailRow> = sqlx::query_as(
            "SELECT uid, message_id, internal_date, from_addr, reply_to, to_addr, subject,
                    date, snippet, body_html, unread, refs_json, has_attachments
             FROM emails WHERE account = ? AND mailbox = ?
               AND (subject LIKE ? ESCAPE '\\' OR from_addr LIKE ? ESCAPE '\\'
                    OR snippet LIKE ? ESCAPE '\\' OR body_html LIKE ? ESCAPE '\\')
             ORDER BY internal_date DESC",
        )
        .bind(account)
        .bind(mailbox)
        .bind(&pattern)
        .bind(&pattern)
        .bind(&pattern)
        .bind(&pattern)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(EmailRow::into_email).collect())
    }

    /// uid → unread for a whole mailbox; lets delta sync count real flag
    /// changes instead of blind updates.
    pub async fn unread_map(
        &self,
        account: &str,
        mailbox: &str,
    ) -> Result<std::collections::HashMap<u32, bool>> {
        let rows: Vec<(i64, i64)> =
            sqlx::query_as("SELECT uid, unread FROM emails WHERE account = ? AND mailbox = ?")
                .bind(account)
                .bind(mailbox)
                .fetch_all(self.pool())
                .await?;
        Ok(rows
            .into_iter()
            .map(|(uid, unread)| (uid as u32, unread != 0))
            .collect())
    }

    pub async fn cached_uids(&self, account: &str, mailbox: &str) -> Result<Vec<u32>> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT uid FROM emails WHERE account = ? AND mailbox = ?")
                .bind(account)
                .bind(mailbox)
                .fetch_all(self.pool())
                .await?;
        Ok(rows.into_iter().map(|(uid,)| uid as u32).collect())
    }

    /// UIDs of the newest emails that still lack a cached body.
    pub async fn uids_without_body(
        &self,
        account: &str,
        mailbox: &str,
        limit: u32,
    ) -> Result<Vec<u32>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT uid FROM emails WHERE account = ? AND mailbox = ? AND body_html = ''
             ORDER BY internal_date DESC LIMIT ?",
        )
        .bind(account)
        .bind(mailbox)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|(uid,)| uid as u32).collect())
    }

    pub async fn has_body(&self, account: &str, mailbox: &str, uid: u32) -> Result<bool> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT body_html FROM emails WHERE account = ? AND mailbox = ? AND uid = ?",
        )
        .bind(account)
        .bind(mailbox)
        .bind(uid as i64)
        .fetch_optional(self.pool())
        .await?;
        Ok(matches!(row, Some((body,)) if !body.is_empty()))
    }

    async fn load_attachments(
        &self,
        account: &str,
        mailbox: &str,
        uid: u32,
    ) -> Result<Vec<Attachment>> {
        let rows: Vec<(String, String, String, i64, String)> = sqlx::query_as(
            "SELECT part_id, filename, content_type, size, encoding
             FROM attachments WHERE account = ? AND mailbox = ? AND uid = ? ORDER BY part_id",
        )
        .bind(account)
        .bind(mailbox)
        .bind(uid as i64)
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .into_iter()
            .map(|(part_id, filename, content_type, size, encoding)| Attachment {
                part_id,
                filename,
                content_type,
                size,
                encoding,
            })
            .collect())
    }
}

#[derive(sqlx::FromRow)]
struct EmailRow {
    uid: i64,
    message_id: String,
    internal_date: i64,
    from_addr: String,
    reply_to: String,
    to_addr: String,
    subject: String,
    date: String,
    snippet: String,
    body_html: String,
    unread: i64,
    refs_json: String,
    has_attachments: i64,
}

impl EmailRow {
    fn into_email(self) -> Email {
        Email {
            uid: self.uid as u32,
            message_id: self.message_id,
            internal_date: self.internal_date,
            from: self.from_addr,
            reply_to: self.reply_to,
            to: self.to_addr,
            subject: self.subject,
            date: self.date,
            snippet: self.snippet,
            body_html: self.body_html,
            unread: self.unread != 0,
            references: serde_json::from_str(&self.refs_json).unwrap_or_default(),
            has_attachments: self.has_attachments != 0,
            attachments: Vec::new(),
        }
    }
}
