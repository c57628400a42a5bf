// Cache behavior around the UIDVALIDITY epoch, body preservation, and the
// search fallback.

use maild::cache::Cache;
use maild::models::{Attachment, Email};

fn envelope(uid: u32, subject: &str, internal_date: i64) -> Email {
    Email {
        uid,
        message_id: format!("<{}@test.example>", uid),
        internal_date,
        from: "Alice <alice@test.example>".to_string(),
        reply_to: String::new(),
        to: "bob@test.example".to_string(),
        subject: subject.to_string(),
        date: "Mon, 15 Jan 2024 14:30:00 +0000".to_string(),
        snippet: String::new(),
        body_html: String::new(),
        unread: true,
        references: vec![],
        has_attachments: false,
        attachments: vec![],
    }
}

#[tokio::test]
async fn uidvalidity_change_wipes_mailbox_atomically() {
    let cache = Cache::open_in_memory().await.unwrap();
    let account = "a@gmail.com";

    // First epoch: UIDs 10, 11, 12 under UIDVALIDITY 42.
    let rows: Vec<Email> = [10, 11, 12]
        .iter()
        .map(|&uid| envelope(uid, "old epoch", 1000 + uid as i64))
        .collect();
    cache.upsert_emails(account, "INBOX", 42, &rows).await.unwrap();
    assert_eq!(cache.count_mailbox_emails(account, "INBOX").await.unwrap(), 3);

    // New epoch: UIDs 1, 2 under UIDVALIDITY 43.
    let rows: Vec<Email> = [1, 2]
        .iter()
        .map(|&uid| envelope(uid, "new epoch", 2000 + uid as i64))
        .collect();
    cache.upsert_emails(account, "INBOX", 43, &rows).await.unwrap();

    let mut uids = cache.cached_uids(account, "INBOX").await.unwrap();
    uids.sort_unstable();
    assert_eq!(uids, vec![1, 2]);

    let state = cache.mailbox_state(account, "INBOX").await.unwrap().unwrap();
    assert_eq!(state.uid_validity, 43);
}

#[tokio::test]
async fn same_epoch_upsert_preserves_cached_body() {
    let cache = Cache::open_in_memory().await.unwrap();
    let account = "a@gmail.com";

    cache
        .upsert_emails(account, "INBOX", 42, &[envelope(5, "hello", 1111)])
        .await
        .unwrap();
    cache
        .set_body(
            account,
            "INBOX",
            5,
            "<p>the body</p>",
            "the body",
            &[Attachment {
                part_id: "1".into(),
                filename: "doc.pdf".into(),
                content_type: "application/pdf".into(),
                size: 1234,
                encoding: "base64".into(),
            }],
        )
        .await
        .unwrap();

    // An envelope-only refresh of the same row must not erase the body.
    let mut refresh = envelope(5, "hello (edited)", 1111);
    refresh.unread = false;
    cache.upsert_emails(account, "INBOX", 42, &[refresh]).await.unwrap();

    let email = cache.load_email(account, "INBOX", 5).await.unwrap().unwrap();
    assert_eq!(email.body_html, "<p>the body</p>");
    assert_eq!(email.snippet, "the body");
    assert_eq!(email.subject, "hello (edited)");
    assert!(!email.unread);
    assert_eq!(email.attachments.len(), 1);
    assert_eq!(email.attachments[0].filename, "doc.pdf");
}

#[tokio::test]
async fn other_mailboxes_survive_a_wipe() {
    let cache = Cache::open_in_memory().await.unwrap();
    let account = "a@gmail.com";

    cache
        .upsert_emails(account, "INBOX", 42, &[envelope(1, "inbox mail", 10)])
        .await
        .unwrap();
    cache
        .upsert_emails(account, "Sent", 7, &[envelope(9, "sent mail", 20)])
        .await
        .unwrap();

    cache
        .upsert_emails(account, "INBOX", 43, &[envelope(2, "fresh", 30)])
        .await
        .unwrap();

    assert_eq!(cache.cached_uids(account, "Sent").await.unwrap(), vec![9]);
}

#[tokio::test]
async fn listing_is_newest_first_and_limited() {
    let cache = Cache::open_in_memory().await.unwrap();
    let account = "a@gmail.com";

    let rows: Vec<Email> = (1..=5)
        .map(|uid| envelope(uid, &format!("mail {}", uid), uid as i64 * 100))
        .collect();
    cache.upsert_emails(account, "INBOX", 1, &rows).await.unwrap();

    let listed = cache.load_emails_limit(account, "INBOX", 3).await.unwrap();
    let uids: Vec<u32> = listed.iter().map(|e| e.uid).collect();
    assert_eq!(uids, vec![5, 4, 3]);
}

#[tokio::test]
async fn delete_email_removes_attachment_rows() {
    let cache = Cache::open_in_memory().await.unwrap();
    let account = "a@gmail.com";

    cache
        .upsert_emails(account, "INBOX", 1, &[envelope(3, "with file", 10)])
        .await
        .unwrap();
    cache
        .set_body(
            account,
            "INBOX",
            3,
            "<p>x</p>",
            "x",
            &[Attachment {
                part_id: "1".into(),
                filename: "x.bin".into(),
                content_type: "application/octet-stream".into(),
                size: 9,
                encoding: String::new(),
            }],
        )
        .await
        .unwrap();

    cache.delete_email(account, "INBOX", 3).await.unwrap();
    assert!(cache.load_email(account, "INBOX", 3).await.unwrap().is_none());

    // Re-adding the UID must come back clean, without ghost attachments.
    cache
        .upsert_emails(account, "INBOX", 1, &[envelope(3, "reborn", 11)])
        .await
        .unwrap();
    let email = cache.load_email(account, "INBOX", 3).await.unwrap().unwrap();
    assert!(email.attachments.is_empty());
}

#[tokio::test]
async fn cached_search_is_idempotent() {
    let cache = Cache::open_in_memory().await.unwrap();
    let account = "a@gmail.com";

    let mut report = envelope(1, "Quarterly report", 100);
    report.snippet = "numbers attached".to_string();
    let rows = vec![
        report,
        envelope(2, "Lunch plans", 200),
        envelope(3, "Report follow-up", 300),
    ];
    cache.upsert_emails(account, "INBOX", 1, &rows).await.unwrap();

    let first = cache.search_cached(account, "INBOX", "report").await.unwrap();
    let second = cache.search_cached(account, "INBOX", "report").await.unwrap();

    let first_uids: Vec<u32> = first.iter().map(|e| e.uid).collect();
    let second_uids: Vec<u32> = second.iter().map(|e| e.uid).collect();
    assert_eq!(first_uids, second_uids);
    assert_eq!(first_uids, vec![3, 1]);
}

#[tokio::test]
async fn search_pattern_wildcards_are_escaped() {
    let cache = Cache::open_in_memory().await.unwrap();
    let account = "a@gmail.com";

    cache
        .upsert_emails(account, "INBOX", 1, &[envelope(1, "100% done", 100)])
        .await
        .unwrap();

    // A literal % must not act as a wildcard.
    let hits = cache.search_cached(account, "INBOX", "100%").await.unwrap();
    assert_eq!(hits.len(), 1);
    let misses = cache.search_cached(account, "INBOX", "200%").await.unwrap();
    assert!(misses.is_empty());
}

#[tokio::test]
async fn update_flags_is_idempotent() {
    let cache = Cache::open_in_memory().await.unwrap();
    let account = "a@gmail.com";

    cache
        .upsert_emails(account, "INBOX", 1, &[envelope(4, "flag me", 10)])
        .await
        .unwrap();

    cache.update_flags(account, "INBOX", 4, false).await.unwrap();
    cache.update_flags(account, "INBOX", 4, false).await.unwrap();

    let email = cache.load_email(account, "INBOX", 4).await.unwrap().unwrap();
    assert!(!email.unread);
}
