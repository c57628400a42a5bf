// Write-through contract: when the remote IMAP operation fails, the cache
// stays byte-for-byte unchanged. The account points at a closed local port,
// so every connect attempt is refused immediately.

use maild::cache::Cache;
use maild::models::{Account, Email, Provider};
use maild::sync::write;

fn unreachable_account() -> Account {
    Account {
        email: "offline@test.example".to_string(),
        provider: Provider::ImapGeneric,
        // The discard port is closed on any sane test machine.
        host: "127.0.0.1".to_string(),
        port: 9,
        tls: false,
        username: "offline@test.example".to_string(),
        password: "irrelevant".to_string(),
    }
}

fn envelope(uid: u32) -> Email {
    Email {
        uid,
        message_id: format!("<{}@test.example>", uid),
        internal_date: uid as i64 * 100,
        from: "alice@test.example".to_string(),
        reply_to: String::new(),
        to: "offline@test.example".to_string(),
        subject: format!("message {}", uid),
        date: String::new(),
        snippet: String::new(),
        body_html: String::new(),
        unread: true,
        references: vec![],
        has_attachments: false,
        attachments: vec![],
    }
}

async fn seeded_cache(account: &Account) -> Cache {
    let cache = Cache::open_in_memory().await.unwrap();
    cache
        .upsert_emails(
            &account.email,
            "INBOX",
            42,
            &[envelope(11), envelope(12)],
        )
        .await
        .unwrap();
    cache
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_delete_leaves_cache_untouched() {
    let account = unreachable_account();
    let cache = seeded_cache(&account).await;

    let err = write::delete(&account, &cache, "INBOX", &[12])
        .await
        .unwrap_err();
    assert_eq!(err.kind, maild::ErrorKind::Net);

    // UID 12 survives the failed delete.
    let mut uids = cache.cached_uids(&account.email, "INBOX").await.unwrap();
    uids.sort_unstable();
    assert_eq!(uids, vec![11, 12]);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_mark_read_leaves_flags_untouched() {
    let account = unreachable_account();
    let cache = seeded_cache(&account).await;

    let err = write::mark_read(&account, &cache, "INBOX", &[11], false)
        .await
        .unwrap_err();
    assert_eq!(err.kind, maild::ErrorKind::Net);

    let email = cache
        .load_email(&account.email, "INBOX", 11)
        .await
        .unwrap()
        .unwrap();
    assert!(email.unread, "flag must not change on a failed write");
}
