// Debouncer behavior: a burst of IDLE notices for one mailbox produces a
// single MailboxChanged hint per window.

use maild::imap_adapter::IdleNotice;
use maild::rpc::Event;
use maild::server::events::{debounce_loop, DEBOUNCE_WINDOW};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};

#[tokio::test]
async fn notice_burst_coalesces_to_one_event() {
    let (notice_tx, notice_rx) = mpsc::channel(16);
    let (event_tx, mut event_rx) = broadcast::channel(16);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(debounce_loop(
        notice_rx,
        event_tx,
        |_email: &str| None,
        shutdown_rx,
    ));

    for count in [5u32, 6, 7] {
        notice_tx
            .send((
                "a@gmail.com".to_string(),
                "INBOX".to_string(),
                IdleNotice::Exists(count),
            ))
            .await
            .unwrap();
    }

    let event = tokio::time::timeout(Duration::from_secs(1), event_rx.recv())
        .await
        .expect("no MailboxChanged emitted")
        .unwrap();
    assert!(matches!(
        event,
        Event::MailboxChanged { ref account, ref mailbox }
            if account == "a@gmail.com" && mailbox == "INBOX"
    ));

    // Nothing else inside the window.
    let extra = tokio::time::timeout(Duration::from_millis(200), event_rx.recv()).await;
    assert!(extra.is_err(), "burst produced more than one event");
}

#[tokio::test]
async fn new_window_emits_again() {
    let (notice_tx, notice_rx) = mpsc::channel(16);
    let (event_tx, mut event_rx) = broadcast::channel(16);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(debounce_loop(
        notice_rx,
        event_tx,
        |_email: &str| None,
        shutdown_rx,
    ));

    let notice = || {
        (
            "a@gmail.com".to_string(),
            "INBOX".to_string(),
            IdleNotice::Exists(1),
        )
    };

    notice_tx.send(notice()).await.unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(1), event_rx.recv())
        .await
        .expect("first event missing")
        .unwrap();

    tokio::time::sleep(DEBOUNCE_WINDOW + Duration::from_millis(100)).await;

    notice_tx.send(notice()).await.unwrap();
    let second = tokio::time::timeout(Duration::from_secs(1), event_rx.recv())
        .await
        .expect("second window produced no event");
    assert!(second.is_ok());
}

#[tokio::test]
async fn distinct_mailboxes_do_not_coalesce() {
    let (notice_tx, notice_rx) = mpsc::channel(16);
    let (event_tx, mut event_rx) = broadcast::channel(16);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(debounce_loop(
        notice_rx,
        event_tx,
        |_email: &str| None,
        shutdown_rx,
    ));

    notice_tx
        .send((
            "a@gmail.com".to_string(),
            "INBOX".to_string(),
            IdleNotice::Exists(1),
        ))
        .await
        .unwrap();
    notice_tx
        .send((
            "a@gmail.com".to_string(),
            "Sent".to_string(),
            IdleNotice::Exists(1),
        ))
        .await
        .unwrap();

    let mut mailboxes = Vec::new();
    for _ in 0..2 {
        let event = tokio::time::timeout(Duration::from_secs(1), event_rx.recv())
            .await
            .expect("expected two events")
            .unwrap();
        if let Event::MailboxChanged { mailbox, .. } = event {
            mailboxes.push(mailbox);
        }
    }
    mailboxes.sort();
    assert_eq!(mailboxes, vec!["INBOX", "Sent"]);
}
