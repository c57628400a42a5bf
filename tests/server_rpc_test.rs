// End-to-end RPC tests over a real Unix socket: framing, per-connection
// ordering, singleton behavior, and graceful shutdown. The server runs with
// an empty account store so no IMAP connectivity is needed.

use maild::paths::Paths;
use maild::rpc::client::Client;
use maild::rpc::{codec, Command, Request, Response};
use maild::server::{self, RunOutcome};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::task::JoinHandle;

struct TestServer {
    paths: Paths,
    handle: JoinHandle<maild::Result<RunOutcome>>,
    _tmp: tempfile::TempDir,
}

async fn start_server() -> TestServer {
    let tmp = tempfile::tempdir().unwrap();
    let paths = Paths::from_base(tmp.path().join("maild")).unwrap();

    let server_paths = paths.clone();
    let handle = tokio::spawn(server::run(server_paths));

    // Wait for the socket to come up.
    let socket = paths.socket_path();
    for _ in 0..100 {
        if socket.exists() && UnixStream::connect(&socket).await.is_ok() {
            return TestServer {
                paths,
                handle,
                _tmp: tmp,
            };
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("server socket never appeared at {:?}", socket);
}

#[tokio::test]
async fn ping_pong() {
    let server = start_server().await;
    let mut client = Client::connect(&server.paths).await.unwrap();

    let result = client.request(Command::Ping).await.unwrap();
    assert_eq!(result, serde_json::json!("pong"));

    server.handle.abort();
}

#[tokio::test]
async fn responses_arrive_in_request_order() {
    let server = start_server().await;
    let mut stream = UnixStream::connect(server.paths.socket_path()).await.unwrap();

    // Pipeline three requests before reading anything back.
    for id in [11u64, 22, 33] {
        let request = Request {
            id,
            command: Command::Ping,
        };
        codec::write_json(&mut stream, &request).await.unwrap();
    }

    for expected in [11u64, 22, 33] {
        let body = codec::read_frame(&mut stream).await.unwrap().unwrap();
        let response: Response = serde_json::from_slice(&body).unwrap();
        assert_eq!(response.id, expected);
        assert!(response.ok);
    }

    server.handle.abort();
}

#[tokio::test]
async fn oversized_frame_is_rejected_and_connection_closed() {
    let server = start_server().await;
    let mut stream = UnixStream::connect(server.paths.socket_path()).await.unwrap();

    // Announce a 20 MiB body; the server must refuse before reading it.
    stream
        .write_all(&(20u32 * 1024 * 1024).to_be_bytes())
        .await
        .unwrap();
    stream.flush().await.unwrap();

    let body = codec::read_frame(&mut stream).await.unwrap().unwrap();
    let response: Response = serde_json::from_slice(&body).unwrap();
    assert!(!response.ok);
    assert_eq!(
        response.error.unwrap().kind,
        maild::ErrorKind::BadRequest
    );

    // The connection is done.
    assert!(codec::read_frame(&mut stream).await.unwrap().is_none());

    server.handle.abort();
}

#[tokio::test]
async fn malformed_json_closes_connection_with_error() {
    let server = start_server().await;
    let mut stream = UnixStream::connect(server.paths.socket_path()).await.unwrap();

    codec::write_frame(&mut stream, b"this is not json").await.unwrap();

    let body = codec::read_frame(&mut stream).await.unwrap().unwrap();
    let response: Response = serde_json::from_slice(&body).unwrap();
    assert!(!response.ok);
    assert_eq!(
        response.error.unwrap().kind,
        maild::ErrorKind::BadRequest
    );

    server.handle.abort();
}

#[tokio::test]
async fn sync_for_unknown_account_is_rejected() {
    let server = start_server().await;
    let mut client = Client::connect(&server.paths).await.unwrap();

    let err = client
        .request(Command::Sync {
            account: "nobody@example.com".to_string(),
            mailbox: "INBOX".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind, maild::ErrorKind::BadRequest);

    server.handle.abort();
}

#[tokio::test]
async fn get_emails_on_empty_cache_is_empty_list() {
    let server = start_server().await;
    let mut client = Client::connect(&server.paths).await.unwrap();

    let result = client
        .request(Command::GetEmails {
            account: "nobody@example.com".to_string(),
            mailbox: "INBOX".to_string(),
            limit: 10,
        })
        .await
        .unwrap();
    assert_eq!(result, serde_json::json!([]));

    server.handle.abort();
}

#[tokio::test]
async fn get_accounts_is_empty_without_store() {
    let server = start_server().await;
    let mut client = Client::connect(&server.paths).await.unwrap();

    let result = client.request(Command::GetAccounts).await.unwrap();
    assert_eq!(result, serde_json::json!([]));

    server.handle.abort();
}

#[tokio::test]
async fn malformed_store_reports_bad_accounts_on_rpcs() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = Paths::from_base(tmp.path().join("maild")).unwrap();
    std::fs::write(paths.accounts_path(), "accounts: [{{{{").unwrap();

    let handle = tokio::spawn(server::run(paths.clone()));
    for _ in 0..100 {
        if UnixStream::connect(paths.socket_path()).await.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let mut client = Client::connect(&paths).await.unwrap();
    let err = client
        .request(Command::Sync {
            account: "a@gmail.com".to_string(),
            mailbox: "INBOX".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind, maild::ErrorKind::BadAccounts);

    handle.abort();
}

#[tokio::test]
async fn refresh_accounts_picks_up_new_store() {
    let server = start_server().await;
    let mut client = Client::connect(&server.paths).await.unwrap();

    let before = client.request(Command::GetAccounts).await.unwrap();
    assert_eq!(before, serde_json::json!([]));

    std::fs::write(
        server.paths.accounts_path(),
        "accounts:\n  - email: offline@test.example\n    provider: imap_generic\n    host: 127.0.0.1\n    port: 9\n    tls: false\n    password: x\n",
    )
    .unwrap();

    client.request(Command::RefreshAccounts).await.unwrap();

    let after = client.request(Command::GetAccounts).await.unwrap();
    let list = after.as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["email"], "offline@test.example");
    assert_eq!(list[0]["provider"], "imap_generic");

    server.handle.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn subscribers_see_sync_started_before_sync_error() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = Paths::from_base(tmp.path().join("maild")).unwrap();
    // One account pointing at a closed port: the sync will start, fail on
    // connect, and emit SyncStarted then SyncError.
    std::fs::write(
        paths.accounts_path(),
        "accounts:\n  - email: offline@test.example\n    provider: imap_generic\n    host: 127.0.0.1\n    port: 9\n    tls: false\n    password: x\n",
    )
    .unwrap();

    let handle = tokio::spawn(server::run(paths.clone()));
    for _ in 0..100 {
        if UnixStream::connect(paths.socket_path()).await.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let mut streams = Vec::new();
    for _ in 0..2 {
        let client = Client::connect(&paths).await.unwrap();
        streams.push(client.subscribe().await.unwrap());
    }
    // Give the server a moment to register both subscriptions.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut control = Client::connect(&paths).await.unwrap();
    let sync_err = control
        .request(Command::Sync {
            account: "offline@test.example".to_string(),
            mailbox: "INBOX".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(sync_err.kind, maild::ErrorKind::Net);

    // Both subscribers observe SyncStarted strictly before SyncError.
    for stream in &mut streams {
        let first = tokio::time::timeout(Duration::from_secs(30), stream.next())
            .await
            .expect("no first event")
            .unwrap()
            .expect("stream ended early");
        assert!(
            matches!(first, maild::rpc::Event::SyncStarted { ref account, .. }
                if account == "offline@test.example"),
            "expected SyncStarted, got {:?}",
            first
        );

        let second = tokio::time::timeout(Duration::from_secs(30), stream.next())
            .await
            .expect("no second event")
            .unwrap()
            .expect("stream ended early");
        assert!(
            matches!(second, maild::rpc::Event::SyncError { .. }),
            "expected SyncError, got {:?}",
            second
        );
    }

    handle.abort();
}

#[tokio::test]
async fn shutdown_rpc_removes_socket_and_pidfile() {
    let server = start_server().await;
    let mut client = Client::connect(&server.paths).await.unwrap();

    client.request(Command::Shutdown).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(15), server.handle)
        .await
        .expect("server did not stop in time")
        .unwrap()
        .unwrap();
    assert_eq!(outcome, RunOutcome::Ran);
    assert!(!server.paths.socket_path().exists());
    assert!(!server.paths.pid_path().exists());
}

#[tokio::test]
async fn second_same_version_server_attaches_and_exits() {
    let server = start_server().await;

    // Same binary, same version, live pidfile holder: nothing to do.
    let outcome = server::run(server.paths.clone()).await.unwrap();
    assert_eq!(outcome, RunOutcome::AlreadyRunning);

    // The original server is still reachable.
    let mut client = Client::connect(&server.paths).await.unwrap();
    let result = client.request(Command::Ping).await.unwrap();
    assert_eq!(result, serde_json::json!("pong"));

    server.handle.abort();
}

#[tokio::test]
async fn subscribe_stream_ends_on_server_shutdown() {
    let server = start_server().await;

    let client = Client::connect(&server.paths).await.unwrap();
    let mut stream = client.subscribe().await.unwrap();

    let mut control = Client::connect(&server.paths).await.unwrap();
    control.request(Command::Shutdown).await.unwrap();

    // The event stream closes cleanly once the server is gone.
    let end = tokio::time::timeout(Duration::from_secs(15), stream.next())
        .await
        .expect("stream did not end");
    assert!(matches!(end, Ok(None) | Err(_)));

    let _ = tokio::time::timeout(Duration::from_secs(15), server.handle).await;
}
