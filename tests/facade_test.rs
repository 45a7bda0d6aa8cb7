//! Integration tests for the Server and Client facades
//!
//! Covers protocol selection, the connect guard and echo round trips over
//! every bundled transport.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use gonet::{Client, Configure, NetError, Proto, Server, TlsOptions, TlsVersion, VerifyMode};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn echo_server(url: &str) -> Server {
    let mut server = Server::new();
    server.set_receive_cb(|session, data| {
        session.send_no_delay_slice(data, None);
        data.len()
    });
    server.start(url).await.unwrap();
    server
}

fn collecting_client() -> (Client, mpsc::UnboundedReceiver<Vec<u8>>) {
    let client = Client::new();
    let (tx, rx) = mpsc::unbounded_channel();
    client.set_receive_cb(move |_, data| {
        let _ = tx.send(data.to_vec());
        data.len()
    });
    (client, rx)
}

async fn read_exactly(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>, len: usize) -> Vec<u8> {
    let mut got = Vec::new();
    while got.len() < len {
        let chunk = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        got.extend_from_slice(&chunk);
    }
    got
}

#[tokio::test]
async fn test_unsupported_protocol_everywhere() {
    let mut server = Server::new();
    assert!(matches!(
        server.start("quic://127.0.0.1:0").await,
        Err(NetError::UnsupportedProtocol(_))
    ));
    assert!(matches!(
        server.start_before_fork("quic://127.0.0.1:0").await,
        Err(NetError::UnsupportedProtocol(_))
    ));
    assert!(!server.is_running());

    let client = Client::new();
    assert!(matches!(
        client.connect("quic://127.0.0.1:0").await,
        Err(NetError::UnsupportedProtocol(_))
    ));
    assert!(client.session().is_empty());
}

#[tokio::test]
async fn test_tcp_echo() {
    let server = echo_server("tcp://127.0.0.1:0").await;
    let (client, mut rx) = collecting_client();

    client.connect(&server.local_addr().to_string()).await.unwrap();
    assert!(client.is_estab());
    assert_eq!(client.remote_addr().addr(), server.local_addr().addr());
    assert_eq!(client.protocol().unwrap().name(), "tcp");

    let (done_tx, done_rx) = oneshot::channel();
    client.send_slice(
        b"hello gonet",
        Some(Box::new(move |r: gonet::Result<()>| drop(done_tx.send(r)))),
    );
    assert!(timeout(WAIT, done_rx).await.unwrap().unwrap().is_ok());

    assert_eq!(read_exactly(&mut rx, 11).await, b"hello gonet");
}

#[tokio::test]
async fn test_already_established() {
    let server = echo_server("tcp://127.0.0.1:0").await;
    let client = Client::new();
    let url = server.local_addr().to_string();

    client.connect(&url).await.unwrap();
    let session = client.session();

    assert!(matches!(
        client.connect(&url).await,
        Err(NetError::AlreadyEstablished)
    ));
    assert!(client.session().ptr_eq(&session));
}

#[tokio::test]
async fn test_connect_callback_sees_established_client() {
    for scheme in ["tcp", "udp"] {
        let server = echo_server(&format!("{}://127.0.0.1:0", scheme)).await;

        let client = Arc::new(Client::new());
        let weak = Arc::downgrade(&client);
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.set_connected_cb(move |entry| {
            let seen = weak
                .upgrade()
                .is_some_and(|c| c.is_estab() && c.session().ptr_eq(&entry));
            let _ = tx.send(seen);
        });

        client.connect(&server.local_addr().to_string()).await.unwrap();
        assert!(timeout(WAIT, rx.recv()).await.unwrap().unwrap(), "{}", scheme);
    }
}

#[tokio::test]
async fn test_concurrent_connect_is_rejected() {
    // A listener that accepts but never speaks TLS keeps the first connect busy
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hold = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(stream);
    });

    let client = Arc::new(Client::new());
    let first = {
        let client = client.clone();
        tokio::spawn(async move { client.connect(&format!("ssl://{}", addr)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let target_before = client.target();
    assert!(matches!(
        client.connect("tcp://127.0.0.1:1").await,
        Err(NetError::Connecting)
    ));
    assert_eq!(client.target(), target_before);
    assert_eq!(client.target().proto(), Proto::Ssl);

    first.abort();
    hold.abort();
}

#[tokio::test]
async fn test_udp_echo() {
    let server = echo_server("udp://127.0.0.1:0").await;
    let (client, mut rx) = collecting_client();

    client.connect(&server.local_addr().to_string()).await.unwrap();
    assert!(client.is_estab());

    client.send_no_delay_slice(b"ping", None);
    assert_eq!(read_exactly(&mut rx, 4).await, b"ping");
    assert_eq!(server.session_count(), 1);
}

fn write_temp(name: &str, contents: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("gonet-it-{}-{}", std::process::id(), name));
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    path
}

#[tokio::test]
async fn test_tls_echo() {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let chain = write_temp("chain.pem", &cert.cert.pem());
    let key = write_temp("key.pem", &cert.key_pair.serialize_pem());

    let mut server = Server::new();
    server
        .set_tls_options(TlsOptions {
            min_version: TlsVersion::Tls13,
            certificate_chain_file: Some(chain.clone()),
            private_key_file: Some(key),
            ..Default::default()
        })
        .set_receive_cb(|session, data| {
            session.send_slice(data, None);
            data.len()
        });
    server.start("tls://127.0.0.1:0").await.unwrap();
    assert_eq!(server.local_addr().proto(), Proto::Ssl);

    let (client, mut rx) = collecting_client();
    client.set_tls_options(TlsOptions {
        verify_mode: VerifyMode::Required,
        verify_file: Some(chain),
        server_name: Some("localhost".into()),
        ..Default::default()
    });
    client
        .connect(&format!("ssl://{}", server.local_addr().addr()))
        .await
        .unwrap();

    client.send_slice(b"secret", None);
    assert_eq!(read_exactly(&mut rx, 6).await, b"secret");
}

#[tokio::test]
async fn test_max_connection_counts_pending_tls_handshakes() {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let chain = write_temp("limit-chain.pem", &cert.cert.pem());
    let key = write_temp("limit-key.pem", &cert.key_pair.serialize_pem());

    let mut server = Server::new();
    server.set_max_connection(1).set_tls_options(TlsOptions {
        certificate_chain_file: Some(chain),
        private_key_file: Some(key),
        ..Default::default()
    });
    server.start("ssl://127.0.0.1:0").await.unwrap();
    let url = server.local_addr().to_string();

    let clients: Vec<_> = (0..4)
        .map(|_| {
            let url = url.clone();
            tokio::spawn(async move {
                let client = Client::new();
                let result = client.connect(&url).await;
                (client, result)
            })
        })
        .collect();

    let mut connected = Vec::new();
    for handle in clients {
        let (client, result) = timeout(WAIT, handle).await.unwrap().unwrap();
        if result.is_ok() {
            connected.push(client);
        }
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    // The first accepted handshake holds the only slot while it runs
    assert_eq!(connected.len(), 1);
    assert_eq!(server.session_count(), 1);
}

#[tokio::test]
async fn test_two_phase_start() {
    let mut server = Server::new();
    server.start_before_fork("tcp://127.0.0.1:0").await.unwrap();
    let url = server.local_addr().to_string();

    // Bound but not yet accepting: the handshake completes in the backlog
    let queued = tokio::net::TcpStream::connect(server.local_addr().addr()).await;
    assert!(queued.is_ok());
    assert_eq!(server.session_count(), 0);

    server.start_after_fork().unwrap();

    let client = Client::new();
    client.connect(&url).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.session_count(), 2);
}

#[tokio::test]
async fn test_shutdown_fails_queued_sends() {
    let server = echo_server("tcp://127.0.0.1:0").await;
    let client = Client::new();
    client.connect(&server.local_addr().to_string()).await.unwrap();

    let session = client.session();
    client.shutdown();
    client.shutdown();
    assert!(!client.is_estab());
    assert!(!session.is_estab());

    let (tx, rx) = oneshot::channel();
    session.send_slice(b"late", Some(Box::new(move |r: gonet::Result<()>| drop(tx.send(r)))));
    assert!(matches!(
        timeout(WAIT, rx).await.unwrap().unwrap(),
        Err(NetError::Shutdown)
    ));

    // The facade itself has no transport any more
    let (tx, rx) = oneshot::channel();
    client.send_slice(b"later", Some(Box::new(move |r: gonet::Result<()>| drop(tx.send(r)))));
    assert!(matches!(rx.await.unwrap(), Err(NetError::Shutdown)));
}

#[tokio::test]
async fn test_max_connection_rejects_extra_clients() {
    let mut server = Server::new();
    server.set_max_connection(1);
    server.start("tcp://127.0.0.1:0").await.unwrap();
    let url = server.local_addr().to_string();

    let first = Client::new();
    first.connect(&url).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.session_count(), 1);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let second = Client::new();
    second.set_disconnected_cb(move |_, _| {
        let _ = tx.send(());
    });
    second.connect(&url).await.unwrap();

    // The server closes the surplus connection right after accepting it
    assert!(timeout(WAIT, rx.recv()).await.unwrap().is_some());
    assert!(!second.is_estab());
    assert_eq!(server.session_count(), 1);
}

#[tokio::test]
async fn test_disconnect_callback_on_server_shutdown() {
    let mut server = echo_server("tcp://127.0.0.1:0").await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let client = Client::new();
    client.set_disconnected_cb(move |_, reason| {
        let _ = tx.send(reason.to_string());
    });
    client.connect(&server.local_addr().to_string()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    server.shutdown();
    assert!(timeout(WAIT, rx.recv()).await.unwrap().is_some());
    assert!(!client.is_estab());
}
