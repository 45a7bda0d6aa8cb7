//! Integration tests for option propagation from the facades into live
//! transports and sessions

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gonet::{Client, Configure, NetError, OptionsData, OptionsUser, Server};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_callback_replaced_after_sessions_exist() {
    let mut server = Server::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let first = tx.clone();
    server.set_receive_cb(move |_, data| {
        let _ = first.send(("first", data.to_vec()));
        data.len()
    });
    server.start("tcp://127.0.0.1:0").await.unwrap();

    let client = Client::new();
    client.connect(&server.local_addr().to_string()).await.unwrap();

    client.send_no_delay_slice(b"one", None);
    assert_eq!(
        timeout(WAIT, rx.recv()).await.unwrap().unwrap(),
        ("first", b"one".to_vec())
    );

    // The accepted session picks up the new callback through the tree
    server.set_receive_cb(move |_, data| {
        let _ = tx.send(("second", data.to_vec()));
        data.len()
    });
    client.send_no_delay_slice(b"two", None);
    assert_eq!(
        timeout(WAIT, rx.recv()).await.unwrap().unwrap(),
        ("second", b"two".to_vec())
    );
}

#[tokio::test]
async fn test_unconsumed_bytes_stay_buffered() {
    let mut server = Server::new();
    let (tx, mut rx) = mpsc::unbounded_channel();

    // Consume whole 4-byte frames only
    server.set_receive_cb(move |_, data| {
        let frames = data.len() / 4;
        for frame in data.chunks_exact(4) {
            let _ = tx.send(frame.to_vec());
        }
        frames * 4
    });
    server.start("tcp://127.0.0.1:0").await.unwrap();

    let client = Client::new();
    client.connect(&server.local_addr().to_string()).await.unwrap();

    client.send_no_delay_slice(b"abcdef", None);
    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap(), b"abcd");

    client.send_no_delay_slice(b"gh", None);
    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap(), b"efgh");
}

#[tokio::test]
async fn test_oversized_unconsumed_buffer_closes_session() {
    let mut server = Server::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    server
        .set_max_pack_size(8)
        .set_receive_cb(|_, _| 0)
        .set_disconnected_cb(move |_, reason| {
            let _ = tx.send(matches!(reason, NetError::PacketTooLarge { max: 8, .. }));
        });
    server.start("tcp://127.0.0.1:0").await.unwrap();

    let client = Client::new();
    client.connect(&server.local_addr().to_string()).await.unwrap();
    client.send_no_delay_slice(&[0u8; 32], None);

    assert!(timeout(WAIT, rx.recv()).await.unwrap().unwrap());
}

#[tokio::test]
async fn test_with_options_seeds_transports() {
    let user = OptionsUser {
        max_connection: 3,
        ..Default::default()
    };
    let connected = Arc::new(AtomicUsize::new(0));
    let counter = connected.clone();

    let mut data = OptionsData::from_user(user);
    data.connect_cb = Some(Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let mut server = Server::with_options(data);
    assert_eq!(server.options().max_connection(), 3);
    server.start("tcp://127.0.0.1:0").await.unwrap();

    let client = Client::new();
    client.connect(&server.local_addr().to_string()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(connected.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_send_timeout_bounds_connect() {
    // 192.0.2.0/24 is reserved for documentation and never routed
    let client = Client::new();
    client.set_send_timeout(Some(Duration::from_millis(200)));

    let result = timeout(WAIT, client.connect("tcp://192.0.2.1:9")).await.unwrap();
    assert!(matches!(result, Err(NetError::Timeout) | Err(NetError::Io(_))));
    assert!(!client.is_estab());
}
