//! UDP transports
//!
//! A UDP server owns one socket and demultiplexes datagrams into per-peer
//! sessions, created when a peer's first datagram arrives. A UDP client
//! binds an ephemeral socket, `connect`s it to the peer and is established
//! right away. Every datagram is handed to the receive callback on its own;
//! nothing is buffered across datagrams.
//!
//! Server sessions close with [`NetError::Timeout`] once their peer has been
//! silent for the `udp_idle_timeout` option, so one-shot peers do not pile
//! up in the table.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::endpoint::Endpoint;
use crate::error::{NetError, Result};
use crate::io::common::{enqueue, fail_queued, with_timeout, Outgoing, MAX_UDP_DATAGRAM_SIZE};
use crate::options::Options;
use crate::protocol::{ClientTransport, ServerTransport};
use crate::session::{complete, SendCallback, Session, SessionEntry};

type PeerMap = Mutex<HashMap<SocketAddr, Arc<UdpSession>>>;

/// One peer of a UDP socket
struct UdpSession {
    options: Options,
    socket: Arc<UdpSocket>,
    tx: mpsc::UnboundedSender<Outgoing>,
    cancel: CancellationToken,
    disconnected: AtomicBool,
    // Server sessions remove themselves from the demultiplexing table
    peers: Option<Weak<PeerMap>>,
    last_seen: Mutex<Instant>,
    local: Endpoint,
    remote: Endpoint,
}

impl UdpSession {
    fn spawn(
        socket: Arc<UdpSocket>,
        local: Endpoint,
        remote: Endpoint,
        parent: &Options,
        cancel: CancellationToken,
        peers: Option<Weak<PeerMap>>,
    ) -> Arc<UdpSession> {
        let options = Options::new();
        parent.link(&options);

        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(UdpSession {
            options,
            socket,
            tx,
            cancel,
            disconnected: AtomicBool::new(false),
            peers,
            last_seen: Mutex::new(Instant::now()),
            local,
            remote,
        });

        debug!(local = %session.local, remote = %session.remote, "UDP session established");

        tokio::spawn(send_loop(session.clone(), rx));
        session
    }

    fn entry(self: &Arc<Self>) -> SessionEntry {
        SessionEntry::new(self.clone())
    }

    fn deliver(self: &Arc<Self>, datagram: &[u8]) {
        trace!(remote = %self.remote, bytes = datagram.len(), "Received datagram");
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
        if let Some(cb) = self.options.receive_cb() {
            cb(self.entry(), datagram);
        }
    }

    fn close(self: &Arc<Self>, reason: NetError) {
        self.cancel.cancel();

        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(peers) = self.peers.as_ref().and_then(Weak::upgrade) {
            let mut peers = peers.lock().unwrap_or_else(PoisonError::into_inner);
            let addr = self.remote.addr();
            // The peer may already have a newer session under the same address
            if peers.get(&addr).is_some_and(|s| Arc::ptr_eq(s, self)) {
                peers.remove(&addr);
            }
        }

        debug!(remote = %self.remote, reason = %reason, "UDP session closed");

        if let Some(cb) = self.options.disconnect_cb() {
            cb(self.entry(), &reason);
        }
    }

    /// When a server session expires if nothing more arrives
    fn idle_deadline(&self) -> Option<Instant> {
        self.peers.as_ref()?;
        let timeout = self.options.udp_idle_timeout()?;
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .checked_add(timeout)
    }

    fn push(&self, buf: Bytes, no_delay: bool, cb: Option<SendCallback>) {
        if self.cancel.is_cancelled() {
            complete(cb, Err(NetError::Shutdown));
            return;
        }

        let max = self.options.max_pack_size().min(MAX_UDP_DATAGRAM_SIZE);
        if buf.len() > max {
            complete(cb, Err(NetError::PacketTooLarge { size: buf.len(), max }));
            return;
        }

        enqueue(&self.tx, Outgoing { buf, no_delay, cb });
    }
}

impl Session for UdpSession {
    fn is_estab(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    // Datagrams go out one by one, so both send flavours behave alike
    fn send(&self, buf: Bytes, cb: Option<SendCallback>) {
        self.push(buf, false, cb);
    }

    fn send_no_delay(&self, buf: Bytes, cb: Option<SendCallback>) {
        self.push(buf, true, cb);
    }

    fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn local_addr(&self) -> Endpoint {
        self.local.clone()
    }

    fn remote_addr(&self) -> Endpoint {
        self.remote.clone()
    }
}

async fn send_loop(session: Arc<UdpSession>, mut rx: mpsc::UnboundedReceiver<Outgoing>) {
    let connected = session.peers.is_none();
    let peer = session.remote.addr();

    loop {
        let msg = tokio::select! {
            _ = session.cancel.cancelled() => break,
            _ = idle_expiry(session.idle_deadline()) => {
                // A datagram may have moved the deadline while we slept
                if session.idle_deadline().is_some_and(|d| d <= Instant::now()) {
                    debug!(remote = %session.remote, "UDP session idle, closing");
                    session.close(NetError::Timeout);
                    break;
                }
                continue;
            }
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let timeout = session.options.send_timeout();
        let result = if connected {
            with_timeout(timeout, session.socket.send(&msg.buf)).await
        } else {
            with_timeout(timeout, session.socket.send_to(&msg.buf, peer)).await
        };

        match result {
            Ok(sent) => {
                trace!(remote = %session.remote, bytes = sent, "Sent datagram");
                complete(msg.cb, Ok(()));
            }
            Err(e) => {
                warn!(remote = %session.remote, error = %e, "Datagram send failed");
                complete(msg.cb, Err(e.duplicate()));
                session.close(e);
                break;
            }
        }
    }

    fail_queued(&mut rx);
    session.close(NetError::Shutdown);
}

async fn idle_expiry(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Listening side of `udp://` endpoints
pub struct UdpServer {
    options: Arc<Options>,
    local: Endpoint,
    socket: Option<Arc<UdpSocket>>,
    runtime: Option<Handle>,
    peers: Arc<PeerMap>,
    cancel: CancellationToken,
}

impl UdpServer {
    pub fn new() -> Self {
        Self {
            options: Arc::new(Options::new()),
            local: Endpoint::default(),
            socket: None,
            runtime: None,
            peers: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
        }
    }
}

impl Default for UdpServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for UdpServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl ServerTransport for UdpServer {
    fn options(&self) -> &Options {
        &self.options
    }

    async fn start_before_fork(&mut self, endpoint: &Endpoint) -> Result<()> {
        self.local = endpoint.clone();

        info!(addr = %endpoint, "Binding UDP server");
        let socket = UdpSocket::bind(endpoint.addr()).await?;
        self.local = endpoint.with_addr(socket.local_addr()?);
        self.socket = Some(Arc::new(socket));
        self.runtime = Some(Handle::current());

        info!(local_addr = %self.local, "UDP server bound");
        Ok(())
    }

    fn start_after_fork(&mut self) -> Result<()> {
        let (Some(socket), Some(runtime)) = (self.socket.take(), self.runtime.clone()) else {
            warn!("start_after_fork called without a bound socket");
            return Err(NetError::NotStarted);
        };

        info!(local_addr = %self.local, "Receiving datagrams");

        runtime.spawn(server_recv_loop(
            socket,
            self.local.clone(),
            self.options.clone(),
            self.peers.clone(),
            self.cancel.clone(),
        ));
        Ok(())
    }

    fn local_addr(&self) -> Endpoint {
        self.local.clone()
    }

    fn session_count(&self) -> usize {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

async fn server_recv_loop(
    socket: Arc<UdpSocket>,
    local: Endpoint,
    options: Arc<Options>,
    peers: Arc<PeerMap>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_UDP_DATAGRAM_SIZE];

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };

        let (len, peer) = match received {
            Ok(received) => received,
            Err(e) => {
                // ICMP errors from earlier sends surface here; the socket stays usable
                debug!(error = %e, "UDP receive error");
                continue;
            }
        };

        // A session that is closing counts as gone
        let existing = peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&peer)
            .filter(|session| session.is_estab())
            .cloned();

        let session = match existing {
            Some(session) => session,
            None => {
                let max = options.max_connection();
                let count = peers.lock().unwrap_or_else(PoisonError::into_inner).len();
                if count >= max {
                    warn!(peer_addr = %peer, max_connection = max, "Peer limit reached, dropping datagram");
                    continue;
                }

                let session = UdpSession::spawn(
                    socket.clone(),
                    local.clone(),
                    local.with_addr(peer),
                    &options,
                    cancel.child_token(),
                    Some(Arc::downgrade(&peers)),
                );
                peers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(peer, session.clone());

                if let Some(cb) = session.options.connect_cb() {
                    cb(session.entry());
                }
                session
            }
        };

        session.deliver(&buf[..len]);
    }

    debug!(local_addr = %local, "UDP receive loop stopped");
}

/// Connecting side of `udp://` endpoints
pub struct UdpClient {
    options: Options,
    session: Mutex<SessionEntry>,
    cancel: CancellationToken,
}

impl UdpClient {
    pub fn new() -> Self {
        Self {
            options: Options::new(),
            session: Mutex::new(SessionEntry::default()),
            cancel: CancellationToken::new(),
        }
    }
}

impl Default for UdpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for UdpClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl ClientTransport for UdpClient {
    fn options(&self) -> &Options {
        &self.options
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<()> {
        let peer = endpoint.addr();
        let bind: SocketAddr = if peer.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = UdpSocket::bind(bind).await?;
        socket.connect(peer).await?;
        let local = endpoint.with_addr(socket.local_addr()?);
        let socket = Arc::new(socket);

        let session = UdpSession::spawn(
            socket.clone(),
            local,
            endpoint.clone(),
            &self.options,
            self.cancel.child_token(),
            None,
        );

        info!(local_addr = %session.local, remote_addr = %endpoint, "UDP client ready");

        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = session.entry();

        if let Some(cb) = session.options.connect_cb() {
            cb(session.entry());
        }

        tokio::spawn(client_recv_loop(session, socket));
        Ok(())
    }

    fn session(&self) -> SessionEntry {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

async fn client_recv_loop(session: Arc<UdpSession>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; MAX_UDP_DATAGRAM_SIZE];

    loop {
        let received = tokio::select! {
            _ = session.cancel.cancelled() => break,
            received = socket.recv(&mut buf) => received,
        };

        match received {
            Ok(len) => session.deliver(&buf[..len]),
            Err(e) => debug!(remote = %session.remote, error = %e, "UDP receive error"),
        }
    }

    session.close(NetError::Shutdown);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_server_creates_session_per_peer() {
        let mut server = UdpServer::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        server.options().set_receive_cb(move |session, data| {
            let _ = tx.send((session.remote_addr().addr(), data.to_vec()));
            data.len()
        });

        let endpoint = Endpoint::from_url("udp://127.0.0.1:0").unwrap();
        server.start(&endpoint).await.unwrap();
        let addr = server.local_addr().addr();

        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.send_to(b"from a", addr).await.unwrap();
        b.send_to(b"from b", addr).await.unwrap();

        let mut got = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        got.sort();
        let mut want = vec![
            (a.local_addr().unwrap(), b"from a".to_vec()),
            (b.local_addr().unwrap(), b"from b".to_vec()),
        ];
        want.sort();
        assert_eq!(got, want);
        assert_eq!(server.session_count(), 2);
    }

    #[tokio::test]
    async fn test_server_peer_limit() {
        let mut server = UdpServer::new();
        server.options().set_max_connection(1);
        let endpoint = Endpoint::from_url("udp://127.0.0.1:0").unwrap();
        server.start(&endpoint).await.unwrap();
        let addr = server.local_addr().addr();

        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.send_to(b"1", addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        b.send_to(b"2", addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(server.session_count(), 1);
    }

    #[tokio::test]
    async fn test_start_after_fork_needs_bound_socket() {
        let mut server = UdpServer::new();
        assert_err!(server.start_after_fork());

        let endpoint = Endpoint::from_url("udp://127.0.0.1:0").unwrap();
        assert_ok!(server.start(&endpoint).await);
        assert!(matches!(
            assert_err!(server.start_after_fork()),
            NetError::NotStarted
        ));
    }

    #[tokio::test]
    async fn test_idle_peer_sessions_expire() {
        let mut server = UdpServer::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        server
            .options()
            .set_udp_idle_timeout(Some(Duration::from_millis(100)))
            .set_disconnected_cb(move |_, reason| {
                let _ = tx.send(matches!(reason, NetError::Timeout));
            });

        let endpoint = Endpoint::from_url("udp://127.0.0.1:0").unwrap();
        assert_ok!(server.start(&endpoint).await);
        let addr = server.local_addr().addr();

        // One-shot peers that never come back
        for _ in 0..16 {
            let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            peer.send_to(b"once", addr).await.unwrap();
        }

        for _ in 0..16 {
            let expired = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(expired);
        }
        assert_eq!(server.session_count(), 0);
    }

    #[tokio::test]
    async fn test_active_peer_session_is_kept() {
        let mut server = UdpServer::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        server
            .options()
            .set_udp_idle_timeout(Some(Duration::from_millis(200)))
            .set_disconnected_cb(move |_, _| {
                let _ = tx.send(());
            });

        let endpoint = Endpoint::from_url("udp://127.0.0.1:0").unwrap();
        assert_ok!(server.start(&endpoint).await);
        let addr = server.local_addr().addr();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for _ in 0..10 {
            peer.send_to(b"tick", addr).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert_eq!(server.session_count(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_client_rejects_oversized_datagram() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpClient::new();
        client.options().set_max_pack_size(4);

        let endpoint =
            Endpoint::from_url(&format!("udp://{}", peer.local_addr().unwrap())).unwrap();
        client.connect(&endpoint).await.unwrap();
        assert!(client.session().is_estab());

        let (tx, rx) = tokio::sync::oneshot::channel();
        client
            .session()
            .send_slice(b"too long", Some(Box::new(move |r: Result<()>| drop(tx.send(r)))));
        assert!(matches!(
            rx.await.unwrap(),
            Err(NetError::PacketTooLarge { size: 8, max: 4 })
        ));

        client.session().send_slice(b"ok", None);
        let mut buf = [0u8; 16];
        let n = peer.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ok");
    }

    #[tokio::test]
    async fn test_shutdown_fires_disconnect_once() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpClient::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.options().set_disconnected_cb(move |_, reason| {
            let _ = tx.send(matches!(reason, NetError::Shutdown));
        });

        let endpoint =
            Endpoint::from_url(&format!("udp://{}", peer.local_addr().unwrap())).unwrap();
        client.connect(&endpoint).await.unwrap();

        let session = client.session();
        session.shutdown();
        session.shutdown();

        assert!(rx.recv().await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
        assert!(!session.is_estab());
    }
}
