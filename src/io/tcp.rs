//! TCP and TLS-over-TCP transports
//!
//! One server and one client type serve both `tcp://` and `ssl://`
//! endpoints; TLS is layered on when the endpoint they are started with
//! declares [`Proto::Ssl`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::runtime::Handle;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::endpoint::{Endpoint, Proto};
use crate::error::{NetError, Result};
use crate::io::common::with_timeout;
use crate::io::stream::StreamSession;
use crate::io::tls;
use crate::options::{OptionField, Options};
use crate::protocol::{ClientTransport, ServerTransport};
use crate::session::{Session, SessionEntry};

// Back-off after a failed accept (e.g. EMFILE) before trying again
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Listening side of `tcp://` and `ssl://` endpoints
pub struct TcpServer {
    options: Arc<Options>,
    local: Endpoint,
    listener: Option<TcpListener>,
    acceptor: Option<TlsAcceptor>,
    runtime: Option<Handle>,
    cancel: CancellationToken,
    live: Arc<AtomicUsize>,
    #[cfg(unix)]
    listen_fd: Arc<std::sync::atomic::AtomicI32>,
}

impl TcpServer {
    pub fn new() -> Self {
        let options = Arc::new(Options::new());

        #[cfg(unix)]
        let listen_fd = {
            let listen_fd = Arc::new(std::sync::atomic::AtomicI32::new(-1));
            let fd = listen_fd.clone();
            options.set_observer(move |field, data| {
                if field != OptionField::ListenBacklog {
                    return;
                }
                let raw = fd.load(Ordering::SeqCst);
                if raw < 0 {
                    return;
                }
                let backlog = data.user.listen_backlog;
                match crate::io::common::relisten(raw, backlog) {
                    Ok(()) => debug!(backlog = backlog, "Listen backlog updated"),
                    Err(e) => warn!(backlog = backlog, error = %e, "Failed to update listen backlog"),
                }
            });
            listen_fd
        };

        #[cfg(not(unix))]
        options.set_observer(|field, _| {
            if field == OptionField::ListenBacklog {
                debug!("Listen backlog change applies to the next bind");
            }
        });

        Self {
            options,
            local: Endpoint::default(),
            listener: None,
            acceptor: None,
            runtime: None,
            cancel: CancellationToken::new(),
            live: Arc::new(AtomicUsize::new(0)),
            #[cfg(unix)]
            listen_fd,
        }
    }

    fn bind(&self, endpoint: &Endpoint) -> std::io::Result<TcpListener> {
        let addr = endpoint.addr();
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        socket.listen(self.options.listen_backlog())
    }
}

impl Default for TcpServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        #[cfg(unix)]
        self.listen_fd.store(-1, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

#[async_trait]
impl ServerTransport for TcpServer {
    fn options(&self) -> &Options {
        &self.options
    }

    async fn start_before_fork(&mut self, endpoint: &Endpoint) -> Result<()> {
        self.local = endpoint.clone();

        // Fail on bad TLS material before taking the port
        if endpoint.proto() == Proto::Ssl {
            let config = tls::server_config(&self.options.tls())?;
            self.acceptor = Some(TlsAcceptor::from(config));
        }

        info!(addr = %endpoint, "Binding server");
        let listener = self.bind(endpoint)?;
        let bound = listener.local_addr()?;
        self.local = endpoint.with_addr(bound);

        #[cfg(unix)]
        {
            use std::os::fd::AsRawFd;
            self.listen_fd.store(listener.as_raw_fd(), Ordering::SeqCst);
        }

        self.listener = Some(listener);
        self.runtime = Some(Handle::current());

        info!(
            local_addr = %self.local,
            backlog = self.options.listen_backlog(),
            "Server listening"
        );
        Ok(())
    }

    fn start_after_fork(&mut self) -> Result<()> {
        let (Some(listener), Some(runtime)) = (self.listener.take(), self.runtime.clone()) else {
            warn!("start_after_fork called without a bound listener");
            return Err(NetError::NotStarted);
        };

        info!(local_addr = %self.local, "Accepting connections");

        runtime.spawn(accept_loop(AcceptContext {
            listener,
            acceptor: self.acceptor.clone(),
            options: self.options.clone(),
            local: self.local.clone(),
            cancel: self.cancel.clone(),
            live: self.live.clone(),
            #[cfg(unix)]
            listen_fd: self.listen_fd.clone(),
        }));
        Ok(())
    }

    fn local_addr(&self) -> Endpoint {
        self.local.clone()
    }

    fn session_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

/// One counted connection slot, released on drop unless a session took it
struct Slot(Option<Arc<AtomicUsize>>);

impl Slot {
    fn reserve(live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self(Some(live.clone()))
    }

    fn into_counter(mut self) -> Option<Arc<AtomicUsize>> {
        self.0.take()
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(live) = self.0.take() {
            live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

struct AcceptContext {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    options: Arc<Options>,
    local: Endpoint,
    cancel: CancellationToken,
    live: Arc<AtomicUsize>,
    #[cfg(unix)]
    listen_fd: Arc<std::sync::atomic::AtomicI32>,
}

async fn accept_loop(ctx: AcceptContext) {
    loop {
        let accepted = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            accepted = ctx.listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };

        let max = ctx.options.max_connection();
        if ctx.live.load(Ordering::SeqCst) >= max {
            warn!(peer_addr = %peer, max_connection = max, "Connection limit reached, closing");
            drop(stream);
            continue;
        }

        // Counted from here on, so pending TLS handshakes hold a slot too
        let slot = Slot::reserve(&ctx.live);
        debug!(peer_addr = %peer, "Client connected");

        let local = stream
            .local_addr()
            .map(|addr| ctx.local.with_addr(addr))
            .unwrap_or_else(|_| ctx.local.clone());
        let remote = ctx.local.with_addr(peer);
        let cancel = ctx.cancel.child_token();

        match &ctx.acceptor {
            None => {
                let live = slot.into_counter();
                StreamSession::spawn(stream, local, remote, &ctx.options, cancel, live, |_| {});
            }
            Some(acceptor) => {
                // Handshakes run off the accept loop so a slow peer cannot stall it
                let acceptor = acceptor.clone();
                let options = ctx.options.clone();
                tokio::spawn(async move {
                    let handshake = with_timeout(options.send_timeout(), acceptor.accept(stream));
                    let stream = tokio::select! {
                        _ = cancel.cancelled() => return,
                        stream = handshake => stream,
                    };
                    match stream {
                        Ok(stream) => {
                            trace!(peer_addr = %peer, "TLS handshake complete");
                            let live = slot.into_counter();
                            StreamSession::spawn(stream, local, remote, &options, cancel, live, |_| {});
                        }
                        Err(e) => warn!(peer_addr = %peer, error = %e, "TLS handshake failed"),
                    }
                });
            }
        }
    }

    #[cfg(unix)]
    ctx.listen_fd.store(-1, Ordering::SeqCst);
    debug!(local_addr = %ctx.local, "Accept loop stopped");
}

/// Connecting side of `tcp://` and `ssl://` endpoints
pub struct TcpClient {
    options: Options,
    session: Mutex<SessionEntry>,
    cancel: CancellationToken,
}

impl TcpClient {
    pub fn new() -> Self {
        Self {
            options: Options::new(),
            session: Mutex::new(SessionEntry::default()),
            cancel: CancellationToken::new(),
        }
    }
}

impl Default for TcpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl ClientTransport for TcpClient {
    fn options(&self) -> &Options {
        &self.options
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<()> {
        let timeout = self.options.send_timeout();

        info!(remote_addr = %endpoint, "Connecting");
        let stream = with_timeout(timeout, TcpStream::connect(endpoint.addr())).await?;
        let local = endpoint.with_addr(stream.local_addr()?);
        let remote = endpoint.with_addr(stream.peer_addr()?);
        let cancel = self.cancel.child_token();

        // The entry is stored before the connect callback runs
        let store = |session: &Arc<StreamSession>| {
            *self.session.lock().unwrap_or_else(PoisonError::into_inner) =
                SessionEntry::new(session.clone());
        };

        let session = match endpoint.proto() {
            Proto::Ssl => {
                let tls_options = self.options.tls();
                let connector = TlsConnector::from(tls::client_config(&tls_options)?);
                let name = tls::server_name(&tls_options, endpoint)?;

                let stream = with_timeout(timeout, connector.connect(name, stream))
                    .await
                    .map_err(|e| match e {
                        NetError::Io(e) => NetError::Tls(format!("TLS handshake failed: {}", e)),
                        other => other,
                    })?;
                StreamSession::spawn(stream, local, remote, &self.options, cancel, None, store)
            }
            _ => StreamSession::spawn(stream, local, remote, &self.options, cancel, None, store),
        };

        info!(
            local_addr = %session.local_addr(),
            remote_addr = %endpoint,
            "Connection established"
        );
        Ok(())
    }

    fn session(&self) -> SessionEntry {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
