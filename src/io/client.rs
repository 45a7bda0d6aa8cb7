//! Transport-agnostic client facade
//!
//! [`Client`] parses a URL, creates the transport for its scheme, links its
//! options above it and forwards `connect`. Sends go straight to the
//! current session. Only one `connect` runs at a time: a concurrent call is
//! rejected with [`NetError::Connecting`] instead of waiting.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tracing::{debug, info};

use crate::endpoint::Endpoint;
use crate::error::{NetError, Result};
use crate::io::common::ignore_sigpipe;
use crate::options::{Configure, Options, OptionsData};
use crate::protocol::{select, ClientTransport, Protocol};
use crate::session::{SendCallback, SessionEntry};

#[derive(Default)]
struct ClientState {
    target: Endpoint,
    protocol: Option<&'static dyn Protocol>,
    transport: Option<Arc<dyn ClientTransport>>,
}

/// Connecting endpoint for any supported transport
///
/// `connect` takes `&self`, so a client can be shared between tasks behind
/// an `Arc`.
///
/// # Examples
///
/// ```no_run
/// use gonet::{Client, Configure};
///
/// # async fn run() -> gonet::Result<()> {
/// let client = Client::new();
/// client.set_receive_cb(|_, data| {
///     println!("received {} bytes", data.len());
///     data.len()
/// });
/// client.connect("tcp://127.0.0.1:3030").await?;
/// client.send_slice(b"hello", None);
/// # Ok(())
/// # }
/// ```
pub struct Client {
    options: Options,
    connect_guard: tokio::sync::Mutex<()>,
    state: Mutex<ClientState>,
}

impl Client {
    pub fn new() -> Self {
        Self::with_options(OptionsData::default())
    }

    /// Client whose options start from an explicit snapshot
    pub fn with_options(data: OptionsData) -> Self {
        ignore_sigpipe();
        Self {
            options: Options::with_data(data),
            connect_guard: tokio::sync::Mutex::new(()),
            state: Mutex::new(ClientState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transport(&self) -> Option<Arc<dyn ClientTransport>> {
        self.state().transport.clone()
    }

    /// Connect to `url`
    ///
    /// The transport's own result is returned unchanged.
    ///
    /// # Errors
    ///
    /// - [`NetError::Connecting`] - Another `connect` on this client is in flight
    /// - [`NetError::AlreadyEstablished`] - The current session is still up
    /// - [`NetError::InvalidUrl`] - The URL does not parse
    /// - [`NetError::UnsupportedProtocol`] - The scheme has no transport
    /// - [`NetError::Io`] / [`NetError::Tls`] / [`NetError::Timeout`] - The
    ///   transport failed to connect
    pub async fn connect(&self, url: &str) -> Result<()> {
        let Ok(_guard) = self.connect_guard.try_lock() else {
            debug!(url = url, "Connect rejected, another attempt in progress");
            return Err(NetError::Connecting);
        };

        let (endpoint, transport) = {
            let mut state = self.state();
            if state
                .transport
                .as_ref()
                .is_some_and(|t| t.session().is_estab())
            {
                return Err(NetError::AlreadyEstablished);
            }

            let (endpoint, protocol) = match select(url) {
                Ok(selected) => selected,
                Err(e) => {
                    state.transport = None;
                    return Err(e);
                }
            };

            let transport: Arc<dyn ClientTransport> = Arc::from(protocol.create_client());
            self.options.link(transport.options());

            state.target = endpoint.clone();
            state.protocol = Some(protocol);
            state.transport = Some(transport.clone());
            (endpoint, transport)
        };

        debug!(remote_addr = %endpoint, "Client transport created");
        transport.connect(&endpoint).await
    }

    /// Queue `buf`; the writer may batch it with other queued sends
    ///
    /// Without a transport `cb` is invoked at once with
    /// [`NetError::Shutdown`].
    pub fn send(&self, buf: Bytes, cb: Option<SendCallback>) {
        self.session().send(buf, cb)
    }

    pub fn send_slice(&self, data: &[u8], cb: Option<SendCallback>) {
        self.session().send_slice(data, cb)
    }

    /// Queue `buf` and flush as soon as it is written
    pub fn send_no_delay(&self, buf: Bytes, cb: Option<SendCallback>) {
        self.session().send_no_delay(buf, cb)
    }

    pub fn send_no_delay_slice(&self, data: &[u8], cb: Option<SendCallback>) {
        self.session().send_no_delay_slice(data, cb)
    }

    pub fn is_estab(&self) -> bool {
        self.session().is_estab()
    }

    /// Current session, empty without a transport
    pub fn session(&self) -> SessionEntry {
        self.transport()
            .map(|t| t.session())
            .unwrap_or_default()
    }

    /// Local address of the current session
    pub fn local_addr(&self) -> Endpoint {
        self.session().local_addr()
    }

    /// Peer address of the current session
    pub fn remote_addr(&self) -> Endpoint {
        self.session().remote_addr()
    }

    /// Endpoint parsed from the last accepted `connect` URL
    pub fn target(&self) -> Endpoint {
        self.state().target.clone()
    }

    /// Transport selected by the last `connect`
    pub fn protocol(&self) -> Option<&'static dyn Protocol> {
        self.state().protocol
    }

    /// Drop the transport without waiting for queued sends
    ///
    /// Their callbacks complete with [`NetError::Shutdown`].
    pub fn shutdown(&self) {
        let transport = self.state().transport.take();
        if transport.is_some() {
            info!(remote_addr = %self.target(), "Client shut down");
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Configure for Client {
    fn options(&self) -> &Options {
        &self.options
    }
}
