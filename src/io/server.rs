//! Transport-agnostic server facade
//!
//! [`Server`] parses a listen URL, picks the transport for its scheme and
//! owns the transport object it creates. The facade's own [`Options`] node
//! is linked above that object, so settings made on the server before or
//! after start reach the transport and every session it accepts.

use tracing::{debug, info};

use crate::endpoint::Endpoint;
use crate::error::{NetError, Result};
use crate::io::common::ignore_sigpipe;
use crate::options::{Configure, Options, OptionsData};
use crate::protocol::{select, Protocol, ServerTransport};

/// Listening endpoint for any supported transport
///
/// # Examples
///
/// ```no_run
/// use gonet::{Configure, Server};
///
/// # async fn run() -> gonet::Result<()> {
/// let mut server = Server::new();
/// server.set_receive_cb(|session, data| {
///     session.send_slice(data, None);
///     data.len()
/// });
/// server.start("tcp://0.0.0.0:3030").await?;
/// println!("listening on {}", server.local_addr());
/// # Ok(())
/// # }
/// ```
pub struct Server {
    options: Options,
    local_addr: Endpoint,
    protocol: Option<&'static dyn Protocol>,
    transport: Option<Box<dyn ServerTransport>>,
}

impl Server {
    pub fn new() -> Self {
        Self::with_options(OptionsData::default())
    }

    /// Server whose options start from an explicit snapshot
    pub fn with_options(data: OptionsData) -> Self {
        ignore_sigpipe();
        Self {
            options: Options::with_data(data),
            local_addr: Endpoint::default(),
            protocol: None,
            transport: None,
        }
    }

    /// Bind the listening resource without accepting connections
    ///
    /// Pair with [`start_after_fork`](Self::start_after_fork) once worker
    /// processes have been forked. On success [`local_addr`](Self::local_addr)
    /// reports the address actually bound.
    ///
    /// # Arguments
    ///
    /// * `url` - Listen URL such as `tcp://0.0.0.0:3030` or `udp://[::]:0`
    ///
    /// # Errors
    ///
    /// - [`NetError::InvalidUrl`] - The URL does not parse
    /// - [`NetError::UnsupportedProtocol`] - The scheme has no transport
    /// - [`NetError::Io`] / [`NetError::Tls`] - The transport failed to bind
    pub async fn start_before_fork(&mut self, url: &str) -> Result<()> {
        let (endpoint, mut transport) = self.prepare(url)?;
        let result = transport.start_before_fork(&endpoint).await;
        self.install(transport, &result);
        result
    }

    /// Begin accepting on the resource bound by
    /// [`start_before_fork`](Self::start_before_fork)
    ///
    /// Must run inside the same tokio runtime the bind ran in.
    ///
    /// # Errors
    ///
    /// - [`NetError::NotStarted`] - Nothing was bound, the bind failed, or
    ///   accepting already started
    pub fn start_after_fork(&mut self) -> Result<()> {
        self.transport
            .as_mut()
            .ok_or(NetError::NotStarted)?
            .start_after_fork()
    }

    /// Bind and begin accepting in one step
    ///
    /// # Errors
    ///
    /// Same as [`start_before_fork`](Self::start_before_fork).
    pub async fn start(&mut self, url: &str) -> Result<()> {
        let (endpoint, mut transport) = self.prepare(url)?;
        let result = transport.start(&endpoint).await;
        self.install(transport, &result);
        result
    }

    /// Drop the transport, closing the listener and its sessions
    ///
    /// Safe to call any number of times.
    pub fn shutdown(&mut self) {
        if self.transport.take().is_some() {
            info!(local_addr = %self.local_addr, "Server shut down");
        }
    }

    /// Bound address after a start, otherwise the last requested endpoint
    pub fn local_addr(&self) -> Endpoint {
        self.local_addr.clone()
    }

    /// Transport selected by the last start attempt
    pub fn protocol(&self) -> Option<&'static dyn Protocol> {
        self.protocol
    }

    /// Whether a transport is bound, accepting or not
    pub fn is_running(&self) -> bool {
        self.transport.is_some()
    }

    /// Live sessions on the current transport
    pub fn session_count(&self) -> usize {
        self.transport.as_ref().map_or(0, |t| t.session_count())
    }

    // Any previous transport is released before the URL is even parsed, so a
    // failed attempt leaves the server stopped.
    fn prepare(&mut self, url: &str) -> Result<(Endpoint, Box<dyn ServerTransport>)> {
        self.transport = None;

        let (endpoint, protocol) = select(url)?;
        self.local_addr = endpoint.clone();
        self.protocol = Some(protocol);

        let transport = protocol.create_server();
        self.options.link(transport.options());

        debug!(addr = %endpoint, protocol = protocol.name(), "Server transport created");
        Ok((endpoint, transport))
    }

    // Only a transport that bound is kept; `local_addr` still reports the
    // endpoint the failed attempt asked for.
    fn install(&mut self, transport: Box<dyn ServerTransport>, result: &Result<()>) {
        self.local_addr = transport.local_addr();
        match result {
            Ok(()) => self.transport = Some(transport),
            Err(e) => debug!(addr = %self.local_addr, error = %e, "Server start failed"),
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Configure for Server {
    fn options(&self) -> &Options {
        &self.options
    }
}
