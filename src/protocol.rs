//! Transport selection
//!
//! A [`Protocol`] is a factory for one transport kind. The facades map the
//! scheme of a URL to a selector with [`protocol_for`] and ask it for a fresh
//! [`ServerTransport`] or [`ClientTransport`] on every start or connect.
//! TLS endpoints share the TCP selector; the TCP transports switch to TLS
//! when the endpoint they are started with is `ssl://`.

use std::fmt;

use async_trait::async_trait;

use crate::endpoint::{Endpoint, Proto};
use crate::error::{NetError, Result};
use crate::io::tcp::{TcpClient, TcpServer};
use crate::io::udp::{UdpClient, UdpServer};
use crate::options::Options;
use crate::session::SessionEntry;

/// Transport-specific server implementation driven by [`Server`](crate::Server)
#[async_trait]
pub trait ServerTransport: Send + Sync {
    /// The transport's options node, linked below the facade's node
    fn options(&self) -> &Options;

    /// Bind the listening resource without accepting yet
    async fn start_before_fork(&mut self, endpoint: &Endpoint) -> Result<()>;

    /// Begin accepting on the resource bound by `start_before_fork`
    ///
    /// The bound resource is handed to the accept task, so a second call
    /// fails like a call without a bind.
    ///
    /// # Errors
    ///
    /// - [`NetError::NotStarted`] - No bound resource is held
    fn start_after_fork(&mut self) -> Result<()>;

    /// Bind and begin accepting
    async fn start(&mut self, endpoint: &Endpoint) -> Result<()> {
        self.start_before_fork(endpoint).await?;
        self.start_after_fork()
    }

    /// Address actually bound, or the requested endpoint before binding
    fn local_addr(&self) -> Endpoint;

    /// Number of live sessions
    fn session_count(&self) -> usize;
}

/// Transport-specific client implementation driven by [`Client`](crate::Client)
#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// The transport's options node, linked below the facade's node
    fn options(&self) -> &Options;

    /// Establish a session with `endpoint`
    async fn connect(&self, endpoint: &Endpoint) -> Result<()>;

    /// Current session, empty until `connect` succeeds
    fn session(&self) -> SessionEntry;
}

/// Factory for the transport objects of one transport kind
pub trait Protocol: Send + Sync + fmt::Debug {
    /// Short name of the transport kind
    fn name(&self) -> &'static str;

    fn create_server(&self) -> Box<dyn ServerTransport>;

    fn create_client(&self) -> Box<dyn ClientTransport>;
}

/// Selector for TCP and TLS-over-TCP
#[derive(Debug)]
pub struct Tcp;

/// Selector for UDP
#[derive(Debug)]
pub struct Udp;

pub static TCP: Tcp = Tcp;
pub static UDP: Udp = Udp;

impl Protocol for Tcp {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn create_server(&self) -> Box<dyn ServerTransport> {
        Box::new(TcpServer::new())
    }

    fn create_client(&self) -> Box<dyn ClientTransport> {
        Box::new(TcpClient::new())
    }
}

impl Protocol for Udp {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn create_server(&self) -> Box<dyn ServerTransport> {
        Box::new(UdpServer::new())
    }

    fn create_client(&self) -> Box<dyn ClientTransport> {
        Box::new(UdpClient::new())
    }
}

/// Selector registered for a transport kind
pub fn protocol_for(proto: Proto) -> Option<&'static dyn Protocol> {
    match proto {
        Proto::Tcp | Proto::Ssl => Some(&TCP),
        Proto::Udp => Some(&UDP),
        Proto::Unknown => None,
    }
}

/// Parse `url` and pick its selector
///
/// # Errors
///
/// - [`NetError::InvalidUrl`] - The URL does not parse
/// - [`NetError::UnsupportedProtocol`] - No selector for the scheme
pub(crate) fn select(url: &str) -> Result<(Endpoint, &'static dyn Protocol)> {
    let endpoint = Endpoint::from_url(url)?;
    let protocol = protocol_for(endpoint.proto())
        .ok_or_else(|| NetError::UnsupportedProtocol(endpoint.scheme().to_string()))?;
    Ok((endpoint, protocol))
}
