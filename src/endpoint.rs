//! Connection URL parsing
//!
//! An [`Endpoint`] is a resolved socket address plus the transport kind the
//! URL declared. The accepted grammar is `<scheme>://<ip>:<port>`, with IPv6
//! literals in brackets:
//!
//! ```
//! use gonet::endpoint::{Endpoint, Proto};
//!
//! let ep: Endpoint = "tcp://127.0.0.1:4000".parse()?;
//! assert_eq!(ep.proto(), Proto::Tcp);
//! assert_eq!(ep.port(), 4000);
//!
//! let v6 = Endpoint::from_url("udp://[::1]:53")?;
//! assert_eq!(v6.to_string(), "udp://[::1]:53");
//! # Ok::<(), gonet::NetError>(())
//! ```
//!
//! Host names are not resolved. A well-formed URL with an unknown scheme
//! parses to [`Proto::Unknown`]; rejecting it is the facade's job.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use crate::error::{NetError, Result};

/// Transport kind declared by a URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Proto {
    /// Plain TCP (`tcp://`)
    Tcp,
    /// UDP datagrams (`udp://`)
    Udp,
    /// TLS over TCP (`ssl://` or `tls://`)
    Ssl,
    /// Any other scheme
    #[default]
    Unknown,
}

impl Proto {
    /// Map a URL scheme to a transport kind (case-insensitive)
    pub fn from_scheme(scheme: &str) -> Proto {
        match scheme.to_ascii_lowercase().as_str() {
            "tcp" => Proto::Tcp,
            "udp" => Proto::Udp,
            "ssl" | "tls" => Proto::Ssl,
            _ => Proto::Unknown,
        }
    }

    /// Canonical scheme string
    pub fn as_str(&self) -> &'static str {
        match self {
            Proto::Tcp => "tcp",
            Proto::Udp => "udp",
            Proto::Ssl => "ssl",
            Proto::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed network address plus declared transport kind
///
/// `Endpoint::default()` is the empty endpoint (`Proto::Unknown`,
/// `0.0.0.0:0`), returned by introspection calls when nothing is connected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    proto: Proto,
    addr: SocketAddr,
    // Scheme as written when it did not map to a known proto, for error reporting
    scheme: Option<Box<str>>,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            proto: Proto::Unknown,
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            scheme: None,
        }
    }
}

impl Endpoint {
    /// Create an endpoint from its parts
    pub fn new(proto: Proto, addr: SocketAddr) -> Self {
        Self {
            proto,
            addr,
            scheme: None,
        }
    }

    /// Parse a connection URL
    ///
    /// # Errors
    ///
    /// - [`NetError::InvalidUrl`] - Missing `://`, empty scheme, host that
    ///   is not an IP literal, or a missing/invalid port
    pub fn from_url(url: &str) -> Result<Self> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| NetError::InvalidUrl(format!("missing scheme in {url:?}")))?;

        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(NetError::InvalidUrl(format!("bad scheme in {url:?}")));
        }

        // Anything after the authority is ignored
        let authority = rest.split(['/', '?']).next().unwrap_or_default();

        let addr = SocketAddr::from_str(authority)
            .map_err(|e| NetError::InvalidUrl(format!("bad address in {url:?}: {e}")))?;

        let proto = Proto::from_scheme(scheme);
        let scheme = (proto == Proto::Unknown).then(|| scheme.into());

        Ok(Self {
            proto,
            addr,
            scheme,
        })
    }

    /// Declared transport kind
    pub fn proto(&self) -> Proto {
        self.proto
    }

    /// Scheme as written in the URL
    pub fn scheme(&self) -> &str {
        match &self.scheme {
            Some(s) => s,
            None => self.proto.as_str(),
        }
    }

    /// Socket address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// IP address
    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    /// Port number
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Same transport kind with a different address
    ///
    /// Used to record the address a transport actually bound or connected
    /// to, e.g. after the OS assigned an ephemeral port.
    pub fn with_addr(&self, addr: SocketAddr) -> Self {
        Self {
            addr,
            ..self.clone()
        }
    }

    /// True for the empty endpoint returned when nothing is connected
    pub fn is_empty(&self) -> bool {
        *self == Endpoint::default()
    }
}

impl FromStr for Endpoint {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self> {
        Endpoint::from_url(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme(), self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_schemes() {
        assert_eq!(Endpoint::from_url("tcp://1.2.3.4:80").unwrap().proto(), Proto::Tcp);
        assert_eq!(Endpoint::from_url("udp://1.2.3.4:80").unwrap().proto(), Proto::Udp);
        assert_eq!(Endpoint::from_url("ssl://1.2.3.4:80").unwrap().proto(), Proto::Ssl);
        assert_eq!(Endpoint::from_url("TLS://1.2.3.4:80").unwrap().proto(), Proto::Ssl);
    }

    #[test]
    fn test_unknown_scheme_is_not_a_parse_error() {
        let ep = Endpoint::from_url("http://10.0.0.1:8080").unwrap();
        assert_eq!(ep.proto(), Proto::Unknown);
        assert_eq!(ep.scheme(), "http");
        assert_eq!(ep.to_string(), "http://10.0.0.1:8080");
    }

    #[test]
    fn test_parse_errors() {
        assert!(Endpoint::from_url("127.0.0.1:80").is_err());
        assert!(Endpoint::from_url("://127.0.0.1:80").is_err());
        assert!(Endpoint::from_url("tcp://localhost:80").is_err());
        assert!(Endpoint::from_url("tcp://127.0.0.1").is_err());
        assert!(Endpoint::from_url("tcp://127.0.0.1:99999").is_err());
        assert!(Endpoint::from_url("t-p://127.0.0.1:80").is_err());
    }

    #[test]
    fn test_ipv6_and_trailing_path() {
        let ep = Endpoint::from_url("tcp://[::1]:9000/ignored?x=1").unwrap();
        assert!(ep.ip().is_ipv6());
        assert_eq!(ep.port(), 9000);
        assert_eq!(ep.to_string(), "tcp://[::1]:9000");
    }

    #[test]
    fn test_default_is_empty() {
        let ep = Endpoint::default();
        assert!(ep.is_empty());
        assert_eq!(ep.proto(), Proto::Unknown);
        assert_eq!(ep.port(), 0);
    }

    #[test]
    fn test_with_addr_keeps_proto() {
        let ep = Endpoint::from_url("ssl://127.0.0.1:0").unwrap();
        let bound = ep.with_addr("127.0.0.1:4433".parse().unwrap());
        assert_eq!(bound.proto(), Proto::Ssl);
        assert_eq!(bound.port(), 4433);
        assert!(!bound.is_empty());
    }
}
