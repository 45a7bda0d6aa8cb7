//! Error types for network facade operations
//!
//! This module defines every error the facades, the options tree and the
//! bundled transports can report. Errors raised by tokio or rustls are
//! surfaced through [`NetError::Io`] and [`NetError::Tls`] without
//! translation.

use thiserror::Error;

/// Network facade error types
///
/// All fallible operations in this library return `Result<T, NetError>`.
/// Send completions report the same type through their callback.
#[derive(Error, Debug)]
pub enum NetError {
    /// The URL declares a transport kind with no registered selector
    ///
    /// This error occurs when:
    /// - The scheme is well-formed but not one of `tcp`, `udp`, `ssl`/`tls`
    ///
    /// The facade is left without a transport when this is returned.
    ///
    /// # Example
    /// ```no_run
    /// # use gonet::error::NetError;
    /// let err = NetError::UnsupportedProtocol("http".to_string());
    /// ```
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// Another `connect` is already in flight on the same client
    ///
    /// The connect guard is non-blocking: the second caller is rejected
    /// immediately and no client state is touched. Callers that want to
    /// wait must retry on their own schedule.
    #[error("Connect already in progress")]
    Connecting,

    /// The client already holds an established session
    ///
    /// Returned by `connect` without replacing the current transport.
    #[error("Connection already established")]
    AlreadyEstablished,

    /// No transport is present, or the session has been shut down
    ///
    /// Sends on a client that never connected (or was shut down) complete
    /// with this error through their callback rather than a return value.
    #[error("Connection shut down")]
    Shutdown,

    /// `start_after_fork` was called without a successful `start_before_fork`
    #[error("Server not started")]
    NotStarted,

    /// The connection URL could not be parsed
    ///
    /// This error occurs when:
    /// - The `scheme://` prefix is missing or the scheme is empty
    /// - The host is not an IPv4/IPv6 literal
    /// - The port is missing or out of range
    ///
    /// # Example
    /// ```no_run
    /// # use gonet::error::NetError;
    /// let err = NetError::InvalidUrl("missing scheme in 127.0.0.1:80".to_string());
    /// ```
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// A packet exceeds the configured maximum packet size
    ///
    /// Raised for outgoing datagrams larger than `max_pack_size`, and for
    /// stream sessions whose unconsumed receive buffer grows past it.
    #[error("Packet too large: {size} bytes (max: {max})")]
    PacketTooLarge {
        /// Actual size in bytes
        size: usize,
        /// Configured maximum in bytes
        max: usize,
    },

    /// A connect or write did not complete within the configured send timeout
    #[error("Operation timed out")]
    Timeout,

    /// TLS configuration or handshake failure
    ///
    /// This error occurs when:
    /// - Certificate or key files are missing or contain no usable PEM data
    /// - The server name is not a valid DNS name or IP address
    /// - The TLS handshake is rejected by the peer
    #[error("TLS error: {0}")]
    Tls(String),

    /// I/O error reported by the operating system
    ///
    /// Bind and connect failures from the transport are surfaced here
    /// verbatim; the facade neither retries nor interprets them.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetError {
    /// Rebuild an equivalent error value
    ///
    /// `std::io::Error` is not `Clone`, so I/O errors are reconstructed from
    /// their kind and message. Used when one failure has to be reported to
    /// several pending send callbacks.
    pub fn duplicate(&self) -> NetError {
        match self {
            NetError::UnsupportedProtocol(s) => NetError::UnsupportedProtocol(s.clone()),
            NetError::Connecting => NetError::Connecting,
            NetError::AlreadyEstablished => NetError::AlreadyEstablished,
            NetError::Shutdown => NetError::Shutdown,
            NetError::NotStarted => NetError::NotStarted,
            NetError::InvalidUrl(s) => NetError::InvalidUrl(s.clone()),
            NetError::PacketTooLarge { size, max } => NetError::PacketTooLarge {
                size: *size,
                max: *max,
            },
            NetError::Timeout => NetError::Timeout,
            NetError::Tls(s) => NetError::Tls(s.clone()),
            NetError::Io(e) => NetError::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }
}

/// Result type alias for network facade operations
pub type Result<T> = std::result::Result<T, NetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            NetError::UnsupportedProtocol("http".into()).to_string(),
            "Unsupported protocol: http"
        );
        assert_eq!(
            NetError::PacketTooLarge { size: 10, max: 4 }.to_string(),
            "Packet too large: 10 bytes (max: 4)"
        );
    }

    #[test]
    fn test_duplicate_preserves_io_kind() {
        let err = NetError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ));
        match err.duplicate() {
            NetError::Io(e) => {
                assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset);
                assert!(e.to_string().contains("reset by peer"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(NetError::Shutdown.duplicate(), NetError::Shutdown));
    }
}
