//! Established connection handle
//!
//! A [`Session`] is one logical connection produced by a transport: an
//! accepted TCP/TLS stream, a connected client stream, or a UDP peer. The
//! facades only ever talk to sessions through [`SessionEntry`], which may
//! also be empty when nothing is connected.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::endpoint::Endpoint;
use crate::error::{NetError, Result};

/// Completion callback for a send
///
/// Invoked exactly once, with `Ok(())` after the data was handed to the
/// operating system, or with the error that prevented it.
pub type SendCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// One logical connection
pub trait Session: Send + Sync {
    /// Whether the session is currently established
    fn is_estab(&self) -> bool;

    /// Queue `buf` for delivery; the transport may batch queued sends
    fn send(&self, buf: Bytes, cb: Option<SendCallback>);

    /// Queue `buf` for delivery and flush without waiting for more data
    fn send_no_delay(&self, buf: Bytes, cb: Option<SendCallback>);

    /// Close the session; queued sends complete with [`NetError::Shutdown`]
    fn shutdown(&self);

    fn local_addr(&self) -> Endpoint;

    fn remote_addr(&self) -> Endpoint;
}

/// Shared, possibly empty, reference to a session
///
/// The empty entry behaves like a closed session: it is never established,
/// reports default endpoints, and completes sends with
/// [`NetError::Shutdown`].
#[derive(Clone, Default)]
pub struct SessionEntry(Option<Arc<dyn Session>>);

impl SessionEntry {
    pub fn new(session: Arc<dyn Session>) -> Self {
        Self(Some(session))
    }

    /// True when no session is referenced
    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// The referenced session, if any
    pub fn get(&self) -> Option<&Arc<dyn Session>> {
        self.0.as_ref()
    }

    /// Whether both entries reference the same session
    pub fn ptr_eq(&self, other: &SessionEntry) -> bool {
        match (&self.0, &other.0) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn is_estab(&self) -> bool {
        self.0.as_ref().is_some_and(|s| s.is_estab())
    }

    pub fn send(&self, buf: Bytes, cb: Option<SendCallback>) {
        match &self.0 {
            Some(session) => session.send(buf, cb),
            None => complete(cb, Err(NetError::Shutdown)),
        }
    }

    /// Copying variant of [`send`](Self::send)
    pub fn send_slice(&self, data: &[u8], cb: Option<SendCallback>) {
        self.send(Bytes::copy_from_slice(data), cb)
    }

    pub fn send_no_delay(&self, buf: Bytes, cb: Option<SendCallback>) {
        match &self.0 {
            Some(session) => session.send_no_delay(buf, cb),
            None => complete(cb, Err(NetError::Shutdown)),
        }
    }

    /// Copying variant of [`send_no_delay`](Self::send_no_delay)
    pub fn send_no_delay_slice(&self, data: &[u8], cb: Option<SendCallback>) {
        self.send_no_delay(Bytes::copy_from_slice(data), cb)
    }

    pub fn shutdown(&self) {
        if let Some(session) = &self.0 {
            session.shutdown();
        }
    }

    pub fn local_addr(&self) -> Endpoint {
        self.0
            .as_ref()
            .map(|s| s.local_addr())
            .unwrap_or_default()
    }

    pub fn remote_addr(&self) -> Endpoint {
        self.0
            .as_ref()
            .map(|s| s.remote_addr())
            .unwrap_or_default()
    }
}

impl From<Arc<dyn Session>> for SessionEntry {
    fn from(session: Arc<dyn Session>) -> Self {
        Self::new(session)
    }
}

impl fmt::Debug for SessionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(s) => f
                .debug_struct("SessionEntry")
                .field("local", &s.local_addr())
                .field("remote", &s.remote_addr())
                .field("estab", &s.is_estab())
                .finish(),
            None => f.write_str("SessionEntry(empty)"),
        }
    }
}

/// Invoke an optional send callback
pub(crate) fn complete(cb: Option<SendCallback>, result: Result<()>) {
    if let Some(cb) = cb {
        cb(result);
    }
}
