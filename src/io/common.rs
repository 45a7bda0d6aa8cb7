//! Helpers shared by the bundled transports

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{NetError, Result};
use crate::session::{complete, SendCallback};

/// Maximum UDP datagram size (IPv4 max - IP header - UDP header)
/// 65535 (max IP packet) - 20 (IP header) - 8 (UDP header) = 65507 bytes
pub const MAX_UDP_DATAGRAM_SIZE: usize = 65507;

/// A queued send
pub(crate) struct Outgoing {
    pub(crate) buf: Bytes,
    pub(crate) no_delay: bool,
    pub(crate) cb: Option<SendCallback>,
}

/// Ignore SIGPIPE for the whole process
///
/// Writing to a socket the peer already closed must surface as an I/O error
/// on the session, not kill the process.
pub(crate) fn ignore_sigpipe() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        #[cfg(unix)]
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }
    });
}

/// Re-issue `listen` on an already listening socket to change its backlog
#[cfg(unix)]
pub(crate) fn relisten(fd: std::os::fd::RawFd, backlog: u32) -> std::io::Result<()> {
    let backlog = backlog.min(libc::c_int::MAX as u32) as libc::c_int;

    unsafe {
        if libc::listen(fd, backlog) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }

    Ok(())
}

/// Run `fut`, failing with [`NetError::Timeout`] after `timeout`
pub(crate) async fn with_timeout<T, E, F>(timeout: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: Into<NetError>,
{
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(NetError::Timeout),
        },
        None => fut.await.map_err(Into::into),
    }
}

/// Queue a send, completing it with `Shutdown` if the writer is gone
pub(crate) fn enqueue(tx: &mpsc::UnboundedSender<Outgoing>, msg: Outgoing) {
    if let Err(mpsc::error::SendError(msg)) = tx.send(msg) {
        complete(msg.cb, Err(NetError::Shutdown));
    }
}

/// Close the queue and complete everything still in it with `Shutdown`
pub(crate) fn fail_queued(rx: &mut mpsc::UnboundedReceiver<Outgoing>) {
    rx.close();
    while let Ok(msg) = rx.try_recv() {
        complete(msg.cb, Err(NetError::Shutdown));
    }
}
