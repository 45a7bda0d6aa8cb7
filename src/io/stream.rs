//! Stream session shared by the TCP and TLS transports
//!
//! Each session runs two tasks: a reader that feeds the receive callback
//! and keeps unconsumed bytes buffered, and a writer that drains the send
//! queue. `send` lets the writer batch everything already queued into one
//! flush; `send_no_delay` flushes as soon as its own bytes are written.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::endpoint::Endpoint;
use crate::error::NetError;
use crate::io::common::{enqueue, fail_queued, with_timeout, Outgoing};
use crate::options::Options;
use crate::session::{complete, SendCallback, Session, SessionEntry};

const READ_CHUNK: usize = 8 * 1024;

// Bound on flushing buffered bytes and sending FIN once a session closes
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

pub(crate) struct StreamSession {
    options: Options,
    tx: mpsc::UnboundedSender<Outgoing>,
    cancel: CancellationToken,
    disconnected: AtomicBool,
    live: Option<Arc<AtomicUsize>>,
    local: Endpoint,
    remote: Endpoint,
}

impl StreamSession {
    /// Wrap an established stream and start its reader and writer tasks
    ///
    /// The session's options node is linked below `parent`. `live`, when
    /// given, already counts this session and is decremented when it closes.
    /// `register` runs first so the owner can store the session, then the
    /// connect callback fires, then reading starts.
    pub(crate) fn spawn<S, F>(
        stream: S,
        local: Endpoint,
        remote: Endpoint,
        parent: &Options,
        cancel: CancellationToken,
        live: Option<Arc<AtomicUsize>>,
        register: F,
    ) -> Arc<StreamSession>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        F: FnOnce(&Arc<StreamSession>),
    {
        let options = Options::new();
        parent.link(&options);

        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(StreamSession {
            options,
            tx,
            cancel,
            disconnected: AtomicBool::new(false),
            live,
            local,
            remote,
        });

        debug!(
            local = %session.local,
            remote = %session.remote,
            "Session established"
        );

        register(&session);
        if let Some(cb) = session.options.connect_cb() {
            cb(session.entry());
        }

        let (reader, writer) = tokio::io::split(stream);
        tokio::spawn(write_loop(session.clone(), writer, rx));
        tokio::spawn(read_loop(session.clone(), reader));

        session
    }

    fn entry(self: &Arc<Self>) -> SessionEntry {
        SessionEntry::new(self.clone())
    }

    /// Stop both tasks and report the disconnect once
    fn close(self: &Arc<Self>, reason: NetError) {
        self.cancel.cancel();

        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(live) = &self.live {
            live.fetch_sub(1, Ordering::SeqCst);
        }

        debug!(
            remote = %self.remote,
            reason = %reason,
            "Session closed"
        );

        if let Some(cb) = self.options.disconnect_cb() {
            cb(self.entry(), &reason);
        }
    }

    fn push(&self, buf: Bytes, no_delay: bool, cb: Option<SendCallback>) {
        if self.cancel.is_cancelled() {
            complete(cb, Err(NetError::Shutdown));
            return;
        }

        trace!(remote = %self.remote, bytes = buf.len(), no_delay = no_delay, "Queueing send");
        enqueue(&self.tx, Outgoing { buf, no_delay, cb });
    }
}

impl Session for StreamSession {
    fn is_estab(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    fn send(&self, buf: Bytes, cb: Option<SendCallback>) {
        self.push(buf, false, cb);
    }

    fn send_no_delay(&self, buf: Bytes, cb: Option<SendCallback>) {
        self.push(buf, true, cb);
    }

    fn shutdown(&self) {
        // The reader observes the cancellation and reports the disconnect
        self.cancel.cancel();
    }

    fn local_addr(&self) -> Endpoint {
        self.local.clone()
    }

    fn remote_addr(&self) -> Endpoint {
        self.remote.clone()
    }
}

async fn read_loop<R>(session: Arc<StreamSession>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    let reason = loop {
        buf.reserve(READ_CHUNK);

        let read = tokio::select! {
            _ = session.cancel.cancelled() => break NetError::Shutdown,
            read = reader.read_buf(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                break NetError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                ))
            }
            Ok(n) => {
                trace!(remote = %session.remote, bytes = n, buffered = buf.len(), "Received data");

                match session.options.receive_cb() {
                    Some(cb) => {
                        let consumed = cb(session.entry(), &buf[..]).min(buf.len());
                        buf.advance(consumed);
                    }
                    None => buf.clear(),
                }

                let max = session.options.max_pack_size();
                if buf.len() > max {
                    warn!(
                        remote = %session.remote,
                        buffered = buf.len(),
                        max = max,
                        "Unconsumed receive buffer exceeds max packet size"
                    );
                    break NetError::PacketTooLarge {
                        size: buf.len(),
                        max,
                    };
                }
            }
            Err(e) => break NetError::Io(e),
        }
    };

    session.close(reason);
}

async fn write_loop<W>(
    session: Arc<StreamSession>,
    writer: W,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
) where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);

    loop {
        let first = tokio::select! {
            _ = session.cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        // Plain sends coalesce with whatever else is already queued
        let mut batch = vec![first];
        if !batch[0].no_delay {
            while let Ok(msg) = rx.try_recv() {
                let no_delay = msg.no_delay;
                batch.push(msg);
                if no_delay {
                    break;
                }
            }
        }

        // Callbacks are not Sync, so the writes borrow only the buffers
        let bufs: Vec<Bytes> = batch.iter().map(|msg| msg.buf.clone()).collect();
        let timeout = session.options.send_timeout();
        let mut result = Ok(());
        for buf in &bufs {
            result = with_timeout(timeout, writer.write_all(buf)).await;
            if result.is_err() {
                break;
            }
        }
        if result.is_ok() {
            result = with_timeout(timeout, writer.flush()).await;
        }

        match result {
            Ok(()) => {
                trace!(remote = %session.remote, sends = batch.len(), "Flushed");
                for msg in batch {
                    complete(msg.cb, Ok(()));
                }
            }
            Err(e) => {
                warn!(remote = %session.remote, error = %e, "Write failed");
                for msg in batch {
                    complete(msg.cb, Err(e.duplicate()));
                }
                session.close(e);
                break;
            }
        }
    }

    fail_queued(&mut rx);
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown()).await;
}
