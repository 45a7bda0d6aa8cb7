//! Hierarchical connection options
//!
//! Every facade and every transport object owns an [`Options`] node. When a
//! facade creates a transport it links its own node above the transport's
//! node, and transports link the nodes of the sessions they spawn below
//! their own. The result is a tree that keeps every object configured from
//! one place.
//!
//! # Propagation model
//!
//! - [`Options::link`] copies the parent's snapshot into the child and then
//!   pushes the child's (new) snapshot down through the child's own subtree.
//! - Every setter writes the local field, notifies the node's observer, and
//!   repeats the same setter on each child in link order. Values are pushed
//!   down, never pulled up: a setter on a child does not touch its parent.
//! - Dropping a node detaches it from its parent and from its children.
//!   Children are not dropped and keep the values they last received.
//!
//! ```
//! use gonet::options::Options;
//!
//! let facade = Options::new();
//! facade.set_max_pack_size(1024);
//!
//! let transport = Options::new();
//! facade.link(&transport);
//! assert_eq!(transport.max_pack_size(), 1024);
//!
//! facade.set_max_pack_size(2048);
//! assert_eq!(transport.max_pack_size(), 2048);
//!
//! transport.set_max_pack_size(512);
//! assert_eq!(facade.max_pack_size(), 2048);
//! ```
//!
//! The tree is expected to be built and configured from one owning task;
//! internal locks keep it memory-safe but do not order concurrent setters.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::NetError;
use crate::session::SessionEntry;

/// Called once a session is established
pub type ConnectedCb = Arc<dyn Fn(SessionEntry) + Send + Sync>;

/// Called with the bytes received so far; returns how many were consumed
///
/// For stream transports unconsumed bytes stay buffered and are offered
/// again with the next read. Datagram transports deliver one datagram per
/// call and ignore the return value.
pub type ReceiveCb = Arc<dyn Fn(SessionEntry, &[u8]) -> usize + Send + Sync>;

/// Called once when an established session closes
pub type DisconnectedCb = Arc<dyn Fn(SessionEntry, &NetError) + Send + Sync>;

type Observer = Arc<dyn Fn(OptionField, &OptionsData) + Send + Sync>;

/// Default listen backlog, matching tokio's `TcpListener::bind`
pub const DEFAULT_LISTEN_BACKLOG: u32 = 1024;

/// Default maximum packet size (64 KiB)
pub const DEFAULT_MAX_PACK_SIZE: usize = 64 * 1024;

/// Default silence after which a UDP server drops a peer's session
pub const DEFAULT_UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Peer certificate verification policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyMode {
    /// Do not verify the peer
    #[default]
    None,
    /// Verify a peer certificate if one is presented (servers only)
    Optional,
    /// Require and verify a peer certificate
    Required,
}

/// Lowest TLS protocol version a session may negotiate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsVersion {
    /// TLS 1.2 and 1.3
    #[default]
    Tls12,
    /// TLS 1.3 only
    Tls13,
}

/// TLS settings used by `ssl://` endpoints
///
/// Private keys must be unencrypted PEM; there is no key password.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsOptions {
    /// Peer verification policy
    pub verify_mode: VerifyMode,
    /// Lowest protocol version offered or accepted
    pub min_version: TlsVersion,
    /// PEM certificate chain presented to the peer
    pub certificate_chain_file: Option<PathBuf>,
    /// PEM private key matching `certificate_chain_file`
    pub private_key_file: Option<PathBuf>,
    /// PEM CA bundle used to verify the peer; native roots when unset
    pub verify_file: Option<PathBuf>,
    /// Server name sent by clients (SNI); the endpoint IP when unset
    pub server_name: Option<String>,
}

/// Plain-value settings, loadable from any serde format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionsUser {
    /// Pending-connection queue length passed to `listen`
    pub listen_backlog: u32,
    /// Bound on connect and on each write; `None` waits forever
    pub send_timeout: Option<Duration>,
    /// Largest datagram sent, and largest unconsumed stream buffer kept
    pub max_pack_size: usize,
    /// Maximum live sessions per server
    pub max_connection: usize,
    /// Silence after which a UDP server session is closed; `None` keeps
    /// sessions until shutdown
    pub udp_idle_timeout: Option<Duration>,
    /// TLS parameters
    pub tls: TlsOptions,
}

impl Default for OptionsUser {
    fn default() -> Self {
        Self {
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            send_timeout: None,
            max_pack_size: DEFAULT_MAX_PACK_SIZE,
            max_connection: usize::MAX,
            udp_idle_timeout: Some(DEFAULT_UDP_IDLE_TIMEOUT),
            tls: TlsOptions::default(),
        }
    }
}

/// Configuration snapshot held by each [`Options`] node
#[derive(Clone, Default)]
pub struct OptionsData {
    /// Plain-value settings
    pub user: OptionsUser,
    /// Session established callback
    pub connect_cb: Option<ConnectedCb>,
    /// Data received callback
    pub receive_cb: Option<ReceiveCb>,
    /// Session closed callback
    pub disconnect_cb: Option<DisconnectedCb>,
}

impl OptionsData {
    /// Snapshot with the given plain-value settings and no callbacks
    pub fn from_user(user: OptionsUser) -> Self {
        Self {
            user,
            ..Default::default()
        }
    }
}

impl fmt::Debug for OptionsData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptionsData")
            .field("user", &self.user)
            .field("connect_cb", &self.connect_cb.is_some())
            .field("receive_cb", &self.receive_cb.is_some())
            .field("disconnect_cb", &self.disconnect_cb.is_some())
            .finish()
    }
}

/// Identifies which setter changed a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionField {
    ConnectedCb,
    ReceiveCb,
    DisconnectedCb,
    ListenBacklog,
    SendTimeout,
    MaxPackSize,
    MaxConnection,
    UdpIdleTimeout,
    Tls,
}

struct NodeState {
    data: OptionsData,
    parent: Option<Weak<Node>>,
    children: Vec<Weak<Node>>,
    observer: Option<Observer>,
}

struct Node {
    state: Mutex<NodeState>,
}

impl Node {
    fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn children(&self) -> Vec<Arc<Node>> {
        self.lock().children.iter().filter_map(Weak::upgrade).collect()
    }

    fn parent(&self) -> Option<Arc<Node>> {
        self.lock().parent.as_ref().and_then(Weak::upgrade)
    }

    // Push this node's snapshot into every descendant, depth-first
    fn resync(&self) {
        let data = self.lock().data.clone();
        for child in self.children() {
            child.lock().data = data.clone();
            child.resync();
        }
    }

    fn apply(&self, field: OptionField, write: &dyn Fn(&mut OptionsData)) {
        let notify = {
            let mut state = self.lock();
            write(&mut state.data);
            state
                .observer
                .clone()
                .map(|observer| (observer, state.data.clone()))
        };

        // No lock is held while user code or children run
        if let Some((observer, snapshot)) = notify {
            observer(field, &snapshot);
        }

        for child in self.children() {
            child.apply(field, write);
        }
    }
}

fn same_node(weak: &Weak<Node>, node: &Arc<Node>) -> bool {
    std::ptr::eq(weak.as_ptr(), Arc::as_ptr(node))
}

/// A node of the options tree
///
/// Each node is exclusively owned by the object it configures. Tree links
/// are non-owning in both directions.
pub struct Options {
    node: Arc<Node>,
}

impl Options {
    /// Root node holding [`OptionsData::default()`]
    pub fn new() -> Self {
        Self::with_data(OptionsData::default())
    }

    /// Root node holding an explicit snapshot
    pub fn with_data(data: OptionsData) -> Self {
        Self {
            node: Arc::new(Node {
                state: Mutex::new(NodeState {
                    data,
                    parent: None,
                    children: Vec::new(),
                    observer: None,
                }),
            }),
        }
    }

    /// Link `child` below this node
    ///
    /// The child's snapshot is replaced with this node's snapshot, and the
    /// child's existing subtree is brought up to date with it.
    ///
    /// # Panics
    ///
    /// Panics if `child` already has a parent, or if linking would create a
    /// cycle. Both are contract violations by the caller.
    pub fn link(&self, child: &Options) {
        assert!(
            !self.is_descendant_of(child),
            "linking options node would create a cycle"
        );

        let data = self.data();
        {
            let mut state = child.node.lock();
            assert!(state.parent.is_none(), "options node already has a parent");
            state.parent = Some(Arc::downgrade(&self.node));
            state.data = data;
        }
        self.node.lock().children.push(Arc::downgrade(&child.node));

        child.node.resync();
    }

    /// Remove `child` from this node's children
    ///
    /// Snapshots are left unchanged. Returns `false` if `child` was not
    /// linked below this node.
    pub fn unlink(&self, child: &Options) -> bool {
        {
            let mut state = child.node.lock();
            match &state.parent {
                Some(parent) if same_node(parent, &self.node) => state.parent = None,
                _ => return false,
            }
        }
        self.node
            .lock()
            .children
            .retain(|weak| !same_node(weak, &child.node));
        true
    }

    fn is_descendant_of(&self, other: &Options) -> bool {
        let mut cursor = Some(self.node.clone());
        while let Some(node) = cursor {
            if Arc::ptr_eq(&node, &other.node) {
                return true;
            }
            cursor = node.parent();
        }
        false
    }

    /// Whether this node currently has a parent
    pub fn has_parent(&self) -> bool {
        self.node.parent().is_some()
    }

    /// Number of live children
    pub fn child_count(&self) -> usize {
        self.node.children().len()
    }

    /// Register the per-field change hook
    ///
    /// The hook runs after the local write of every setter reaching this
    /// node, before the value is pushed to children. Replaces any previous
    /// hook.
    pub fn set_observer<F>(&self, observer: F)
    where
        F: Fn(OptionField, &OptionsData) + Send + Sync + 'static,
    {
        self.node.lock().observer = Some(Arc::new(observer));
    }

    /// Clone of the current snapshot
    pub fn data(&self) -> OptionsData {
        self.node.lock().data.clone()
    }

    /// Clone of the current plain-value settings
    pub fn user(&self) -> OptionsUser {
        self.node.lock().data.user.clone()
    }

    /// Session established callback, if set
    pub fn connect_cb(&self) -> Option<ConnectedCb> {
        self.node.lock().data.connect_cb.clone()
    }

    /// Data received callback, if set
    pub fn receive_cb(&self) -> Option<ReceiveCb> {
        self.node.lock().data.receive_cb.clone()
    }

    /// Session closed callback, if set
    pub fn disconnect_cb(&self) -> Option<DisconnectedCb> {
        self.node.lock().data.disconnect_cb.clone()
    }

    /// Pending-connection queue length used on bind
    pub fn listen_backlog(&self) -> u32 {
        self.node.lock().data.user.listen_backlog
    }

    /// Bound on connect, handshakes and each write
    pub fn send_timeout(&self) -> Option<Duration> {
        self.node.lock().data.user.send_timeout
    }

    /// Largest datagram sent and largest unconsumed stream buffer kept
    pub fn max_pack_size(&self) -> usize {
        self.node.lock().data.user.max_pack_size
    }

    /// Maximum live sessions per server
    pub fn max_connection(&self) -> usize {
        self.node.lock().data.user.max_connection
    }

    /// Silence after which a UDP server session is closed
    pub fn udp_idle_timeout(&self) -> Option<Duration> {
        self.node.lock().data.user.udp_idle_timeout
    }

    /// Clone of the TLS parameters
    pub fn tls(&self) -> TlsOptions {
        self.node.lock().data.user.tls.clone()
    }

    /// Set the session established callback on this node and its subtree
    pub fn set_connected_cb<F>(&self, cb: F) -> &Self
    where
        F: Fn(SessionEntry) + Send + Sync + 'static,
    {
        let cb: ConnectedCb = Arc::new(cb);
        self.node.apply(OptionField::ConnectedCb, &move |d: &mut OptionsData| {
            d.connect_cb = Some(cb.clone())
        });
        self
    }

    /// Set the receive callback on this node and its subtree
    pub fn set_receive_cb<F>(&self, cb: F) -> &Self
    where
        F: Fn(SessionEntry, &[u8]) -> usize + Send + Sync + 'static,
    {
        let cb: ReceiveCb = Arc::new(cb);
        self.node.apply(OptionField::ReceiveCb, &move |d: &mut OptionsData| {
            d.receive_cb = Some(cb.clone())
        });
        self
    }

    /// Set the session closed callback on this node and its subtree
    pub fn set_disconnected_cb<F>(&self, cb: F) -> &Self
    where
        F: Fn(SessionEntry, &NetError) + Send + Sync + 'static,
    {
        let cb: DisconnectedCb = Arc::new(cb);
        self.node.apply(OptionField::DisconnectedCb, &move |d: &mut OptionsData| {
            d.disconnect_cb = Some(cb.clone())
        });
        self
    }

    /// Set the listen backlog; a bound TCP listener picks it up at once
    pub fn set_listen_backlog(&self, backlog: u32) -> &Self {
        self.node.apply(OptionField::ListenBacklog, &move |d: &mut OptionsData| {
            d.user.listen_backlog = backlog
        });
        self
    }

    /// Set the connect and write bound; `None` waits forever
    pub fn set_send_timeout(&self, timeout: Option<Duration>) -> &Self {
        self.node.apply(OptionField::SendTimeout, &move |d: &mut OptionsData| {
            d.user.send_timeout = timeout
        });
        self
    }

    /// Set the packet size limit on this node and its subtree
    pub fn set_max_pack_size(&self, size: usize) -> &Self {
        self.node.apply(OptionField::MaxPackSize, &move |d: &mut OptionsData| {
            d.user.max_pack_size = size
        });
        self
    }

    /// Set the live session limit checked when a server accepts
    pub fn set_max_connection(&self, count: usize) -> &Self {
        self.node.apply(OptionField::MaxConnection, &move |d: &mut OptionsData| {
            d.user.max_connection = count
        });
        self
    }

    /// Set the UDP server session idle timeout; live sessions pick it up at
    /// their next expiry check
    pub fn set_udp_idle_timeout(&self, timeout: Option<Duration>) -> &Self {
        self.node.apply(OptionField::UdpIdleTimeout, &move |d: &mut OptionsData| {
            d.user.udp_idle_timeout = timeout
        });
        self
    }

    /// Set the TLS parameters; they apply to the next bind or connect
    pub fn set_tls_options(&self, tls: TlsOptions) -> &Self {
        self.node
            .apply(OptionField::Tls, &move |d: &mut OptionsData| d.user.tls = tls.clone());
        self
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Options {
    fn drop(&mut self) {
        let (parent, children) = {
            let mut state = self.node.lock();
            (state.parent.take(), std::mem::take(&mut state.children))
        };

        if let Some(parent) = parent.and_then(|weak| weak.upgrade()) {
            parent
                .lock()
                .children
                .retain(|weak| !same_node(weak, &self.node));
        }

        for child in children.iter().filter_map(Weak::upgrade) {
            child.lock().parent = None;
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("data", &self.data())
            .field("has_parent", &self.has_parent())
            .field("children", &self.child_count())
            .finish()
    }
}

/// Fluent setters for anything that owns an options node
///
/// Each setter forwards to the node returned by [`Configure::options`] and
/// returns `&Self`, so calls chain on the concrete facade type:
///
/// ```
/// use gonet::{Configure, Server};
///
/// let server = Server::new();
/// server
///     .set_listen_backlog(128)
///     .set_max_connection(64)
///     .set_receive_cb(|_session, data| data.len());
/// assert_eq!(server.options().max_connection(), 64);
/// ```
pub trait Configure {
    /// The node configured by this object
    fn options(&self) -> &Options;

    fn set_connected_cb<F>(&self, cb: F) -> &Self
    where
        F: Fn(SessionEntry) + Send + Sync + 'static,
    {
        self.options().set_connected_cb(cb);
        self
    }

    fn set_receive_cb<F>(&self, cb: F) -> &Self
    where
        F: Fn(SessionEntry, &[u8]) -> usize + Send + Sync + 'static,
    {
        self.options().set_receive_cb(cb);
        self
    }

    fn set_disconnected_cb<F>(&self, cb: F) -> &Self
    where
        F: Fn(SessionEntry, &NetError) + Send + Sync + 'static,
    {
        self.options().set_disconnected_cb(cb);
        self
    }

    fn set_listen_backlog(&self, backlog: u32) -> &Self {
        self.options().set_listen_backlog(backlog);
        self
    }

    fn set_send_timeout(&self, timeout: Option<Duration>) -> &Self {
        self.options().set_send_timeout(timeout);
        self
    }

    fn set_max_pack_size(&self, size: usize) -> &Self {
        self.options().set_max_pack_size(size);
        self
    }

    fn set_max_connection(&self, count: usize) -> &Self {
        self.options().set_max_connection(count);
        self
    }

    fn set_udp_idle_timeout(&self, timeout: Option<Duration>) -> &Self {
        self.options().set_udp_idle_timeout(timeout);
        self
    }

    fn set_tls_options(&self, tls: TlsOptions) -> &Self {
        self.options().set_tls_options(tls);
        self
    }
}
