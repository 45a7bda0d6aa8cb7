//! Transport-agnostic network endpoints
//!
//! `gonet` puts TCP, UDP and TLS-over-TCP behind one [`Server`] and one
//! [`Client`] type. The transport is chosen at runtime from the scheme of the
//! URL passed to `start` or `connect`:
//!
//! | Scheme | Transport |
//! |---|---|
//! | `tcp://` | TCP |
//! | `ssl://`, `tls://` | TLS over TCP (rustls) |
//! | `udp://` | UDP, one session per peer |
//!
//! # Quick Start
//!
//! **Server:**
//! ```no_run
//! use gonet::{Configure, Server};
//!
//! # async fn run() -> gonet::Result<()> {
//! let mut server = Server::new();
//! server
//!     .set_connected_cb(|session| println!("connected: {}", session.remote_addr()))
//!     .set_receive_cb(|session, data| {
//!         session.send_slice(data, None);
//!         data.len()
//!     });
//! server.start("tcp://0.0.0.0:3030").await?;
//! # Ok(())
//! # }
//! ```
//!
//! **Client:**
//! ```no_run
//! use gonet::{Client, Configure};
//!
//! # async fn run() -> gonet::Result<()> {
//! let client = Client::new();
//! client.set_receive_cb(|_, data| data.len());
//! client.connect("tcp://127.0.0.1:3030").await?;
//! client.send_slice(b"hello", Some(Box::new(|result| {
//!     if let Err(e) = result {
//!         eprintln!("send failed: {}", e);
//!     }
//! })));
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! Every facade, transport and session owns an [`Options`] node. A facade's
//! node is linked above the transport it creates, and a transport's node
//! above each session it accepts. Setters push values down the tree, so
//! configuring the facade once configures everything it spawns, including
//! sessions that already exist.
//!
//! ## Module Structure
//!
//! - **`io`** - Facades and transports
//!   - `Server` / `Client` - URL-driven facades
//!   - `tcp`, `udp` - Bundled transports
//! - **`options`** - Options tree, callbacks, TLS settings
//! - **`protocol`** - Transport selectors and transport traits
//! - **`session`** - Established connections
//! - **`endpoint`** - URL parsing
//! - **`error`** - `NetError` and `Result<T>`

pub mod endpoint;
pub mod error;
pub mod io;
pub mod options;
pub mod protocol;
pub mod session;

pub use endpoint::{Endpoint, Proto};
pub use error::{NetError, Result};
pub use io::{Client, Server};
pub use options::{
    Configure, Options, OptionsData, OptionsUser, TlsOptions, TlsVersion, VerifyMode,
};
pub use protocol::Protocol;
pub use session::{SendCallback, Session, SessionEntry};
