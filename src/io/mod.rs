//! Network I/O for the transport-agnostic facades
//!
//! [`Server`] and [`Client`] select a transport from a URL scheme and drive
//! it. The bundled transports are TCP (plain or TLS) and UDP.

pub mod client;
pub mod common;
pub mod server;
pub(crate) mod stream;
pub mod tcp;
pub(crate) mod tls;
pub mod udp;

pub use client::Client;
pub use server::Server;
