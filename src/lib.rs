// TODO(docs): #![deny(missing_docs)]
#![deny(unsafe_code, single_use_lifetimes, unused_lifetimes)]
#![warn(keyword_idents, let_underscore_drop, unreachable_pub, unused_import_braces)]

#![deny(clippy::suspicious, clippy::cargo)]
#![deny(clippy::exit, clippy::semicolon_inside_block, clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::multiple_crate_versions)]
#![allow(clippy::enum_glob_use, clippy::items_after_statements)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! FastCGI responder connections with request pipelining, an acceptor
//! serving multiple listeners, and a pooled FastCGI client.
//!
//! The [`protocol`] and [`parser`] modules are free of I/O. The [`server`],
//! [`client`] and [`transport`] modules require the `async` feature and run
//! on tokio.

pub(crate) mod macros;

// Based on the FastCGI specification, especially Section 8.
// See: https://fastcgi-archives.github.io/FastCGI_Specification.html
pub mod protocol;

/// Sans-IO parsers for both sides of a FastCGI connection.
pub mod parser;

mod config;
pub use config::{Config, PoolConfig};

mod error;
pub use error::Error;

/// Reporting of errors that have no caller to return to.
pub mod sink;

/// Byte streams, listeners and connectors used by servers and clients.
#[cfg(feature = "async")]
pub mod transport;

/// The server side: connections, requests and the acceptor.
#[cfg(feature = "async")]
pub mod server;

/// The client side: connections, the pool and the client.
#[cfg(feature = "async")]
pub mod client;
