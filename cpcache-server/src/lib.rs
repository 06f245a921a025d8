//! cpcache HTTP surface
//!
//! The wire-facing half of the caching package proxy: the TCP acceptor,
//! the per-connection request handler and the serve strategies that
//! compose cached bytes with in-flight downloads. The coordination
//! machinery it drives lives in `cpcache-core`.

#![deny(missing_docs)]
#![deny(clippy::missing_errors_doc)]
#![warn(clippy::too_many_lines)]

mod app;
mod connection;
mod http;
mod request;
mod serve;
mod server;

pub use app::App;
pub use connection::{Connection, RequestError};
pub use server::Server;
