//! The daemon's loopback HTTP surface.
//!
//! Many short-lived adapter processes funnel their cache traffic to one
//! long-lived daemon over `127.0.0.1`. The transport is deliberately
//! boring: JSON bodies everywhere, except `POST /cacheprog/put` whose body
//! is the request record on one line followed by the quoted-base64 entry
//! body, so the daemon can stream it straight into the store.

mod client;
mod error;
mod handler;
mod server;

pub use client::{Client, ClientConfig};
pub use error::ApiError;
pub use handler::DaemonHandler;
pub use server::Server;
