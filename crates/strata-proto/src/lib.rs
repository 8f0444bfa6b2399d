//! The cache-program protocol engine.
//!
//! Drives the line-framed request/response protocol a toolchain speaks to
//! its external cache program: one JSON record per line on stdin, streamed
//! quoted-base64 bodies after `put` records, one JSON response per line on
//! stdout, out-of-order completion keyed by request id.
//!
//! The engine is transport-agnostic at the back: it hands requests to a
//! [`CacheHandler`], which may be an in-process backend or a client for
//! the local daemon.

pub mod b64;

mod engine;
mod error;
mod line;
mod pipe;

pub use engine::{CacheHandler, CacheProg};
pub use error::ProtoError;
pub use line::{Chunk, LineReader};
pub use pipe::{PipeReader, PipeWriter, pipe};
