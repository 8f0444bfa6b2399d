//! Cache backend seam and the local on-disk store.
//!
//! [`CacheBackend`] is the narrow capability the daemon serves; the
//! [`LocalStore`] is its simplest implementation and also the bottom tier
//! the blob backend writes through. [`FlightGroup`] and [`KeyGate`] provide
//! the single-flight discipline both backends rely on.

mod error;
mod flight;
mod local_store;
mod traits;

pub use error::StoreError;
pub use flight::{FlightGroup, KeyGate};
pub use local_store::LocalStore;
pub use traits::{BodyReader, CacheBackend, GetOpts, PutOpts};
