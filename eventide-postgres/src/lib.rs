//! `PostgreSQL` storage for eventide.
//!
//! - [`Store`] - the append-only [`EventLog`](eventide_core::store::EventLog)
//! - [`ack::AckLog`] - publish acknowledgements and the verified cursor used
//!   by [`PublishRecoveryLoop`](eventide_core::recovery::PublishRecoveryLoop)
//! - [`read_model::ReadModelTable`] - one table per read model type
//!
//! All three can share a connection pool. Each exposes an idempotent
//! `migrate` to create its tables on startup.

pub mod ack;
mod error;
pub mod read_model;
mod store;

pub use error::Error;
pub use store::Store;
