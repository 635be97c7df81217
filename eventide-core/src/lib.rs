//! Core traits, engines and in-memory stores for the eventide
//! event-sourcing library.
//!
//! - [`store`] - the append-only [`EventLog`](store::EventLog) with optimistic
//!   concurrency, plus an in-memory implementation
//! - [`aggregate`] - [`Aggregate`](aggregate::Aggregate) state and the
//!   [`AggregateRoot`](aggregate::AggregateRoot) that replays and emits events
//! - [`repository`] - load/mutate/commit with conflict retry and source-id
//!   deduplication
//! - [`projection`] - read models with versioned writes and isolated failures
//! - [`saga`] - event-driven workflows that send commands after they commit
//! - [`recovery`] - finds committed events that were never published and
//!   redelivers them
//!
//! # Example
//!
//! ```
//! use eventide_core::{repository::Repository, store::inmemory};
//! # use eventide_core::{aggregate::Aggregate, event::DomainEvent};
//! # #[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
//! # struct Opened;
//! # impl DomainEvent for Opened { const NAME: &'static str = "opened"; }
//! # eventide_core::event_set! {
//! #     #[derive(Clone, Debug)]
//! #     enum AccountEvent { Opened(Opened) }
//! # }
//! # #[derive(Default)]
//! # struct Account;
//! # impl Aggregate for Account {
//! #     const KIND: &'static str = "account";
//! #     type Event = AccountEvent;
//! #     type Error = std::convert::Infallible;
//! #     fn apply(&mut self, _: &AccountEvent) {}
//! # }
//!
//! let log = inmemory::Store::new();
//! let repository = Repository::<Account, _>::new(log)?;
//! # Ok::<(), eventide_core::event::RegistryError>(())
//! ```
//!
//! Most users should depend on the `eventide` crate, which re-exports these
//! types.

pub mod aggregate;
pub mod codec;
pub mod concurrency;
pub mod config;
pub mod event;
pub mod identity;
pub mod metadata;
pub mod projection;
pub mod publisher;
pub mod recovery;
pub mod repository;
pub mod retry;
pub mod saga;
pub mod store;
pub mod upgrade;

// Test utilities module: public when feature enabled, internal for crate tests
#[cfg(feature = "test-util")]
pub mod test;

#[cfg(all(test, not(feature = "test-util")))]
pub(crate) mod test;

pub use nonempty::NonEmpty;
pub use tokio_util::sync::CancellationToken;
