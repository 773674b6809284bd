//! Token exchange under replication lag.
//!
//! Exchanges an externally issued identity token for an internal session
//! token. The exchange service only succeeds once the user record has
//! replicated to the authorizing store, so the coordinator retries, waking
//! early on PostgreSQL change notifications and falling back to polling.

pub mod config;
pub mod coordinator;
pub mod exchange;
pub mod fanin;
pub mod notify;
pub mod proto;
pub mod utils;

pub use coordinator::{CoordinatorError, ExchangeCoordinator};
pub use exchange::{ExchangeClient, ExchangeRequest, ExchangeResult};
pub use notify::{ChangeEvent, ListenerFactory, ListenerHandle};
