//! Offline-first synchronization and cache-coherency engine for a personal finance tracker.
//!
//! Screens talk to a single [`DataAccess`] façade. When the remote API is reachable, writes go
//! straight through and refresh the [`ReferenceCache`]. When it is not, writes land in the durable
//! [`MutationQueue`] with a temporary id and show up optimistically in the cache until the
//! [`SyncCoordinator`] delivers them and rewrites the temporary id to the server-assigned one.
//!
//! The [`UpdateCoordinator`] is a separate state machine that hands control over to newly
//! installed application code without touching any domain data.

pub mod api;
pub mod args;
pub mod cache;
pub mod commands;
mod config;
pub mod connectivity;
mod db;
mod error;
pub mod events;
pub mod facade;
pub mod model;
pub mod queue;
pub mod sync;
pub mod update;
mod utils;


pub use api::{Mode, RemoteApi, RemoteError};
pub use cache::ReferenceCache;
pub use config::{Config, SyncSettings};
pub use connectivity::{ConnectivityEvent, ConnectivityMonitor};
pub use db::{Db, MemoryStore, Store};
pub use error::{EngineError, EngineResult, Error, Result};
pub use events::{EventBus, Subscription, SyncEvent};
pub use facade::{DataAccess, ReadOutcome, SkipReason, WriteOutcome};
pub use queue::{MutationQueue, PendingOperation};
pub use sync::{DrainReport, SyncCoordinator};
pub use update::{UpdateCoordinator, UpdateError};
