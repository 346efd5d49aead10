//! Distributed Storage Module
//!
//! Shared queues, maps and topics that every scheduler and build agent sees
//! identically, plus change listeners on each.
//!
//! ## Core Concepts
//! - **Backend**: `StoreBackend` holds the raw JSON state. `MemoryStore` keeps it
//!   in-process; `RemoteStore` talks to a store server (`handlers`) over HTTP.
//! - **Typed views**: `DistributedQueue`, `DistributedMap` and `DistributedTopic`
//!   (de)serialize values and are obtained from a `DataProvider`.
//! - **Events**: every structure keeps an ordered event log. Listeners follow it
//!   from a dedicated task (`ListenerHub`), so callbacks never run on the
//!   caller's path.
//! - **Transfers**: `poll_into` and `transfer_to_queue` move an item between a
//!   queue and a map in one store operation.

pub mod backend;
pub mod handlers;
pub mod listeners;
pub mod map;
pub mod memory;
pub mod protocol;
pub mod provider;
pub mod queue;
pub mod remote;
pub mod topic;
pub mod types;

pub use backend::StoreBackend;
pub use map::DistributedMap;
pub use memory::MemoryStore;
pub use provider::DataProvider;
pub use queue::DistributedQueue;
pub use remote::RemoteStore;
pub use topic::DistributedTopic;
pub use types::{EntryEvent, EntryEventKind, ItemEvent, ItemEventKind, ListenerId};

#[cfg(test)]
mod tests;
