//! The in-memory object store and its watch engine.
//!
//! A [`Store`] holds one table per registered kind. Every mutation of a table happens under that
//! table's write lock, during which the store
//!
//! 1. advances the shared resource-version [`Sequence`](kubemem_core::Sequence),
//! 2. updates the record, and
//! 3. publishes the change to the table's watchers and its bounded history.
//!
//! Readers therefore never observe a version without its record, and watchers receive changes in
//! exactly the order they were committed. Publishing never blocks: each watcher has a bounded
//! queue, and a watcher whose queue is full is disconnected with
//! [`Closed::Overflowed`](kubemem_core::Closed::Overflowed) rather than slowing down the store.
//! A watch that starts from an earlier version replays the history after it, so a list followed by
//! a watch from the list's version misses nothing.
//!
//! Objects are reached through a [`View`]. The base view sees the whole store; derived views see
//! only the objects labeled as theirs (see [`Scope`]).

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod metrics;
mod store;
mod view;
mod watch;


pub use self::{
    metrics::{register_collector, StoreMetrics},
    store::{KindStore, List, Store},
    view::{Partition, Scope, View, ViewConfig},
    watch::{EventType, Watch, WatchConfig, WatchEvent},
};
