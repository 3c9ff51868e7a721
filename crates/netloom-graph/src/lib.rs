//! netloom-graph: persistence for the topology graph.
//!
//! The discovery engine only ever talks to a [`GraphStore`]: load the prior
//! graph at job start, commit the merged graph together with its change set
//! at job end. This crate provides an in-memory store for tests, a JSON file
//! store, and a Neo4j-backed store.

pub mod client;
pub mod file;
pub mod memory;
pub mod mutations;
pub mod queries;
pub mod store;

pub use client::{GraphClient, GraphConfig};
pub use file::FileStore;
pub use memory::MemoryStore;
pub use store::{GraphStore, StoreError};
