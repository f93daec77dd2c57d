//! Storage modules for Bundlio
//!
//! Provides content-addressed record stores, grouped queues and the deal
//! tracker's persistence, each with an in-memory and a remote backend.

pub mod factory;
pub mod queue;
pub mod store;
pub mod tracker_store;

pub use factory::BackendBuilder;
pub use queue::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_VISIBILITY_TIMEOUT, Delivery, MemoryQueue, Queue, QueueMessage,
    QueueOptions, RedisQueue,
};
pub use store::{MemoryStore, RedisStore, Store};
pub use tracker_store::{
    ContractStore, DealStore, MemoryTrackerStore, SqliteTrackerStore, TrackerStore,
};
