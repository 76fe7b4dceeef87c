//! Durable key/value storage for SkySync.
//!
//! This module provides the store abstraction the sync components persist
//! through, plus in-memory and local filesystem backends and a registry
//! for picking one from configuration.
//!
//! # Design Principles
//! - Key ownership: every component owns its key or key prefix (see [`keys`])
//! - Async operations: all I/O operations are async
//! - Opaque values: stores see strings, components serialize JSON

pub mod local;
pub mod memory;
pub mod registry;
pub mod store;

pub use local::LocalStore;
pub use memory::MemoryStore;
pub use registry::{create_default_registry, StoreFactory, StoreRegistry};
pub use store::{keys, DurableStore, JsonStoreExt};
