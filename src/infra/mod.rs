//! Infrastructure adapters for coordinator state persistence.

pub mod store;

pub use store::{FileStore, InMemoryStore, StateStore, StoreSnapshot};
