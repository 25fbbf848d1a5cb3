//! Service wrappers shared by every client of the core.

mod store;

pub use store::{SnapshotStore, StoreService};
