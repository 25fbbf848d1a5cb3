//! rollcall-core - Core library for Rollcall
//!
//! This crate contains the roster models, the local durable store, and the
//! offline-tolerant sync engine used by every Rollcall interface.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod state;
pub mod sync;

pub use error::{Error, Result};
pub use models::{Entity, EntityId, EntityKind};
