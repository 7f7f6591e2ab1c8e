//! Persistent SAML flow state.
//!
//! Relay states and replay records live in a redb database with a
//! background cleanup task.

pub mod cleanup;
pub mod store;
pub mod types;

pub use cleanup::spawn_cleanup_task;
pub use store::{Evicted, StateStore};
pub use types::{RelayState, RelayToken};
