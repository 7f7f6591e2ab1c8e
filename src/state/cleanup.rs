//! Background state cleanup task.
//!
//! Periodically evicts expired relay states and replay records.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::store::StateStore;

/// Spawn a task that evicts expired entries every `cleanup_interval_secs`.
///
/// Returns a `JoinHandle` that can be used to abort the task.
pub fn spawn_cleanup_task(
    store: Arc<StateStore>,
    cleanup_interval_secs: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(cleanup_interval_secs.max(1)));

        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            ticker.tick().await;

            match store.evict_expired() {
                Ok(evicted) if evicted.relay_states + evicted.assertions > 0 => {
                    info!(
                        relay_states = evicted.relay_states,
                        assertions = evicted.assertions,
                        "SAML state cleanup completed"
                    );
                }
                Ok(_) => debug!("SAML state cleanup: nothing expired"),
                Err(e) => warn!(error = %e, "SAML state cleanup failed"),
            }
        }
    })
}
