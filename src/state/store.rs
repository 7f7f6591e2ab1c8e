//! SAML state store backed by redb.
//!
//! Holds two things:
//! - relay states for in-flight logins, redeemable once
//! - consumed assertion IDs, kept until the assertion expires (replay prevention)

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::path::Path;
use tracing::{debug, warn};

use super::types::{RelayState, RelayToken};

/// redb table for relay states (key: token hex, value: MessagePack bytes).
const RELAY_STATES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("saml_relay_states");

/// redb table for consumed assertion IDs (key: assertion_id, value: expiry timestamp).
const ASSERTIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("saml_assertions");

/// Counts from one eviction pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Evicted {
    pub relay_states: usize,
    pub assertions: usize,
}

/// Persistent relay state and replay store.
pub struct StateStore {
    db: Database,
    default_ttl_secs: u64,
}

impl StateStore {
    /// Open or create a store at the given path.
    pub fn open(path: &Path, default_ttl_secs: u64) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let db = Database::create(path)
            .with_context(|| format!("Failed to open state database: {:?}", path))?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(RELAY_STATES_TABLE)?;
            let _ = write_txn.open_table(ASSERTIONS_TABLE)?;
        }
        write_txn.commit()?;

        debug!(path = ?path, "Opened SAML state store");

        Ok(Self {
            db,
            default_ttl_secs,
        })
    }

    /// Relay state lifetime in seconds.
    pub fn default_ttl_secs(&self) -> u64 {
        self.default_ttl_secs
    }

    /// Store a relay state.
    pub fn put_relay_state(&self, state: &RelayState) -> Result<()> {
        let data = rmp_serde::to_vec(state).context("Failed to serialize relay state")?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(RELAY_STATES_TABLE)?;
            table.insert(state.token.to_hex().as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Look up a relay state without consuming it. Expired states read as absent.
    pub fn get_relay_state(&self, token: &RelayToken) -> Result<Option<RelayState>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(RELAY_STATES_TABLE)?;

        match table.get(token.to_hex().as_str())? {
            Some(value) => {
                let state: RelayState = rmp_serde::from_slice(value.value())
                    .context("Failed to deserialize relay state")?;
                Ok(Some(state).filter(|s| !s.is_expired()))
            }
            None => Ok(None),
        }
    }

    /// Remove and return a relay state. A token can be redeemed at most once.
    pub fn take_relay_state(&self, token: &RelayToken) -> Result<Option<RelayState>> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(RELAY_STATES_TABLE)?;
            let removed = table.remove(token.to_hex().as_str())?;
            removed.map(|v| v.value().to_vec())
        };
        write_txn.commit()?;

        let Some(bytes) = removed else {
            return Ok(None);
        };
        let state: RelayState =
            rmp_serde::from_slice(&bytes).context("Failed to deserialize relay state")?;
        Ok(Some(state).filter(|s| !s.is_expired()))
    }

    /// Check if an assertion ID has been consumed.
    pub fn is_assertion_used(&self, assertion_id: &str) -> Result<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ASSERTIONS_TABLE)?;
        Ok(table.get(assertion_id)?.is_some())
    }

    /// Record an assertion ID as consumed until `expires_at`.
    ///
    /// Returns `false` if it was already recorded. Check and insert happen in
    /// one write transaction, so two concurrent callers cannot both succeed.
    pub fn mark_assertion_used(&self, assertion_id: &str, expires_at: DateTime<Utc>) -> Result<bool> {
        let data = rmp_serde::to_vec(&expires_at)?;
        let write_txn = self.db.begin_write()?;
        let fresh = {
            let mut table = write_txn.open_table(ASSERTIONS_TABLE)?;
            let seen = table.get(assertion_id)?.is_some();
            if !seen {
                table.insert(assertion_id, data.as_slice())?;
            }
            !seen
        };
        write_txn.commit()?;
        Ok(fresh)
    }

    /// Evict expired relay states and assertion records.
    pub fn evict_expired(&self) -> Result<Evicted> {
        let now = Utc::now();

        let expired_states: Vec<String> = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(RELAY_STATES_TABLE)?;

            let mut keys = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                match rmp_serde::from_slice::<RelayState>(value.value()) {
                    Ok(state) if state.expires_at < now => keys.push(key.value().to_string()),
                    Err(e) => {
                        warn!(key = key.value(), error = %e, "Failed to deserialize relay state, marking for deletion");
                        keys.push(key.value().to_string());
                    }
                    _ => {}
                }
            }
            keys
        };

        let expired_assertions: Vec<String> = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(ASSERTIONS_TABLE)?;

            let mut keys = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                match rmp_serde::from_slice::<DateTime<Utc>>(value.value()) {
                    Ok(expires_at) if now > expires_at => keys.push(key.value().to_string()),
                    Err(_) => keys.push(key.value().to_string()),
                    _ => {}
                }
            }
            keys
        };

        let mut evicted = Evicted::default();
        let write_txn = self.db.begin_write()?;
        {
            let mut states = write_txn.open_table(RELAY_STATES_TABLE)?;
            for key in &expired_states {
                if states.remove(key.as_str())?.is_some() {
                    evicted.relay_states += 1;
                }
            }
            let mut assertions = write_txn.open_table(ASSERTIONS_TABLE)?;
            for key in &expired_assertions {
                if assertions.remove(key.as_str())?.is_some() {
                    evicted.assertions += 1;
                }
            }
        }
        write_txn.commit()?;

        Ok(evicted)
    }

    /// Number of stored relay states, expired or not.
    pub fn relay_state_count(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(RELAY_STATES_TABLE)?;
        Ok(table.len()? as usize)
    }

    /// Number of recorded assertion IDs.
    pub fn assertion_count(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ASSERTIONS_TABLE)?;
        Ok(table.len()? as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_store() -> (StateStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.redb");
        let store = StateStore::open(&path, 600).unwrap();
        (store, dir)
    }

    fn expired_state() -> RelayState {
        let mut state = RelayState::new("okta", None, 600);
        state.expires_at = Utc::now() - chrono::Duration::seconds(10);
        state
    }

    #[test]
    fn test_put_get_take() {
        let (store, _dir) = test_store();
        let state = RelayState::new("okta", Some("https://app.example.com/cb".to_string()), 600);
        store.put_relay_state(&state).unwrap();

        let fetched = store.get_relay_state(&state.token).unwrap().unwrap();
        assert_eq!(fetched, state);
        // get does not consume
        assert!(store.get_relay_state(&state.token).unwrap().is_some());

        let taken = store.take_relay_state(&state.token).unwrap().unwrap();
        assert_eq!(taken.callback_url.as_deref(), Some("https://app.example.com/cb"));

        // second redemption finds nothing
        assert!(store.take_relay_state(&state.token).unwrap().is_none());
        assert!(store.get_relay_state(&state.token).unwrap().is_none());
    }

    #[test]
    fn test_unknown_token() {
        let (store, _dir) = test_store();
        assert!(store.take_relay_state(&RelayToken::new()).unwrap().is_none());
    }

    #[test]
    fn test_expired_relay_state_reads_as_absent() {
        let (store, _dir) = test_store();
        let state = expired_state();
        store.put_relay_state(&state).unwrap();

        assert!(store.get_relay_state(&state.token).unwrap().is_none());
        assert!(store.take_relay_state(&state.token).unwrap().is_none());
        // take still removes it
        assert_eq!(store.relay_state_count().unwrap(), 0);
    }

    #[test]
    fn test_assertion_replay_prevention() {
        let (store, _dir) = test_store();
        let expires = Utc::now() + chrono::Duration::seconds(600);

        assert!(!store.is_assertion_used("unique-assertion").unwrap());
        assert!(store.mark_assertion_used("unique-assertion", expires).unwrap());
        assert!(store.is_assertion_used("unique-assertion").unwrap());
        assert!(!store.mark_assertion_used("unique-assertion", expires).unwrap());
    }

    #[test]
    fn test_evict_expired() {
        let (store, _dir) = test_store();

        store.put_relay_state(&expired_state()).unwrap();
        store
            .put_relay_state(&RelayState::new("okta", None, 600))
            .unwrap();
        store
            .mark_assertion_used("old", Utc::now() - chrono::Duration::seconds(1))
            .unwrap();
        store
            .mark_assertion_used("fresh", Utc::now() + chrono::Duration::seconds(600))
            .unwrap();

        let evicted = store.evict_expired().unwrap();
        assert_eq!(
            evicted,
            Evicted {
                relay_states: 1,
                assertions: 1
            }
        );
        assert_eq!(store.relay_state_count().unwrap(), 1);
        assert_eq!(store.assertion_count().unwrap(), 1);
        assert!(store.is_assertion_used("fresh").unwrap());
    }

    #[test]
    fn test_reopen_keeps_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.redb");
        let state = RelayState::new("okta", None, 600);
        {
            let store = StateStore::open(&path, 600).unwrap();
            store.put_relay_state(&state).unwrap();
        }
        let store = StateStore::open(&path, 600).unwrap();
        assert!(store.get_relay_state(&state.token).unwrap().is_some());
    }
}
