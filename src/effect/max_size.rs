//! MaxSize effect: cap the total backing bytes of the subtree rooted at the
//! attachment node.

use libc::c_int;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct MaxSizeConf {
    limit: u64,
}

#[derive(Default)]
struct MaxSizeState {
    /// Live subtree byte sum. None until the first evaluation recomputes it
    /// from the backing store.
    used: Option<u64>,
}

pub struct MaxSizeEffect {
    conf: MaxSizeConf,
    state: Mutex<MaxSizeState>,
}

impl MaxSizeEffect {
    pub(super) fn parse(value: &[u8]) -> Result<MaxSizeEffect, ConfigError> {
        let conf: MaxSizeConf = serde_json::from_slice(value)?;
        Ok(MaxSizeEffect {
            conf,
            state: Mutex::new(MaxSizeState::default()),
        })
    }

    pub fn limit(&self) -> u64 {
        self.conf.limit
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().used.is_some()
    }

    /// Seed the running sum with a value recomputed from the backing store.
    /// A concurrent initializer may have won the race; first write sticks.
    pub fn initialize(&self, subtree_bytes: u64) {
        let mut state = self.state.lock();
        if state.used.is_none() {
            state.used = Some(subtree_bytes);
        }
    }

    /// Atomically check-and-reserve `grow` bytes. The caller must roll the
    /// reservation back with [`unreserve`](Self::unreserve) if the op fails.
    pub fn try_reserve(&self, grow: u64) -> Result<(), c_int> {
        self.try_reserve_net(grow, 0)
    }

    /// Check-and-apply a net delta in one step: `grow` bytes enter the
    /// subtree while `shrink` bytes leave as part of the same operation
    /// (a rename overwriting an existing target). The limit check runs
    /// against the netted sum, so bytes the op itself displaces do not
    /// block it.
    pub fn try_reserve_net(&self, grow: u64, shrink: u64) -> Result<(), c_int> {
        let mut state = self.state.lock();
        let used = state.used.get_or_insert(0);
        let next = used.saturating_sub(shrink).saturating_add(grow);
        if next > self.conf.limit {
            return Err(libc::ENOSPC);
        }
        *used = next;
        Ok(())
    }

    pub fn unreserve(&self, grow: u64) {
        self.unreserve_net(grow, 0)
    }

    pub fn unreserve_net(&self, grow: u64, shrink: u64) {
        let mut state = self.state.lock();
        if let Some(used) = state.used.as_mut() {
            *used = used.saturating_sub(grow).saturating_add(shrink);
        }
    }

    /// Credit bytes leaving the subtree (unlink, shrinking truncate,
    /// rename-out). Applied only after the op succeeded.
    pub fn release(&self, bytes: u64) {
        self.unreserve(bytes);
    }

    pub fn used(&self) -> Option<u64> {
        self.state.lock().used
    }

    pub fn render(&self) -> serde_json::Value {
        serde_json::to_value(&self.conf).unwrap_or(serde_json::Value::Null)
    }
}
