//! Scheduler-wide port registry: an in-use set subordinate to every group
//! lock (acquired after, never before). Grounded on the `PortAllocator`
//! allocate/release pattern for supervised reverse-proxy children.

use std::collections::BTreeSet;

use tokio::sync::Mutex;

use crate::error::SchedulerError;

pub struct PortRegistry {
    in_use: Mutex<BTreeSet<u16>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self { in_use: Mutex::new(BTreeSet::new()) }
    }

    /// Finds the first free port at or after `start`, marks it in-use, and
    /// returns it. Searches up to `u16::MAX` candidates before giving up.
    pub async fn allocate_from(&self, start: u16) -> Result<u16, SchedulerError> {
        let mut in_use = self.in_use.lock().await;
        let mut candidate = start;
        loop {
            if !in_use.contains(&candidate) {
                in_use.insert(candidate);
                return Ok(candidate);
            }
            match candidate.checked_add(1) {
                Some(next) => candidate = next,
                None => {
                    return Err(SchedulerError::Other(anyhow::anyhow!(
                        "port range exhausted starting from {start}"
                    )));
                }
            }
        }
    }

    pub async fn release(&self, port: u16) {
        self.in_use.lock().await.remove(&port);
    }

    pub async fn in_use_count(&self) -> usize {
        self.in_use.lock().await.len()
    }
}

impl Default for PortRegistry {
    fn default() -> Self {
        Self::new()
    }
}
