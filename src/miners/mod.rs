pub mod client;
pub mod discovery;
pub mod policy;

pub use client::{MinerClientError, MinerControl, TcpMinerClient};
pub use discovery::MinerDiscovery;
pub use policy::MinerPolicy;

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::sync::Mutex;

use crate::domain::MinerHost;

/// Shared miner state: the discovered-host map and the aggregate running
/// draw, each behind its own mutex. Remote calls never happen under either
/// lock.
#[derive(Default)]
pub struct MinerFleet {
    hosts: Mutex<HashMap<SocketAddr, MinerHost>>,
    running_power_w: Mutex<f64>,
}

impl MinerFleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.hosts.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.hosts.lock().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<MinerHost> {
        let mut hosts: Vec<_> = self.hosts.lock().await.values().cloned().collect();
        hosts.sort_by_key(|h| h.addr);
        hosts
    }

    /// Insert a newly discovered host; known hosts are left untouched.
    /// Returns true when the host was new.
    pub async fn insert_if_absent(&self, host: MinerHost) -> bool {
        let mut hosts = self.hosts.lock().await;
        match hosts.entry(host.addr) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(host);
                true
            }
        }
    }

    /// Mutate one host in place under the map lock. Returns false for
    /// unknown addresses.
    pub async fn update<F>(&self, addr: SocketAddr, f: F) -> bool
    where
        F: FnOnce(&mut MinerHost),
    {
        let mut hosts = self.hosts.lock().await;
        match hosts.get_mut(&addr) {
            Some(host) => {
                f(host);
                true
            }
            None => false,
        }
    }

    pub async fn running_power_w(&self) -> f64 {
        *self.running_power_w.lock().await
    }

    pub async fn set_running_power_w(&self, value: f64) {
        *self.running_power_w.lock().await = value.max(0.0);
    }

    /// Add `delta` to the running total only when the result stays within
    /// `budget_w` (always, when no budget applies). Returns whether the
    /// reservation was taken.
    pub async fn try_reserve_w(&self, delta: f64, budget_w: Option<f64>) -> bool {
        let mut total = self.running_power_w.lock().await;
        let next = (*total + delta).max(0.0);
        match budget_w {
            Some(budget) if next > budget => false,
            _ => {
                *total = next;
                true
            }
        }
    }

    /// Unconditionally shift the running total (used when replacing one
    /// mode's draw with another after a confirmed transition).
    pub async fn add_power_w(&self, delta: f64) {
        let mut total = self.running_power_w.lock().await;
        *total = (*total + delta).max(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MinerState, MinerStatus, WorkMode};
    use chrono::Utc;

    fn host(port: u16) -> MinerHost {
        let status = MinerStatus {
            state: MinerState::StandBy,
            work_mode: WorkMode::Eco,
            fan_r: 40.0,
            board_temp_c: 50.0,
            chip_temp_c: 60.0,
        };
        MinerHost::new(format!("10.0.0.1:{port}").parse().unwrap(), &status, Utc::now())
    }

    #[tokio::test]
    async fn discovery_never_replaces_known_hosts() {
        let fleet = MinerFleet::new();
        assert!(fleet.insert_if_absent(host(4028)).await);
        assert!(!fleet.insert_if_absent(host(4028)).await);
        assert_eq!(fleet.len().await, 1);
    }

    #[tokio::test]
    async fn reservations_respect_the_budget() {
        let fleet = MinerFleet::new();
        assert!(fleet.try_reserve_w(1500.0, Some(2000.0)).await);
        assert!(!fleet.try_reserve_w(1500.0, Some(2000.0)).await);
        assert_eq!(fleet.running_power_w().await, 1500.0);
        // Without a budget the reservation always succeeds.
        assert!(fleet.try_reserve_w(1500.0, None).await);
        assert_eq!(fleet.running_power_w().await, 3000.0);
    }

    #[tokio::test]
    async fn the_running_total_never_goes_negative() {
        let fleet = MinerFleet::new();
        fleet.add_power_w(-500.0).await;
        assert_eq!(fleet.running_power_w().await, 0.0);
    }
}
