//! Device conditions checked before a unit is claimed.

use std::sync::{Arc, RwLock};

use super::{NetworkType, WorkConstraints};
use crate::storage::StorageAdvisor;

/// Current connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Offline,
    Metered,
    Unmetered,
}

/// Source of the signals work constraints are evaluated against.
pub trait DeviceConditions: Send + Sync {
    fn network(&self) -> NetworkStatus;

    fn battery_low(&self) -> bool;

    fn storage_low(&self) -> bool;
}

/// Returns true when `constraints` are satisfied under `conditions`.
pub fn constraints_met(conditions: &dyn DeviceConditions, constraints: &WorkConstraints) -> bool {
    let network_ok = match constraints.network {
        NetworkType::NotRequired => true,
        NetworkType::Connected => conditions.network() != NetworkStatus::Offline,
        NetworkType::Unmetered => conditions.network() == NetworkStatus::Unmetered,
    };

    network_ok
        && !(constraints.battery_not_low && conditions.battery_low())
        && !(constraints.storage_not_low && conditions.storage_low())
}

/// Conditions of a mains-powered host.
///
/// The battery is never low, storage comes from a [`StorageAdvisor`], and the
/// network status is whatever was last set (unmetered by default).
pub struct HostConditions {
    network: RwLock<NetworkStatus>,
    storage: Arc<dyn StorageAdvisor>,
}

impl HostConditions {
    #[must_use]
    pub fn new(storage: Arc<dyn StorageAdvisor>) -> Self {
        Self {
            network: RwLock::new(NetworkStatus::Unmetered),
            storage,
        }
    }

    /// Overrides the reported network status.
    pub fn set_network(&self, status: NetworkStatus) {
        *self
            .network
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = status;
    }
}

impl DeviceConditions for HostConditions {
    fn network(&self) -> NetworkStatus {
        *self
            .network
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn battery_low(&self) -> bool {
        false
    }

    fn storage_low(&self) -> bool {
        self.storage.is_low()
    }
}
