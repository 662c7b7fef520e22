//! Shared-resource registry
//!
//! Configured network groups are expensive; callers configuring the same
//! group on the same device with the same batch size share one instance.
//! The registry is an explicit object owned by the caller.
//!
//! Activation needs exclusive access to a group, so shared groups sit
//! behind a [`Mutex`]: lock, activate, and hold the guard for as long as
//! the activation lives.

use crate::config::{ConfigureParams, NetworkParams};
use crate::device::VdmaDevice;
use crate::error::Result;
use crate::metadata::NetworkGroupMetadata;
use crate::resources::{build, ResourcesManager};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

/// Key used for configured network groups: device id, group name, batch
pub type NetworkGroupKey = (String, String, u16);

/// A configured group handed out by the registry
pub type SharedNetworkGroup = Mutex<ResourcesManager>;

/// Registry of configured groups
pub type ConfiguredNetworkGroups = NetworkGroupRegistry<NetworkGroupKey, SharedNetworkGroup>;

/// Values shared by key
#[derive(Debug)]
pub struct NetworkGroupRegistry<K, V> {
    entries: Mutex<HashMap<K, Arc<V>>>,
}

impl<K, V> Default for NetworkGroupRegistry<K, V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash, V> NetworkGroupRegistry<K, V> {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// The value under `key`, created by `create` if absent
    ///
    /// The lock is held while `create` runs, so a key is created once.
    ///
    /// # Errors
    ///
    /// Returns the error of `create`; nothing is inserted then.
    pub fn get_or_try_insert_with<F>(&self, key: K, create: F) -> Result<Arc<V>>
    where
        F: FnOnce() -> Result<V>,
    {
        let mut entries = self.entries.lock();
        if let Some(value) = entries.get(&key) {
            return Ok(Arc::clone(value));
        }
        let value = Arc::new(create()?);
        entries.insert(key, Arc::clone(&value));
        Ok(value)
    }

    /// The value under `key`
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.entries.lock().get(key).cloned()
    }

    /// Forget `key`; holders of the value keep it alive
    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        self.entries.lock().remove(key)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl NetworkGroupRegistry<NetworkGroupKey, SharedNetworkGroup> {
    /// Configure `metadata` on `device`, or share the group already
    /// configured there with the same batch size
    ///
    /// # Errors
    ///
    /// Returns the error of [`build`]; nothing is registered then.
    pub fn configure(
        &self,
        device: &Arc<VdmaDevice>,
        params: ConfigureParams,
        metadata: Arc<NetworkGroupMetadata>,
        network_group_index: u8,
    ) -> Result<Arc<SharedNetworkGroup>> {
        let key = network_group_key(device, &params, &metadata);
        self.get_or_try_insert_with(key, || {
            tracing::debug!("Configuring shared network group {}", metadata.network_group_name);
            build(Arc::clone(device), params, metadata, network_group_index).map(Mutex::new)
        })
    }
}

/// Key of a group: its device, name and largest network batch size
pub fn network_group_key(
    device: &VdmaDevice,
    params: &ConfigureParams,
    metadata: &NetworkGroupMetadata,
) -> NetworkGroupKey {
    let batch = params
        .network_params_by_name
        .values()
        .map(NetworkParams::actual_batch_size)
        .max()
        .unwrap_or(1);
    (device.device_id().to_owned(), metadata.network_group_name.clone(), batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VdmaError;

    #[test]
    fn test_same_key_same_value() {
        let registry: NetworkGroupRegistry<NetworkGroupKey, u32> = NetworkGroupRegistry::new();
        let key = ("dev0".to_owned(), "g".to_owned(), 4);
        let first = registry.get_or_try_insert_with(key.clone(), || Ok(7)).unwrap();
        let second = registry
            .get_or_try_insert_with(key.clone(), || panic!("created twice"))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(&key).is_some());
        assert!(registry.get(&key).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_key_uses_largest_batch() {
        let device = VdmaDevice::from_driver(Arc::new(crate::SoftwareDriver::new()), "sim0");
        let metadata = NetworkGroupMetadata {
            network_group_name: "g".into(),
            ..NetworkGroupMetadata::default()
        };
        let params = ConfigureParams::default()
            .with_network("g/a", NetworkParams::default().with_batch_size(2))
            .with_network("g/b", NetworkParams::default().with_batch_size(8));
        assert_eq!(network_group_key(&device, &params, &metadata), ("sim0".to_owned(), "g".to_owned(), 8));
        assert_eq!(
            network_group_key(&device, &ConfigureParams::default(), &metadata).2,
            1
        );
    }

    #[test]
    fn test_failed_create_inserts_nothing() {
        let registry: NetworkGroupRegistry<u8, u32> = NetworkGroupRegistry::new();
        assert!(registry
            .get_or_try_insert_with(1, || Err(VdmaError::not_found("group")))
            .is_err());
        assert!(registry.is_empty());
    }
}
