//! The device registry (C3): the single authoritative in-memory table of
//! live device state, keyed by internal id and by tracker uniqueid.
//!
//! Grounded on `mayara-server/src/radar/mod.rs`'s `SharedRadars`/`Radars`
//! split: a cheaply `Clone`-able handle wrapping `Arc<RwLock<...>>`, with a
//! private inner struct holding the actual map so the lock only ever guards
//! that one field.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use gateway_core::{Device, DeviceStatus};

struct Inner {
    by_id: HashMap<i64, Device>,
    uniqueid_to_id: HashMap<String, i64>,
    next_synthetic_id: i64,
}

/// Guards against piling up concurrent selective-refresh calls for the same
/// unseen uniqueid: collapses concurrent lookups into one in-flight upstream
/// refresh rather than one request per caller.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RwLock<Inner>>,
    refresh_gate: Arc<Mutex<()>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            inner: Arc::new(RwLock::new(Inner {
                by_id: HashMap::new(),
                uniqueid_to_id: HashMap::new(),
                next_synthetic_id: -1,
            })),
            refresh_gate: Arc::new(Mutex::new(())),
        }
    }

    pub async fn get_by_id(&self, id: i64) -> Option<Device> {
        self.inner.read().await.by_id.get(&id).cloned()
    }

    pub async fn get_by_uniqueid(&self, uniqueid: &str) -> Option<Device> {
        let inner = self.inner.read().await;
        let id = inner.uniqueid_to_id.get(uniqueid)?;
        inner.by_id.get(id).cloned()
    }

    /// Read-only snapshot of every device assigned to `device_ids`, in that
    /// order, skipping any that have since disappeared.
    pub async fn snapshot_for_user(&self, device_ids: &[i64]) -> Vec<Device> {
        let inner = self.inner.read().await;
        device_ids
            .iter()
            .filter_map(|id| inner.by_id.get(id).cloned())
            .collect()
    }

    /// Full refresh: replaces the table atomically.
    pub async fn replace_all(&self, devices: Vec<Device>) {
        let mut inner = self.inner.write().await;
        inner.by_id.clear();
        inner.uniqueid_to_id.clear();
        for device in devices {
            inner.uniqueid_to_id.insert(device.uniqueid.clone(), device.id);
            inner.by_id.insert(device.id, device);
        }
    }

    /// Selective refresh: overwrite the whitelisted field set on existing
    /// devices, insert unknown ones, never remove absentees.
    pub async fn merge_selective(&self, devices: Vec<Device>) {
        let mut inner = self.inner.write().await;
        for incoming in devices {
            match inner.by_id.get_mut(&incoming.id) {
                Some(existing) => existing.merge_selective(&incoming),
                None => {
                    inner
                        .uniqueid_to_id
                        .insert(incoming.uniqueid.clone(), incoming.id);
                    inner.by_id.insert(incoming.id, incoming);
                }
            }
        }
    }

    /// Apply a mutation to the device identified by `uniqueid`, serialized
    /// under the registry's single write lock. Returns `None` if the device
    /// is unknown.
    pub async fn mutate<F>(&self, uniqueid: &str, f: F) -> Option<Device>
    where
        F: FnOnce(&mut Device),
    {
        let mut inner = self.inner.write().await;
        let id = *inner.uniqueid_to_id.get(uniqueid)?;
        let device = inner.by_id.get_mut(&id)?;
        f(device);
        Some(device.clone())
    }

    /// Insert a device sighted for the first time under a synthetic negative
    /// id, used when a selective refresh for an unknown uniqueid still
    /// leaves it unresolved upstream (so ingestion has somewhere to record
    /// it rather than dropping silently).
    pub async fn insert_unknown(&self, uniqueid: &str) -> Device {
        let mut inner = self.inner.write().await;
        let id = inner.next_synthetic_id;
        inner.next_synthetic_id -= 1;
        let device = Device::new(id, uniqueid.to_string(), uniqueid.to_string());
        inner.uniqueid_to_id.insert(uniqueid.to_string(), id);
        inner.by_id.insert(id, device.clone());
        device
    }

    /// Runs `refresh` at most once concurrently for a given registry; callers
    /// racing to resolve the same unseen uniqueid collapse into one upstream
    /// call.
    pub async fn with_refresh_gate<F, Fut>(&self, refresh: F)
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let _guard = self.refresh_gate.lock().await;
        refresh().await;
    }

    /// Periodic liveness sweep input: every device's (id, uniqueid, status,
    /// lastupdate) tuple.
    pub async fn all_devices(&self) -> Vec<Device> {
        self.inner.read().await.by_id.values().cloned().collect()
    }

    pub async fn set_status(&self, id: i64, status: DeviceStatus) {
        let mut inner = self.inner.write().await;
        if let Some(device) = inner.by_id.get_mut(&id) {
            device.status = status;
            if status == DeviceStatus::Offline {
                device.speed = 0.0;
            }
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_device(id: i64, uniqueid: &str) -> Device {
        let mut d = Device::new(id, uniqueid.to_string(), "truck".to_string());
        d.lastupdate = Some(Utc::now());
        d
    }

    #[tokio::test]
    async fn replace_all_then_lookup_both_ways() {
        let reg = Registry::new();
        reg.replace_all(vec![sample_device(1, "imei-1")]).await;
        assert!(reg.get_by_id(1).await.is_some());
        assert!(reg.get_by_uniqueid("imei-1").await.is_some());
    }

    #[tokio::test]
    async fn merge_selective_preserves_name_and_inserts_unknown() {
        let reg = Registry::new();
        reg.replace_all(vec![sample_device(1, "imei-1")]).await;

        let mut updated = sample_device(1, "imei-1");
        updated.name = "renamed".to_string();
        updated.latitude = -9.9;
        reg.merge_selective(vec![updated]).await;

        let device = reg.get_by_id(1).await.unwrap();
        assert_eq!(device.name, "truck"); // name is excluded from the whitelist
        assert_eq!(device.latitude, -9.9);

        reg.merge_selective(vec![sample_device(2, "imei-2")]).await;
        assert!(reg.get_by_id(2).await.is_some());
        assert!(reg.get_by_id(1).await.is_some()); // absentees are not removed
    }

    #[tokio::test]
    async fn mutate_unknown_uniqueid_returns_none() {
        let reg = Registry::new();
        assert!(reg.mutate("nope", |_| {}).await.is_none());
    }

    #[tokio::test]
    async fn set_status_offline_forces_speed_zero() {
        let reg = Registry::new();
        let mut device = sample_device(1, "imei-1");
        device.speed = 42.0;
        reg.replace_all(vec![device]).await;

        reg.set_status(1, DeviceStatus::Offline).await;
        let device = reg.get_by_id(1).await.unwrap();
        assert_eq!(device.status, DeviceStatus::Offline);
        assert_eq!(device.speed, 0.0);
    }
}
