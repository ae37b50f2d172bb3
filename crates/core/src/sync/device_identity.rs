//! Stable per-device identifier used to tag writes and recognize echoes.

use log::{debug, warn};
use rand::Rng;
use std::sync::{Arc, OnceLock};

use crate::local_store::LocalStore;

/// Local store key holding the device id.
pub const DEVICE_ID_KEY: &str = "workspace_sync.device_id";

const RANDOM_SUFFIX_LEN: usize = 9;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generates the device id once per browser profile / install and caches it.
///
/// The id is created lazily on first use, persisted to the local store and
/// never rotated. No network access is involved.
pub struct DeviceIdentity {
    store: Arc<dyn LocalStore>,
    cached: OnceLock<String>,
}

impl DeviceIdentity {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self {
            store,
            cached: OnceLock::new(),
        }
    }

    /// Returns the device id, generating and persisting it on first call.
    pub fn device_id(&self) -> &str {
        self.cached.get_or_init(|| self.load_or_create())
    }

    /// True when `device_id` is this device.
    pub fn is_local(&self, device_id: &str) -> bool {
        self.device_id() == device_id
    }

    fn load_or_create(&self) -> String {
        match self.store.get(DEVICE_ID_KEY) {
            Ok(Some(existing)) if !existing.trim().is_empty() => {
                debug!("[DeviceIdentity] Loaded device id {}", existing);
                return existing;
            }
            Ok(_) => {}
            Err(e) => warn!("[DeviceIdentity] Failed to read device id: {}", e),
        }

        let generated = generate_device_id();
        if let Err(e) = self.store.set(DEVICE_ID_KEY, &generated) {
            // Still usable for this process; a relaunch will mint a new one.
            warn!("[DeviceIdentity] Failed to persist device id: {}", e);
        }
        debug!("[DeviceIdentity] Generated device id {}", generated);
        generated
    }
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.cached.get())
            .finish()
    }
}

/// `device-<unix millis>-<random base36 suffix>`.
pub fn generate_device_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..RANDOM_SUFFIX_LEN)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("device-{}-{}", chrono::Utc::now().timestamp_millis(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{Result, StorageError};
    use crate::local_store::MemoryLocalStore;

    struct BrokenStore;

    impl LocalStore for BrokenStore {
        fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(StorageError::Poisoned)
        }
        fn set(&self, _key: &str, _value: &str) -> Result<()> {
            Err(StorageError::Poisoned)
        }
        fn remove(&self, _key: &str) -> Result<()> {
            Err(StorageError::Poisoned)
        }
    }

    #[test]
    fn generated_id_has_timestamp_and_suffix() {
        let id = generate_device_id();
        let parts = id.split('-').collect::<Vec<_>>();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "device");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), RANDOM_SUFFIX_LEN);
    }

    #[test]
    fn device_id_is_stable_across_instances_sharing_a_store() {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryLocalStore::new());
        let first = DeviceIdentity::new(Arc::clone(&store));
        let id = first.device_id().to_string();
        assert_eq!(first.device_id(), id);

        let relaunched = DeviceIdentity::new(Arc::clone(&store));
        assert_eq!(relaunched.device_id(), id);
        assert_eq!(store.get(DEVICE_ID_KEY).expect("get"), Some(id));
    }

    #[test]
    fn existing_id_is_reused() {
        let store = Arc::new(MemoryLocalStore::with_entries([(DEVICE_ID_KEY, "device-1-abc")]));
        let identity = DeviceIdentity::new(store);
        assert_eq!(identity.device_id(), "device-1-abc");
        assert!(identity.is_local("device-1-abc"));
        assert!(!identity.is_local("device-2-xyz"));
    }

    #[test]
    fn storage_failure_still_yields_a_cached_id() {
        let identity = DeviceIdentity::new(Arc::new(BrokenStore));
        let id = identity.device_id().to_string();
        assert!(id.starts_with("device-"));
        assert_eq!(identity.device_id(), id);
    }
}
