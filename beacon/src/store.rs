use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::StoreError;
use crate::event::{Batch, CapturedEvent};

/// Durable key-value storage for batches that exhausted their delivery
/// attempts. Writes may fail (quota, i/o); the pipeline logs and carries on.
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// A batch at rest, waiting for startup recovery. One record per
/// `{namespace}/{user}/{backend}` key; a newer failure overwrites an older
/// record rather than appending to it.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PersistedBatch {
    pub events: Vec<CapturedEvent>,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PersistedBatch {
    pub fn from_batch(batch: &Batch, created_at: DateTime<Utc>) -> Self {
        PersistedBatch {
            events: batch.events.clone(),
            session_id: batch.session_id.clone(),
            user_id: batch.user_id.clone(),
            created_at,
        }
    }

    pub fn into_batch(self, sent_at: DateTime<Utc>) -> Batch {
        Batch::new(self.session_id, self.user_id, self.events, sent_at)
    }

    /// Expiry is evaluated at read time, never by a background sweep. A
    /// record with a future `created_at` (clock skew) is kept.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match now.signed_duration_since(self.created_at).to_std() {
            Ok(age) => age >= ttl,
            Err(_) => false,
        }
    }

    pub fn storage_key(namespace: &str, user_id: Option<&str>, backend: &str) -> String {
        format!("{namespace}/{}/{backend}", user_id.unwrap_or("anonymous"))
    }
}

/// In-memory store, usable as a stand-in where no durable storage exists.
/// An optional byte quota makes write failure paths testable.
#[derive(Default, Clone)]
pub struct MemoryStore {
    values: Arc<Mutex<HashMap<String, String>>>,
    quota_bytes: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota_bytes(quota_bytes: usize) -> Self {
        MemoryStore {
            values: Arc::new(Mutex::new(HashMap::new())),
            quota_bytes: Some(quota_bytes),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StorageBackend for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut values = self.lock();
        if let Some(quota) = self.quota_bytes {
            let occupied: usize = values
                .iter()
                .filter(|(held, _)| held.as_str() != key)
                .map(|(held, held_value)| held.len() + held_value.len())
                .sum();
            if occupied + key.len() + value.len() > quota {
                return Err(StoreError::CapacityExceeded);
            }
        }
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.lock().remove(key);
        Ok(())
    }
}

/// One file per key under a base directory. Key separators are flattened
/// into the file name, so keys must come from `PersistedBatch::storage_key`.
pub struct FileStore {
    base_dir: PathBuf,
}

impl FileStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(FileStore { base_dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
                _ => '+',
            })
            .collect();
        self.base_dir.join(format!("{file_name}.json"))
    }
}

impl StorageBackend for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        std::fs::write(self.path_for(key), value)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RawEvent;
    use chrono::TimeZone;

    fn sample_batch() -> Batch {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let events = vec![CapturedEvent::from_raw(
            RawEvent::new("cta_click"),
            now,
            None,
            None,
        )];
        Batch::new("s-1".to_string(), Some("u-1".to_string()), events, now)
    }

    #[test]
    fn storage_keys_fall_back_to_anonymous() {
        assert_eq!(
            PersistedBatch::storage_key("beacon", Some("u-1"), "primary"),
            "beacon/u-1/primary"
        );
        assert_eq!(
            PersistedBatch::storage_key("beacon", None, "primary"),
            "beacon/anonymous/primary"
        );
    }

    #[test]
    fn expiry_is_evaluated_against_the_ttl() {
        let created = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let record = PersistedBatch::from_batch(&sample_batch(), created);
        let ttl = Duration::from_millis(7_200_000);

        let one_hour_later = created + chrono::Duration::hours(1);
        assert!(!record.is_expired(one_hour_later, ttl));

        let two_hours_later = created + chrono::Duration::hours(2);
        assert!(record.is_expired(two_hours_later, ttl));

        // clock went backwards; do not treat the record as stale
        let before_creation = created - chrono::Duration::hours(1);
        assert!(!record.is_expired(before_creation, ttl));
    }

    #[test]
    fn memory_store_round_trips() {
        let store = MemoryStore::new();
        store.set("k", "v").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));

        store.remove("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn memory_store_quota_rejects_writes() {
        let store = MemoryStore::with_quota_bytes(16);
        store.set("key", "12345").unwrap();
        assert!(matches!(
            store.set("other", "123456789012345"),
            Err(StoreError::CapacityExceeded)
        ));
        // overwriting the existing key stays within quota
        store.set("key", "54321").unwrap();
    }

    #[test]
    fn file_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let key = PersistedBatch::storage_key("beacon", Some("u-1"), "primary");

        assert_eq!(store.get(&key).unwrap(), None);
        store.set(&key, "{\"marker\":1}").unwrap();
        assert_eq!(store.get(&key).unwrap().as_deref(), Some("{\"marker\":1}"));

        store.remove(&key).unwrap();
        store.remove(&key).unwrap();
        assert_eq!(store.get(&key).unwrap(), None);
    }

    #[test]
    fn persisted_batch_serializes_round_trip() {
        let record = PersistedBatch::from_batch(&sample_batch(), Utc::now());
        let json = serde_json::to_string(&record).unwrap();
        let back: PersistedBatch = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
