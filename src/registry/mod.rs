// registry/mod.rs
//! The three known devices and their persisted settings.

mod store;

pub use store::{FileStore, KvStore};
#[cfg(test)]
pub use store::MemoryStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::{
    address::{self, DeviceAddress},
    error::AppError,
    models::DeviceId,
};

/// Versioned so an incompatible layout can move to a new key and leave the
/// old one behind.
pub const STORAGE_KEY: &str = "wled:devices:v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub name: String,
    #[schema(value_type = Option<String>)]
    pub address: Option<DeviceAddress>,
    pub connected: bool,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    #[schema(value_type = Option<i64>)]
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl DeviceRecord {
    pub fn default_for(id: DeviceId) -> Self {
        let (name, address) = match id {
            DeviceId::Esp1 => ("Driver Door", "http://192.168.1.50"),
            DeviceId::Esp2 => ("Front Dashboard", "http://192.168.1.51"),
            DeviceId::Esp3 => ("Passenger Door", "http://192.168.1.52"),
        };
        Self {
            id,
            name: name.to_string(),
            address: DeviceAddress::parse(address).ok(),
            connected: false,
            last_checked_at: None,
        }
    }

    /// Address to talk to, only once a connectivity test has passed.
    pub fn reachable_address(&self) -> Option<&DeviceAddress> {
        if self.connected {
            self.address.as_ref()
        } else {
            None
        }
    }
}

/// Partial update. Absent fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct DevicePatch {
    pub name: Option<String>,
    /// Raw user text; normalized before it is stored. Empty clears the address.
    pub address: Option<String>,
    pub connected: Option<bool>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

pub struct DeviceRegistry {
    records: Mutex<HashMap<DeviceId, DeviceRecord>>,
    store: Arc<dyn KvStore>,
}

fn defaults() -> HashMap<DeviceId, DeviceRecord> {
    DeviceId::ALL
        .into_iter()
        .map(|id| (id, DeviceRecord::default_for(id)))
        .collect()
}

impl DeviceRegistry {
    /// Loads persisted records over the defaults. Never fails: anything that
    /// cannot be read falls back to the default for that field.
    pub fn load(store: Arc<dyn KvStore>) -> Self {
        let mut records = defaults();

        match store.get(STORAGE_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<Value>(&raw) {
                Ok(persisted) => merge_persisted(&mut records, &persisted),
                Err(e) => warn!("Ignoring unreadable device settings: {}", e),
            },
            Ok(None) => debug!("No persisted device settings, using defaults"),
            Err(e) => warn!("Failed to read device settings: {}", e),
        }

        Self {
            records: Mutex::new(records),
            store,
        }
    }

    pub async fn get(&self, id: DeviceId) -> DeviceRecord {
        let records = self.records.lock().await;
        records
            .get(&id)
            .cloned()
            .unwrap_or_else(|| DeviceRecord::default_for(id))
    }

    pub async fn all(&self) -> Vec<DeviceRecord> {
        let records = self.records.lock().await;
        DeviceId::ALL
            .into_iter()
            .filter_map(|id| records.get(&id).cloned())
            .collect()
    }

    /// Merges `patch` into the record for `id` and persists the result.
    ///
    /// A patch that carries an address but no `connected` value forces
    /// `connected` to false.
    pub async fn patch(&self, id: DeviceId, patch: DevicePatch) -> Result<DeviceRecord, AppError> {
        let mut records = self.records.lock().await;
        self.apply(&mut records, id, patch).await
    }

    /// Like [`patch`](Self::patch), but only while the stored address is still
    /// `expected`. Returns `None` and changes nothing once it has been edited.
    pub async fn patch_if_address(
        &self,
        id: DeviceId,
        expected: &DeviceAddress,
        patch: DevicePatch,
    ) -> Result<Option<DeviceRecord>, AppError> {
        let mut records = self.records.lock().await;
        let current = records.get(&id).and_then(|record| record.address.as_ref());
        if current != Some(expected) {
            return Ok(None);
        }
        self.apply(&mut records, id, patch).await.map(Some)
    }

    async fn apply(
        &self,
        records: &mut HashMap<DeviceId, DeviceRecord>,
        id: DeviceId,
        patch: DevicePatch,
    ) -> Result<DeviceRecord, AppError> {
        let mut record = records
            .get(&id)
            .cloned()
            .unwrap_or_else(|| DeviceRecord::default_for(id));

        if let Some(name) = patch.name {
            record.name = name;
        }
        if let Some(raw) = patch.address.as_deref() {
            record.address = if address::normalize(raw).is_empty() {
                None
            } else {
                Some(DeviceAddress::parse(raw)?)
            };
            record.connected = false;
        }
        if let Some(connected) = patch.connected {
            record.connected = connected;
        }
        if let Some(at) = patch.last_checked_at {
            record.last_checked_at = Some(at);
        }

        let mut next = records.clone();
        next.insert(id, record.clone());
        self.persist(&next).await?;
        *records = next;

        debug!(%id, connected = record.connected, "Device record updated");
        Ok(record)
    }

    pub async fn reset(&self) -> Result<Vec<DeviceRecord>, AppError> {
        let mut records = self.records.lock().await;
        let next = defaults();
        self.persist(&next).await?;
        *records = next;
        info!("Device settings reset to defaults");

        Ok(DeviceId::ALL
            .into_iter()
            .map(DeviceRecord::default_for)
            .collect())
    }

    /// Store writes are blocking file IO, so they run off the async workers.
    async fn persist(&self, records: &HashMap<DeviceId, DeviceRecord>) -> Result<(), AppError> {
        let raw = serde_json::to_string(records).map_err(|e| AppError::Storage(e.to_string()))?;
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.set(STORAGE_KEY, &raw))
            .await
            .map_err(|e| AppError::Storage(e.to_string()))?
            .map_err(|e| AppError::Storage(e.to_string()))
    }
}

fn merge_persisted(records: &mut HashMap<DeviceId, DeviceRecord>, persisted: &Value) {
    for id in DeviceId::ALL {
        let Some(incoming) = persisted.get(id.as_str()).and_then(Value::as_object) else {
            continue;
        };
        let Some(record) = records.get_mut(&id) else {
            continue;
        };

        if let Some(name) = incoming.get("name").and_then(Value::as_str) {
            record.name = name.to_string();
        }
        // A persisted `connected` only counts for the address it was tested
        // against; when that address is dropped the default stays untested.
        let address_kept = match incoming.get("address") {
            None => true,
            Some(Value::Null) => {
                record.address = None;
                true
            }
            Some(Value::String(raw)) if address::normalize(raw).is_empty() => {
                record.address = None;
                true
            }
            Some(Value::String(raw)) => match DeviceAddress::parse(raw) {
                Ok(addr) => {
                    record.address = Some(addr);
                    true
                }
                Err(e) => {
                    warn!(%id, "Discarding persisted address: {}", e);
                    false
                }
            },
            Some(other) => {
                warn!(%id, value = %other, "Discarding persisted address");
                false
            }
        };
        if let Some(connected) = incoming.get("connected").and_then(Value::as_bool) {
            record.connected = connected && address_kept;
        }
        if let Some(at) = incoming
            .get("last_checked_at")
            .and_then(Value::as_i64)
            .and_then(DateTime::from_timestamp_millis)
        {
            record.last_checked_at = Some(at);
        }
    }
}
