use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A stored value with an optional TTL.
#[derive(Clone, Debug)]
struct KvEntry {
    value: serde_json::Value,
    stored_at: DateTime<Utc>,
    ttl_seconds: Option<i64>,
}

impl KvEntry {
    fn is_expired(&self) -> bool {
        match self.ttl_seconds {
            Some(ttl) => Utc::now() > self.stored_at + Duration::seconds(ttl),
            None => false,
        }
    }
}

/// In-process key/value layer for status snapshots, the worker registry,
/// capacity records and the bounded metrics/scaling histories. The durable
/// relational store stays authoritative for anything correctness-critical;
/// readers that require correctness go to the database.
#[derive(Clone, Default)]
pub struct KvStore {
    entries: Arc<RwLock<HashMap<String, KvEntry>>>,
    maps: Arc<RwLock<HashMap<String, HashMap<String, serde_json::Value>>>>,
    lists: Arc<RwLock<HashMap<String, VecDeque<serde_json::Value>>>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put<T: Serialize>(&self, key: &str, value: &T) {
        self.put_with_ttl(key, value, None).await;
    }

    pub async fn put_with_ttl<T: Serialize>(&self, key: &str, value: &T, ttl_seconds: Option<i64>) {
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("Failed to serialize KV value for {}: {}", key, e);
                return;
            }
        };
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            KvEntry {
                value,
                stored_at: Utc::now(),
                ttl_seconds,
            },
        );
    }

    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        let entries = self.entries.read().await;
        entries.get(key).and_then(|entry| {
            if entry.is_expired() {
                None
            } else {
                Some(entry.value.clone())
            }
        })
    }

    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key).await?;
        serde_json::from_value(value).ok()
    }

    pub async fn remove(&self, key: &str) {
        let mut entries = self.entries.write().await;
        entries.remove(key);
    }

    /// Insert only if the key is absent (or expired). Returns true on the
    /// first insert; used for idempotency markers and the scaling lock.
    pub async fn set_if_absent<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl_seconds: Option<i64>,
    ) -> bool {
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("Failed to serialize KV value for {}: {}", key, e);
                return false;
            }
        };
        let mut entries = self.entries.write().await;
        match entries.get(key) {
            Some(existing) if !existing.is_expired() => false,
            _ => {
                entries.insert(
                    key.to_string(),
                    KvEntry {
                        value,
                        stored_at: Utc::now(),
                        ttl_seconds,
                    },
                );
                true
            }
        }
    }

    pub async fn incr(&self, key: &str, delta: i64) -> i64 {
        let mut entries = self.entries.write().await;
        let current = entries
            .get(key)
            .filter(|e| !e.is_expired())
            .and_then(|e| e.value.as_i64())
            .unwrap_or(0);
        let next = current + delta;
        entries.insert(
            key.to_string(),
            KvEntry {
                value: serde_json::json!(next),
                stored_at: Utc::now(),
                ttl_seconds: None,
            },
        );
        next
    }

    pub async fn map_put<T: Serialize>(&self, map: &str, field: &str, value: &T) {
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("Failed to serialize map value for {}/{}: {}", map, field, e);
                return;
            }
        };
        let mut maps = self.maps.write().await;
        maps.entry(map.to_string())
            .or_default()
            .insert(field.to_string(), value);
    }

    pub async fn map_get<T: DeserializeOwned>(&self, map: &str, field: &str) -> Option<T> {
        let maps = self.maps.read().await;
        maps.get(map)
            .and_then(|m| m.get(field))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub async fn map_remove(&self, map: &str, field: &str) -> bool {
        let mut maps = self.maps.write().await;
        maps.get_mut(map)
            .map(|m| m.remove(field).is_some())
            .unwrap_or(false)
    }

    pub async fn map_values<T: DeserializeOwned>(&self, map: &str) -> Vec<T> {
        let maps = self.maps.read().await;
        maps.get(map)
            .map(|m| {
                m.values()
                    .filter_map(|v| serde_json::from_value(v.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn map_len(&self, map: &str) -> usize {
        let maps = self.maps.read().await;
        maps.get(map).map(|m| m.len()).unwrap_or(0)
    }

    /// Push to the front of a bounded list, dropping the oldest entries
    /// beyond `cap` (newest first, like LPUSH + LTRIM).
    pub async fn list_push_capped<T: Serialize>(&self, key: &str, value: &T, cap: usize) {
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("Failed to serialize list value for {}: {}", key, e);
                return;
            }
        };
        let mut lists = self.lists.write().await;
        let list = lists.entry(key.to_string()).or_default();
        list.push_front(value);
        while list.len() > cap {
            list.pop_back();
        }
    }

    pub async fn list_entries<T: DeserializeOwned>(&self, key: &str) -> Vec<T> {
        let lists = self.lists.read().await;
        lists
            .get(key)
            .map(|l| {
                l.iter()
                    .filter_map(|v| serde_json::from_value(v.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop expired TTL entries. Returns how many were removed.
    pub async fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired());
        before - entries.len()
    }
}
