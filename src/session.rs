use std::collections::HashMap;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use time::{Duration, OffsetDateTime};

use crate::utils::now;

/// Per-visitor key-value store whose entries expire.
///
/// Owned by the caller (one per browser session or CLI invocation) and passed
/// by `&mut` into the operations that need it.
#[derive(Debug, Clone, Default)]
pub struct Session {
    entries: HashMap<String, Entry>,
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: OffsetDateTime,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Serialize>(&mut self, key: &str, value: &T, ttl: Duration) -> serde_json::Result<()> {
        let value = serde_json::to_value(value)?;
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: now() + ttl,
            },
        );
        Ok(())
    }

    /// Expired or undecodable entries are dropped and read as `None`.
    pub fn get<T: DeserializeOwned>(&mut self, key: &str) -> Option<T> {
        let entry = self.entries.get(key)?;
        if entry.expires_at <= now() {
            self.entries.remove(key);
            return None;
        }
        match serde_json::from_value(entry.value.clone()) {
            Ok(value) => Some(value),
            Err(_) => {
                self.entries.remove(key);
                None
            }
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.remove(key);
    }

    pub fn contains(&mut self, key: &str) -> bool {
        self.get::<Value>(key).is_some()
    }
}
