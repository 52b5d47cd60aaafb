//! String-keyed tunables.
//!
//! The bridge never parses configuration files itself — it consumes a flat
//! key/value map with per-key defaults, buildable programmatically or from a
//! JSON object string supplied by whatever configuration layer sits above.

use std::collections::HashMap;

use serde_json::Value as JsonValue;

use crate::error::{Error, Result};

/// Number of worker threads. Keep at 1 unless the native runtime tolerates
/// concurrent calls from multiple registered threads.
pub const POOL_SIZE: &str = "threadpool.size";
/// Completion re-check period for blocked callers, in milliseconds.
pub const RECHECK_MILLIS: &str = "dispatch.recheck_millis";

pub const DEFAULT_POOL_SIZE: usize = 1;
pub const DEFAULT_RECHECK_MILLIS: u64 = 250;

#[derive(Debug, Clone, Default)]
pub struct Settings {
    values: HashMap<String, JsonValue>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON object string, e.g. `{"threadpool.size": 2}`.
    pub fn from_json(json: &str) -> Result<Self> {
        let parsed: JsonValue = serde_json::from_str(json)
            .map_err(|e| Error::Configuration(format!("invalid settings JSON: {e}")))?;
        let JsonValue::Object(map) = parsed else {
            return Err(Error::Configuration(
                "settings JSON must be an object".to_string(),
            ));
        };
        Ok(Self {
            values: map.into_iter().collect(),
        })
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        match self.values.get(key) {
            Some(JsonValue::Number(n)) => n.as_u64().unwrap_or(default),
            Some(JsonValue::String(s)) => s.parse().unwrap_or(default),
            _ => default,
        }
    }

    pub fn get_usize(&self, key: &str, default: usize) -> usize {
        self.get_u64(key, default as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_on_empty() {
        let s = Settings::new();
        assert_eq!(s.get_usize(POOL_SIZE, DEFAULT_POOL_SIZE), 1);
        assert_eq!(s.get_u64(RECHECK_MILLIS, DEFAULT_RECHECK_MILLIS), 250);
    }

    #[test]
    fn test_from_json() {
        let s = Settings::from_json(r#"{"threadpool.size": 4, "dispatch.recheck_millis": "50"}"#)
            .unwrap();
        assert_eq!(s.get_usize(POOL_SIZE, 1), 4);
        assert_eq!(s.get_u64(RECHECK_MILLIS, 250), 50);
    }

    #[test]
    fn test_invalid_json() {
        assert!(Settings::from_json("not json").is_err());
        assert!(Settings::from_json("[1,2]").is_err());
    }

    #[test]
    fn test_set_overrides() {
        let mut s = Settings::new();
        s.set(POOL_SIZE, 3).set(RECHECK_MILLIS, 10);
        assert_eq!(s.get_usize(POOL_SIZE, 1), 3);
        assert_eq!(s.get_u64(RECHECK_MILLIS, 250), 10);
        assert_eq!(s.get_u64("missing", 9), 9);
    }
}
