//! Canonical listing model, persisted record shapes and engine configuration.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "pricewatch-core";

/// Platform identity of a listing. Missing or null parts coerce to an empty string.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ItemSource {
    #[serde(default, deserialize_with = "lenient_string")]
    pub platform: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: String,
}

impl ItemSource {
    pub fn new(platform: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            id: id.into(),
        }
    }

    /// `platform:id`, the identity string fingerprints are derived from.
    pub fn identity(&self) -> String {
        format!("{}:{}", self.platform, self.id)
    }
}

/// Accepts strings, numbers, booleans and null; platform ids are frequently numeric.
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = JsonValue::deserialize(deserializer)?;
    Ok(match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s,
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        other => other.to_string(),
    })
}

/// Price movement annotation attached to every processed item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceChange {
    pub has_drop: bool,
    pub previous_price: Option<f64>,
    pub current_price: Option<f64>,
    pub drop_percent: Option<f64>,
}

impl PriceChange {
    pub fn no_drop(previous_price: Option<f64>, current_price: Option<f64>) -> Self {
        Self {
            has_drop: false,
            previous_price,
            current_price,
            drop_percent: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_change: Option<PriceChange>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// Canonical listing handed over by the normalization stage.
///
/// Fields this engine does not interpret are carried through untouched in `extra`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    #[serde(default)]
    pub source: ItemSource,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub is_new: bool,
    #[serde(default)]
    pub metadata: ItemMetadata,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl Item {
    pub fn new(platform: impl Into<String>, id: impl Into<String>, price: f64) -> Self {
        Self {
            source: ItemSource::new(platform, id),
            price: Some(price),
            ..Default::default()
        }
    }

    pub fn price_change(&self) -> Option<&PriceChange> {
        self.metadata.price_change.as_ref()
    }
}

/// One persisted entry of the aggregate fingerprint map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FingerprintRecord {
    pub fingerprint: String,
    /// Epoch milliseconds.
    pub last_seen: i64,
}

/// One observation in a per-fingerprint price series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceHistoryEntry {
    pub price: f64,
    pub date: DateTime<Utc>,
    /// Epoch milliseconds, same instant as `date`.
    pub timestamp: i64,
}

impl PriceHistoryEntry {
    pub fn observed(price: f64, at: DateTime<Utc>) -> Self {
        Self {
            price,
            date: at,
            timestamp: at.timestamp_millis(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be within [0, 100], got {value}")]
    OutOfRange { field: &'static str, value: f64 },
    #[error("{field} must be a positive integer")]
    NotPositive { field: &'static str },
    #[error("reading config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub max_stored_fingerprints: usize,
    pub price_drop_threshold_percent: f64,
    pub max_history_entries_per_item: usize,
    pub history_retention_days: u32,
    /// Delay before the first persist retry; doubles per further retry up to the max.
    pub persist_retry_delay_ms: u64,
    pub persist_retry_max_delay_ms: u64,
    pub persist_max_retries: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_stored_fingerprints: 10_000,
            price_drop_threshold_percent: 10.0,
            max_history_entries_per_item: 50,
            history_retention_days: 90,
            persist_retry_delay_ms: 500,
            persist_retry_max_delay_ms: 500,
            persist_max_retries: 1,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary variable source. Unset or unparsable values keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            max_stored_fingerprints: lookup("PRICEWATCH_MAX_FINGERPRINTS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_stored_fingerprints),
            price_drop_threshold_percent: lookup("PRICEWATCH_DROP_THRESHOLD_PERCENT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.price_drop_threshold_percent),
            max_history_entries_per_item: lookup("PRICEWATCH_MAX_HISTORY_ENTRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_history_entries_per_item),
            history_retention_days: lookup("PRICEWATCH_HISTORY_RETENTION_DAYS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.history_retention_days),
            persist_retry_delay_ms: lookup("PRICEWATCH_PERSIST_RETRY_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.persist_retry_delay_ms),
            persist_retry_max_delay_ms: lookup("PRICEWATCH_PERSIST_RETRY_MAX_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.persist_retry_max_delay_ms),
            persist_max_retries: lookup("PRICEWATCH_PERSIST_MAX_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.persist_max_retries),
        }
    }

    pub fn from_yaml_str(text: &str, origin: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text, &path.display().to_string())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.price_drop_threshold_percent;
        if !(0.0..=100.0).contains(&threshold) {
            return Err(ConfigError::OutOfRange {
                field: "price_drop_threshold_percent",
                value: threshold,
            });
        }
        if self.max_stored_fingerprints == 0 {
            return Err(ConfigError::NotPositive {
                field: "max_stored_fingerprints",
            });
        }
        if self.max_history_entries_per_item == 0 {
            return Err(ConfigError::NotPositive {
                field: "max_history_entries_per_item",
            });
        }
        if self.history_retention_days == 0 {
            return Err(ConfigError::NotPositive {
                field: "history_retention_days",
            });
        }
        Ok(())
    }

    pub fn persist_retry_delay(&self) -> Duration {
        Duration::from_millis(self.persist_retry_delay_ms)
    }

    /// Never below `persist_retry_delay`.
    pub fn persist_retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.persist_retry_max_delay_ms.max(self.persist_retry_delay_ms))
    }

    pub fn history_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.history_retention_days))
    }
}
