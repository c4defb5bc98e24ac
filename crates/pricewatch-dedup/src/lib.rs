//! Cross-run listing deduplication: fingerprinting, legacy migration, bounded
//! recency map, and persistence with retry and rollback.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use pricewatch_core::{ConfigError, EngineConfig, FingerprintRecord, Item};
use pricewatch_history::{round_one_decimal, CleanupReport, HistoryConfig, PriceHistoryTracker};
use pricewatch_storage::{BackoffPolicy, PersistentStore, StoreError};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "pricewatch-dedup";

/// Store key holding the aggregate fingerprint map.
pub const SEEN_LISTINGS_KEY: &str = "seen_listings";

/// Hex length of a SHA-256 fingerprint.
pub const FINGERPRINT_HEX_LEN: usize = 64;

/// Hex length of fingerprints written by the retired 128-bit digest.
pub const LEGACY_FINGERPRINT_HEX_LEN: usize = 32;

/// SHA-256 of `platform:id`, lowercase hex. Missing identity parts hash as empty strings.
pub fn fingerprint(item: &Item) -> String {
    let mut hasher = Sha256::new();
    hasher.update(item.source.identity().as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintShape {
    Current,
    Legacy,
    Invalid,
}

pub fn classify_fingerprint(candidate: &str) -> FingerprintShape {
    let lower_hex = candidate
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    match candidate.len() {
        FINGERPRINT_HEX_LEN if lower_hex => FingerprintShape::Current,
        LEGACY_FINGERPRINT_HEX_LEN if lower_hex => FingerprintShape::Legacy,
        _ => FingerprintShape::Invalid,
    }
}

/// Filters entries of previously persisted fingerprint maps.
///
/// Accepts bare strings and `{fingerprint, lastSeen}` objects. Legacy digests cannot be
/// mapped back to `platform:id`, so they are dropped; those listings read as new once more.
#[derive(Debug, Default)]
pub struct MigrationAdapter {
    legacy_dropped: usize,
    rejected: usize,
}

impl MigrationAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn legacy_dropped(&self) -> usize {
        self.legacy_dropped
    }

    pub fn rejected(&self) -> usize {
        self.rejected
    }

    /// `default_last_seen` applies to bare strings and records without a usable `lastSeen`.
    pub fn migrate(&mut self, raw: &JsonValue, default_last_seen: i64) -> Option<FingerprintRecord> {
        let (candidate, last_seen) = match raw {
            JsonValue::String(s) => (s.as_str(), default_last_seen),
            JsonValue::Object(obj) => {
                let Some(candidate) = obj.get("fingerprint").and_then(JsonValue::as_str) else {
                    warn!(entry = %raw, "stored entry has no fingerprint; rejecting");
                    self.rejected += 1;
                    return None;
                };
                let last_seen = obj
                    .get("lastSeen")
                    .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
                    .unwrap_or(default_last_seen);
                (candidate, last_seen)
            }
            other => {
                warn!(entry = %other, "unrecognized stored entry shape; rejecting");
                self.rejected += 1;
                return None;
            }
        };

        match classify_fingerprint(candidate) {
            FingerprintShape::Current => Some(FingerprintRecord {
                fingerprint: candidate.to_string(),
                last_seen,
            }),
            FingerprintShape::Legacy => {
                self.legacy_dropped += 1;
                None
            }
            FingerprintShape::Invalid => {
                warn!(fingerprint = candidate, "malformed stored fingerprint; rejecting");
                self.rejected += 1;
                None
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid engine config: {0}")]
    Config(#[from] ConfigError),
    #[error("opening persistent store: {0}")]
    Open(#[source] StoreError),
    #[error("loading fingerprint map: {0}")]
    Load(#[source] StoreError),
    #[error("serializing fingerprint map: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("persisting fingerprint map failed after {attempts} attempts: {source}")]
    Persist {
        attempts: usize,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InitReport {
    pub loaded: usize,
    pub accepted: usize,
    pub legacy_dropped: usize,
    pub rejected: usize,
    pub duplicates_merged: usize,
    pub repersisted: bool,
    pub history_cleanup: CleanupReport,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub total_seen_fingerprints: usize,
    pub max_capacity: usize,
    pub utilization_percent: f64,
}

pub struct DeduplicationEngine {
    store: Arc<dyn PersistentStore>,
    config: EngineConfig,
    tracker: PriceHistoryTracker,
    seen: HashMap<String, i64>,
    initialized: bool,
}

impl DeduplicationEngine {
    pub fn new(store: Arc<dyn PersistentStore>, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let tracker = PriceHistoryTracker::new(store.clone(), HistoryConfig::from(&config));
        Ok(Self {
            store,
            config,
            tracker,
            seen: HashMap::new(),
            initialized: false,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tracker(&self) -> &PriceHistoryTracker {
        &self.tracker
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub async fn initialize(&mut self) -> Result<InitReport, EngineError> {
        self.initialize_at(Utc::now()).await
    }

    /// Opens the store, sweeps expired price history and loads the fingerprint map.
    ///
    /// Only an unopenable or unreadable store is fatal. Malformed entries are skipped;
    /// dropped legacy entries trigger an immediate rewrite of the migrated map.
    pub async fn initialize_at(&mut self, now: DateTime<Utc>) -> Result<InitReport, EngineError> {
        self.store.open().await.map_err(EngineError::Open)?;

        let mut report = InitReport {
            history_cleanup: self.tracker.cleanup_old_history_at(now).await,
            ..Default::default()
        };

        let payload = self
            .store
            .get(SEEN_LISTINGS_KEY)
            .await
            .map_err(EngineError::Load)?;

        let now_ms = now.timestamp_millis();
        let mut adapter = MigrationAdapter::new();
        let mut seen: HashMap<String, i64> = HashMap::new();
        match payload {
            None => {}
            Some(JsonValue::Array(entries)) => {
                report.loaded = entries.len();
                for raw in &entries {
                    let Some(record) = adapter.migrate(raw, now_ms) else {
                        continue;
                    };
                    report.accepted += 1;
                    match seen.entry(record.fingerprint) {
                        Entry::Vacant(slot) => {
                            slot.insert(record.last_seen);
                        }
                        Entry::Occupied(mut slot) => {
                            report.duplicates_merged += 1;
                            if record.last_seen > *slot.get() {
                                slot.insert(record.last_seen);
                            }
                        }
                    }
                }
            }
            Some(other) => {
                warn!(
                    key = SEEN_LISTINGS_KEY,
                    kind = json_kind(&other),
                    "stored fingerprint map is not an array; starting empty"
                );
            }
        }
        report.legacy_dropped = adapter.legacy_dropped();
        report.rejected = adapter.rejected();

        self.seen = seen;
        self.initialized = true;

        if report.legacy_dropped > 0 {
            match self.persist().await {
                Ok(()) => report.repersisted = true,
                Err(err) => warn!(
                    operation = "initialize",
                    error = %err,
                    "rewriting migrated fingerprint map failed; next batch will retry"
                ),
            }
        }

        info!(
            loaded = report.loaded,
            accepted = report.accepted,
            legacy_dropped = report.legacy_dropped,
            rejected = report.rejected,
            duplicates_merged = report.duplicates_merged,
            history_deleted = report.history_cleanup.deleted,
            fingerprints = self.seen.len(),
            "dedup engine initialized"
        );
        Ok(report)
    }

    pub async fn find_new_listings(&mut self, items: &mut [Item]) -> Result<Vec<Item>, EngineError> {
        self.find_new_listings_at(items, Utc::now()).await
    }

    /// Marks every item's `is_new` and price change, then returns clones of the new ones
    /// in input order.
    ///
    /// The map is updated item by item, so a repeated fingerprint later in the same batch
    /// is not new. If the map cannot be persisted after retrying, the in-memory map is
    /// restored to its pre-batch state and the error is returned.
    pub async fn find_new_listings_at(
        &mut self,
        items: &mut [Item],
        now: DateTime<Utc>,
    ) -> Result<Vec<Item>, EngineError> {
        if !self.initialized {
            self.initialize_at(now).await?;
        }

        let span = info_span!("find_new_listings", items = items.len());
        async move {
            let snapshot = self.seen.clone();
            let now_ms = now.timestamp_millis();
            let mut fresh = Vec::new();
            let mut drops = 0usize;

            for item in items.iter_mut() {
                let fp = fingerprint(item);
                let is_new = !self.seen.contains_key(&fp);
                item.is_new = is_new;

                if self.tracker.track_price_change_at(item, &fp, now).await.is_drop() {
                    drops += 1;
                }

                self.seen.insert(fp, now_ms);
                if is_new {
                    fresh.push(item.clone());
                }
            }

            let evicted = self.evict_over_capacity();

            if let Err(err) = self.persist().await {
                self.seen = snapshot;
                error!(error = %err, "fingerprint map not persisted; rolled back batch");
                return Err(err);
            }

            info!(
                new = fresh.len(),
                price_drops = drops,
                evicted,
                fingerprints = self.seen.len(),
                "batch processed"
            );
            Ok(fresh)
        }
        .instrument(span)
        .await
    }

    /// Keeps the `max_stored_fingerprints` most recently seen entries. Returns how many were dropped.
    fn evict_over_capacity(&mut self) -> usize {
        let capacity = self.config.max_stored_fingerprints;
        if self.seen.len() <= capacity {
            return 0;
        }
        let before = self.seen.len();
        self.seen = self
            .records()
            .into_iter()
            .take(capacity)
            .map(|r| (r.fingerprint, r.last_seen))
            .collect();
        before - self.seen.len()
    }

    /// Current map in recency order: `last_seen` descending, fingerprint ascending on ties.
    pub fn records(&self) -> Vec<FingerprintRecord> {
        let mut records: Vec<FingerprintRecord> = self
            .seen
            .iter()
            .map(|(fingerprint, last_seen)| FingerprintRecord {
                fingerprint: fingerprint.clone(),
                last_seen: *last_seen,
            })
            .collect();
        records.sort_by(|a, b| {
            b.last_seen
                .cmp(&a.last_seen)
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        records
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.seen.contains_key(fingerprint)
    }

    fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.config.persist_max_retries,
            base_delay: self.config.persist_retry_delay(),
            max_delay: self.config.persist_retry_max_delay(),
        }
    }

    async fn persist(&self) -> Result<(), EngineError> {
        let value = serde_json::to_value(self.records())?;
        let policy = self.backoff();

        let mut attempt = 0usize;
        loop {
            match self.store.set(SEEN_LISTINGS_KEY, value.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < policy.max_retries => {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        key = SEEN_LISTINGS_KEY,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "persisting fingerprint map failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(source) => {
                    return Err(EngineError::Persist {
                        attempts: attempt + 1,
                        source,
                    })
                }
            }
        }
    }

    pub fn get_stats(&self) -> Stats {
        let total = self.seen.len();
        let capacity = self.config.max_stored_fingerprints;
        Stats {
            total_seen_fingerprints: total,
            max_capacity: capacity,
            utilization_percent: round_one_decimal(100.0 * total as f64 / capacity as f64),
        }
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
