//! Bounded per-listing price series and price-drop annotation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use pricewatch_core::{EngineConfig, Item, PriceChange, PriceHistoryEntry};
use pricewatch_storage::{PersistentStore, StoreError};
use serde::Serialize;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "pricewatch-history";

pub const HISTORY_KEY_PREFIX: &str = "price_history_";

pub fn history_key(fingerprint: &str) -> String {
    format!("{HISTORY_KEY_PREFIX}{fingerprint}")
}

#[derive(Debug, Clone, Copy)]
pub struct HistoryConfig {
    pub drop_threshold_percent: f64,
    pub max_entries: usize,
    pub retention: chrono::Duration,
}

impl From<&EngineConfig> for HistoryConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            drop_threshold_percent: config.price_drop_threshold_percent,
            max_entries: config.max_history_entries_per_item.max(1),
            retention: config.history_retention(),
        }
    }
}

/// What happened to one listing's price series. History failures stay here instead of
/// propagating, so they never block novelty detection.
#[derive(Debug)]
pub enum PriceTrackOutcome {
    FirstObservation,
    Unchanged,
    Changed { drop_percent: Option<f64>, has_drop: bool },
    /// The item carried no price; nothing was read or written.
    Unpriced,
    /// The series could not be read or written; the item got a "no drop" annotation.
    Degraded(StoreError),
}

impl PriceTrackOutcome {
    pub fn is_drop(&self) -> bool {
        matches!(self, Self::Changed { has_drop: true, .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub scanned: usize,
    pub deleted: usize,
    pub failed: usize,
}

pub fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Compares a stored price against the current one.
///
/// `drop_percent` is negative for increases. A non-positive previous price has no
/// meaningful percentage and is reported without one.
pub fn compute_price_change(previous: f64, current: f64, threshold_percent: f64) -> PriceChange {
    if !(previous.is_finite() && previous > 0.0 && current.is_finite()) {
        return PriceChange::no_drop(Some(previous), Some(current));
    }
    let drop_amount = previous - current;
    let drop_percent = round_one_decimal(100.0 * drop_amount / previous);
    PriceChange {
        has_drop: drop_amount > 0.0 && drop_percent >= threshold_percent,
        previous_price: Some(previous),
        current_price: Some(current),
        drop_percent: Some(drop_percent),
    }
}

pub struct PriceHistoryTracker {
    store: Arc<dyn PersistentStore>,
    config: HistoryConfig,
}

impl PriceHistoryTracker {
    pub fn new(store: Arc<dyn PersistentStore>, config: HistoryConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    pub async fn load_history(&self, fingerprint: &str) -> Result<Vec<PriceHistoryEntry>, StoreError> {
        let key = history_key(fingerprint);
        match self.store.get(&key).await? {
            None => Ok(Vec::new()),
            Some(value) => {
                serde_json::from_value(value).map_err(|source| StoreError::Json { key, source })
            }
        }
    }

    async fn save_history(&self, fingerprint: &str, series: &[PriceHistoryEntry]) -> Result<(), StoreError> {
        let key = history_key(fingerprint);
        let value = serde_json::to_value(series).map_err(|source| StoreError::Json {
            key: key.clone(),
            source,
        })?;
        self.store.set(&key, value).await
    }

    pub async fn track_price_change(&self, item: &mut Item, fingerprint: &str) -> PriceTrackOutcome {
        self.track_price_change_at(item, fingerprint, Utc::now()).await
    }

    /// Annotates `item.metadata.price_change` and appends to the series when the price moved.
    pub async fn track_price_change_at(
        &self,
        item: &mut Item,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> PriceTrackOutcome {
        let Some(current) = item.price else {
            item.metadata.price_change = Some(PriceChange::no_drop(None, None));
            return PriceTrackOutcome::Unpriced;
        };

        match self.record_observation(fingerprint, current, now).await {
            Ok((change, outcome)) => {
                item.metadata.price_change = Some(change);
                outcome
            }
            Err(err) => {
                warn!(
                    fingerprint,
                    operation = "track_price_change",
                    error = %err,
                    "price history unavailable; annotating as no drop"
                );
                item.metadata.price_change = Some(PriceChange::no_drop(None, Some(current)));
                PriceTrackOutcome::Degraded(err)
            }
        }
    }

    async fn record_observation(
        &self,
        fingerprint: &str,
        current: f64,
        now: DateTime<Utc>,
    ) -> Result<(PriceChange, PriceTrackOutcome), StoreError> {
        let mut series = match self.load_history(fingerprint).await {
            Ok(series) => series,
            Err(StoreError::Json { key, source }) => {
                warn!(
                    fingerprint,
                    key = key.as_str(),
                    error = %source,
                    "unreadable price history; starting a new series"
                );
                Vec::new()
            }
            Err(err) => return Err(err),
        };

        let (change, outcome) = match series.last() {
            None => (
                PriceChange::no_drop(None, Some(current)),
                PriceTrackOutcome::FirstObservation,
            ),
            Some(last) if last.price == current => {
                return Ok((
                    PriceChange::no_drop(Some(last.price), Some(current)),
                    PriceTrackOutcome::Unchanged,
                ));
            }
            Some(last) => {
                let change = compute_price_change(last.price, current, self.config.drop_threshold_percent);
                let outcome = PriceTrackOutcome::Changed {
                    drop_percent: change.drop_percent,
                    has_drop: change.has_drop,
                };
                (change, outcome)
            }
        };

        series.push(PriceHistoryEntry::observed(current, now));
        if series.len() > self.config.max_entries {
            let excess = series.len() - self.config.max_entries;
            series.drain(..excess);
        }
        self.save_history(fingerprint, &series).await?;
        debug!(fingerprint, entries = series.len(), "price history appended");

        Ok((change, outcome))
    }

    pub async fn cleanup_old_history(&self) -> CleanupReport {
        self.cleanup_old_history_at(Utc::now()).await
    }

    /// Deletes every series whose newest entry is older than the retention window, and
    /// every series that cannot be parsed. Partial progress is fine; failures are logged
    /// and counted.
    pub async fn cleanup_old_history_at(&self, now: DateTime<Utc>) -> CleanupReport {
        let mut report = CleanupReport::default();
        let cutoff = (now - self.config.retention).timestamp_millis();

        let keys = match self.store.list_keys().await {
            Ok(keys) => keys,
            Err(err) => {
                warn!(operation = "cleanup_old_history", error = %err, "listing history keys failed");
                report.failed += 1;
                return report;
            }
        };

        for key in keys.iter().filter(|k| k.starts_with(HISTORY_KEY_PREFIX)) {
            report.scanned += 1;
            // Unreadable series are removed.
            let series = match self.store.get(key).await {
                Ok(Some(value)) => match serde_json::from_value::<Vec<PriceHistoryEntry>>(value) {
                    Ok(series) => series,
                    Err(err) => {
                        warn!(key = key.as_str(), error = %err, "unreadable price history; deleting");
                        Vec::new()
                    }
                },
                Ok(None) => continue,
                Err(StoreError::Json { source, .. }) => {
                    warn!(key = key.as_str(), error = %source, "unreadable price history; deleting");
                    Vec::new()
                }
                Err(err) => {
                    warn!(key = key.as_str(), operation = "cleanup_old_history", error = %err, "reading price history failed");
                    report.failed += 1;
                    continue;
                }
            };

            let newest = series.iter().map(|e| e.timestamp).max();
            if newest.is_some_and(|ts| ts >= cutoff) {
                continue;
            }

            match self.store.delete(key).await {
                Ok(()) => report.deleted += 1,
                Err(err) => {
                    warn!(key = key.as_str(), operation = "cleanup_old_history", error = %err, "deleting price history failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            scanned = report.scanned,
            deleted = report.deleted,
            failed = report.failed,
            "price history cleanup finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pricewatch_storage::MemoryStore;
    use serde_json::json;

    const FP: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    fn at(day: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, 12, minute, 0).single().unwrap()
    }

    fn tracker(store: Arc<MemoryStore>, max_entries: usize) -> PriceHistoryTracker {
        PriceHistoryTracker::new(
            store,
            HistoryConfig {
                drop_threshold_percent: 10.0,
                max_entries,
                retention: chrono::Duration::days(30),
            },
        )
    }

    #[test]
    fn drop_threshold_boundary() {
        let below = compute_price_change(100.0, 91.0, 10.0);
        assert_eq!(below.drop_percent, Some(9.0));
        assert!(!below.has_drop);

        let at_threshold = compute_price_change(100.0, 90.0, 10.0);
        assert_eq!(at_threshold.drop_percent, Some(10.0));
        assert!(at_threshold.has_drop);

        let eleven = compute_price_change(100.0, 89.0, 10.0);
        assert_eq!(eleven.drop_percent, Some(11.0));
        assert!(eleven.has_drop);
    }

    #[test]
    fn increases_are_negative_and_never_drops() {
        let change = compute_price_change(80.0, 100.0, 0.0);
        assert_eq!(change.drop_percent, Some(-25.0));
        assert!(!change.has_drop);
    }

    #[test]
    fn zero_previous_price_has_no_percentage() {
        let change = compute_price_change(0.0, 10.0, 10.0);
        assert_eq!(change.drop_percent, None);
        assert!(!change.has_drop);
    }

    #[test]
    fn drop_percent_rounds_to_one_decimal() {
        let change = compute_price_change(300.0, 250.0, 10.0);
        assert_eq!(change.drop_percent, Some(16.7));
    }

    #[tokio::test]
    async fn first_observation_then_drop_then_unchanged() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(store.clone(), 10);

        let mut item = Item::new("ebay", "1", 100.0);
        let outcome = tracker.track_price_change_at(&mut item, FP, at(1, 0)).await;
        assert!(matches!(outcome, PriceTrackOutcome::FirstObservation));
        let change = item.price_change().expect("annotated");
        assert!(!change.has_drop);
        assert_eq!(change.drop_percent, None);
        assert_eq!(change.previous_price, None);

        let mut item = Item::new("ebay", "1", 85.0);
        let outcome = tracker.track_price_change_at(&mut item, FP, at(2, 0)).await;
        assert!(outcome.is_drop());
        let change = item.price_change().expect("annotated");
        assert_eq!(change.previous_price, Some(100.0));
        assert_eq!(change.drop_percent, Some(15.0));

        let mut item = Item::new("ebay", "1", 85.0);
        let outcome = tracker.track_price_change_at(&mut item, FP, at(3, 0)).await;
        assert!(matches!(outcome, PriceTrackOutcome::Unchanged));
        assert_eq!(item.price_change().and_then(|c| c.drop_percent), None);

        let series = tracker.load_history(FP).await.expect("load");
        assert_eq!(series.len(), 2);
        assert_eq!(series[1].timestamp, at(2, 0).timestamp_millis());
    }

    #[tokio::test]
    async fn series_is_trimmed_to_most_recent_entries() {
        let store = Arc::new(MemoryStore::new());
        let max = 5;
        let tracker = tracker(store, max);

        for i in 0..(max + 5) {
            let mut item = Item::new("ebay", "1", 100.0 + i as f64);
            tracker.track_price_change_at(&mut item, FP, at(1, i as u32)).await;
        }

        let series = tracker.load_history(FP).await.expect("load");
        assert_eq!(series.len(), max);
        let prices: Vec<f64> = series.iter().map(|e| e.price).collect();
        assert_eq!(prices, vec![105.0, 106.0, 107.0, 108.0, 109.0]);
        assert!(series.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[tokio::test]
    async fn store_failures_degrade_to_no_drop() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(store.clone(), 10);

        store.fail_next_gets(1).await;
        let mut item = Item::new("ebay", "1", 50.0);
        let outcome = tracker.track_price_change_at(&mut item, FP, at(1, 0)).await;
        assert!(matches!(outcome, PriceTrackOutcome::Degraded(_)));
        assert_eq!(item.price_change(), Some(&PriceChange::no_drop(None, Some(50.0))));

        store.fail_next_sets(1).await;
        let mut item = Item::new("ebay", "1", 50.0);
        let outcome = tracker.track_price_change_at(&mut item, FP, at(1, 1)).await;
        assert!(matches!(outcome, PriceTrackOutcome::Degraded(_)));
        assert!(tracker.load_history(FP).await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn unpriced_items_are_annotated_without_io() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(store.clone(), 10);
        let mut item = Item::new("ebay", "1", 0.0);
        item.price = None;
        let outcome = tracker.track_price_change_at(&mut item, FP, at(1, 0)).await;
        assert!(matches!(outcome, PriceTrackOutcome::Unpriced));
        assert!(item.price_change().is_some());
        assert_eq!(store.set_calls().await, 0);
    }

    #[tokio::test]
    async fn cleanup_removes_only_expired_history() {
        let now = at(31, 0);
        let stale = json!([{ "price": 10.0, "date": "2026-01-01T00:00:00Z", "timestamp": at(1, 0).timestamp_millis() - 86_400_000 * 60 }]);
        let fresh = serde_json::to_value(vec![PriceHistoryEntry::observed(12.0, at(30, 0))]).unwrap();
        let store = Arc::new(MemoryStore::with_entries([
            (history_key("stale"), stale),
            (history_key("fresh"), fresh),
            (history_key("empty"), json!([])),
            (history_key("corrupt"), json!({"not": "a series"})),
            ("seen_listings".to_string(), json!([])),
        ]));
        let tracker = tracker(store.clone(), 10);

        let report = tracker.cleanup_old_history_at(now).await;
        assert_eq!(report, CleanupReport { scanned: 4, deleted: 3, failed: 0 });

        let keys: Vec<String> = store.snapshot().await.into_keys().collect();
        assert!(keys.contains(&history_key("fresh")));
        assert!(keys.contains(&"seen_listings".to_string()));
        assert!(!keys.contains(&history_key("stale")));
        assert!(!keys.contains(&history_key("empty")));
        assert!(!keys.contains(&history_key("corrupt")));
    }

    #[tokio::test]
    async fn corrupt_series_is_replaced_on_next_observation() {
        let store = Arc::new(MemoryStore::with_entries([(history_key(FP), json!({"bad": 1}))]));
        let tracker = tracker(store.clone(), 10);

        let mut item = Item::new("ebay", "1", 100.0);
        let outcome = tracker.track_price_change_at(&mut item, FP, at(1, 0)).await;
        assert!(matches!(outcome, PriceTrackOutcome::FirstObservation));
        assert_eq!(tracker.load_history(FP).await.expect("rewritten").len(), 1);

        let mut item = Item::new("ebay", "1", 80.0);
        let outcome = tracker.track_price_change_at(&mut item, FP, at(2, 0)).await;
        assert!(matches!(
            outcome,
            PriceTrackOutcome::Changed { drop_percent: Some(p), has_drop: true } if p == 20.0
        ));
        assert_eq!(item.price_change().and_then(|c| c.previous_price), Some(100.0));
    }
}
