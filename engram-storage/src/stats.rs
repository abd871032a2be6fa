//! Statistics and service attribution.
//!
//! Per-type counts live in fixed-width atomic arrays sized by the type
//! enums, so the write path pays one `fetch_add` per insert. Per-service
//! data sits behind a read-write lock; throttling telemetry is all
//! atomics. Nothing here ever fails the calling operation: persistence
//! happens out of band via [`StatisticsRegistry::snapshot`].

use engram_core::{now_ms, NounType, TimestampMs, VerbType};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Service lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceStatus {
    #[default]
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "inactive")]
    Inactive,
    #[serde(rename = "read-only")]
    ReadOnly,
}

/// Operation counters for one service.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationCounts {
    pub adds: u64,
    pub updates: u64,
    pub deletes: u64,
}

/// Attribution record for one upstream service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceStatistics {
    pub name: String,
    pub total_nouns: u64,
    pub total_verbs: u64,
    pub total_metadata: u64,
    pub first_activity: TimestampMs,
    pub last_activity: TimestampMs,
    pub error_count: u64,
    pub operations: OperationCounts,
    pub status: ServiceStatus,
}

impl ServiceStatistics {
    fn new(name: &str) -> Self {
        let now = now_ms();
        Self {
            name: name.to_string(),
            total_nouns: 0,
            total_verbs: 0,
            total_metadata: 0,
            first_activity: now,
            last_activity: now,
            error_count: 0,
            operations: OperationCounts::default(),
            status: ServiceStatus::Active,
        }
    }

    fn touch(&mut self) {
        self.last_activity = now_ms();
    }
}

/// Why the backend throttled us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleReason {
    /// HTTP 429 or equivalent.
    RateLimited,
    /// HTTP 503 or equivalent.
    ServiceUnavailable,
    /// Request timed out.
    Timeout,
}

#[derive(Debug)]
struct ThrottlingMetrics {
    currently_throttled: AtomicBool,
    consecutive_throttle_events: AtomicU32,
    current_backoff_ms: AtomicU64,
    total_throttle_events: AtomicU64,
    hourly: [AtomicU32; 24],
    rate_limited: AtomicU64,
    service_unavailable: AtomicU64,
    timeouts: AtomicU64,
    delayed_operations: AtomicU64,
    retried_operations: AtomicU64,
    failed_operations: AtomicU64,
    total_delay_ms: AtomicU64,
}

impl Default for ThrottlingMetrics {
    fn default() -> Self {
        Self {
            currently_throttled: AtomicBool::new(false),
            consecutive_throttle_events: AtomicU32::new(0),
            current_backoff_ms: AtomicU64::new(0),
            total_throttle_events: AtomicU64::new(0),
            hourly: std::array::from_fn(|_| AtomicU32::new(0)),
            rate_limited: AtomicU64::new(0),
            service_unavailable: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            delayed_operations: AtomicU64::new(0),
            retried_operations: AtomicU64::new(0),
            failed_operations: AtomicU64::new(0),
            total_delay_ms: AtomicU64::new(0),
        }
    }
}

/// Serializable view of the throttling counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ThrottlingSnapshot {
    pub currently_throttled: bool,
    pub consecutive_throttle_events: u32,
    pub current_backoff_ms: u64,
    pub total_throttle_events: u64,
    pub events_per_hour: Vec<u32>,
    pub rate_limited: u64,
    pub service_unavailable: u64,
    pub timeouts: u64,
    pub delayed_operations: u64,
    pub retried_operations: u64,
    pub failed_operations: u64,
    pub average_delay_ms: u64,
}

/// Point-in-time statistics snapshot, persisted as `statistics.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    /// Nonzero per-type noun counts, keyed by wire label.
    pub noun_counts: BTreeMap<String, u32>,
    /// Nonzero per-type verb counts, keyed by wire label.
    pub verb_counts: BTreeMap<String, u32>,
    pub total_nouns: u64,
    pub total_verbs: u64,
    pub total_metadata: u64,
    pub hnsw_index_size: u64,
    pub services: BTreeMap<String, ServiceStatistics>,
    pub field_names: BTreeMap<String, BTreeSet<String>>,
    pub throttling: ThrottlingSnapshot,
    pub updated_at: TimestampMs,
}

/// The live counter registry.
pub struct StatisticsRegistry {
    noun_counts: Vec<AtomicU32>,
    verb_counts: Vec<AtomicU32>,
    total_nouns: AtomicU64,
    total_verbs: AtomicU64,
    total_metadata: AtomicU64,
    hnsw_index_size: AtomicU64,
    services: RwLock<HashMap<String, ServiceStatistics>>,
    field_names: RwLock<HashMap<String, BTreeSet<String>>>,
    throttling: ThrottlingMetrics,
    dirty: AtomicBool,
}

impl Default for StatisticsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StatisticsRegistry {
    pub fn new() -> Self {
        Self {
            noun_counts: (0..NounType::COUNT).map(|_| AtomicU32::new(0)).collect(),
            verb_counts: (0..VerbType::COUNT).map(|_| AtomicU32::new(0)).collect(),
            total_nouns: AtomicU64::new(0),
            total_verbs: AtomicU64::new(0),
            total_metadata: AtomicU64::new(0),
            hnsw_index_size: AtomicU64::new(0),
            services: RwLock::new(HashMap::new()),
            field_names: RwLock::new(HashMap::new()),
            throttling: ThrottlingMetrics::default(),
            dirty: AtomicBool::new(false),
        }
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Clears and returns the dirty flag; the flusher skips clean cycles.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::Relaxed)
    }

    // ----- write-path hooks ------------------------------------------------

    pub fn record_noun_added(&self, noun_type: NounType, service: &str, is_update: bool) {
        if !is_update {
            self.noun_counts[noun_type.index()].fetch_add(1, Ordering::Relaxed);
            self.total_nouns.fetch_add(1, Ordering::Relaxed);
        }
        self.with_service(service, |s| {
            if is_update {
                s.operations.updates += 1;
            } else {
                s.total_nouns += 1;
                s.operations.adds += 1;
            }
        });
        self.mark_dirty();
    }

    pub fn record_noun_removed(&self, noun_type: NounType, service: &str) {
        decrement(&self.noun_counts[noun_type.index()]);
        decrement_u64(&self.total_nouns);
        self.with_service(service, |s| {
            s.total_nouns = s.total_nouns.saturating_sub(1);
            s.operations.deletes += 1;
        });
        self.mark_dirty();
    }

    pub fn record_verb_added(&self, verb_type: VerbType, service: &str, is_update: bool) {
        if !is_update {
            self.verb_counts[verb_type.index()].fetch_add(1, Ordering::Relaxed);
            self.total_verbs.fetch_add(1, Ordering::Relaxed);
        }
        self.with_service(service, |s| {
            if is_update {
                s.operations.updates += 1;
            } else {
                s.total_verbs += 1;
                s.operations.adds += 1;
            }
        });
        self.mark_dirty();
    }

    pub fn record_verb_removed(&self, verb_type: VerbType, service: &str) {
        decrement(&self.verb_counts[verb_type.index()]);
        decrement_u64(&self.total_verbs);
        self.with_service(service, |s| {
            s.total_verbs = s.total_verbs.saturating_sub(1);
            s.operations.deletes += 1;
        });
        self.mark_dirty();
    }

    pub fn record_metadata_written(&self, service: &str) {
        self.total_metadata.fetch_add(1, Ordering::Relaxed);
        self.with_service(service, |s| s.total_metadata += 1);
        self.mark_dirty();
    }

    pub fn record_service_error(&self, service: &str) {
        self.with_service(service, |s| s.error_count += 1);
        self.mark_dirty();
    }

    pub fn update_hnsw_index_size(&self, size: u64) {
        self.hnsw_index_size.store(size, Ordering::Relaxed);
        self.mark_dirty();
    }

    fn with_service(&self, service: &str, apply: impl FnOnce(&mut ServiceStatistics)) {
        let mut services = self.services.write();
        let entry = services
            .entry(service.to_string())
            .or_insert_with(|| ServiceStatistics::new(service));
        apply(entry);
        entry.touch();
    }

    // ----- reads -----------------------------------------------------------

    /// O(1) live noun count.
    pub fn noun_count(&self) -> u64 {
        self.total_nouns.load(Ordering::Relaxed)
    }

    /// O(1) live verb count.
    pub fn verb_count(&self) -> u64 {
        self.total_verbs.load(Ordering::Relaxed)
    }

    pub fn noun_count_for(&self, noun_type: NounType) -> u32 {
        self.noun_counts[noun_type.index()].load(Ordering::Relaxed)
    }

    pub fn verb_count_for(&self, verb_type: VerbType) -> u32 {
        self.verb_counts[verb_type.index()].load(Ordering::Relaxed)
    }

    pub fn list_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn service_statistics(&self, name: &str) -> Option<ServiceStatistics> {
        self.services.read().get(name).cloned()
    }

    pub fn set_service_status(&self, name: &str, status: ServiceStatus) {
        self.with_service(name, |s| s.status = status);
    }

    // ----- field-name discovery -------------------------------------------

    /// Record every dotted field path in `value` under the service schema.
    pub fn track_field_names(&self, service: &str, value: &serde_json::Value) {
        let mut paths = BTreeSet::new();
        collect_field_paths(value, "", &mut paths);
        if paths.is_empty() {
            return;
        }
        let mut field_names = self.field_names.write();
        field_names
            .entry(service.to_string())
            .or_default()
            .extend(paths);
        self.mark_dirty();
    }

    /// Observed field names for one service, or across all services.
    pub fn available_field_names(&self, service: Option<&str>) -> BTreeSet<String> {
        let field_names = self.field_names.read();
        match service {
            Some(service) => field_names.get(service).cloned().unwrap_or_default(),
            None => field_names.values().flatten().cloned().collect(),
        }
    }

    /// Canonical locations of the standard fields inside combined reads.
    pub fn standard_field_mappings() -> BTreeMap<&'static str, &'static str> {
        BTreeMap::from([
            ("type", "noun"),
            ("service", "service"),
            ("createdAt", "created_at"),
            ("updatedAt", "updated_at"),
            ("confidence", "confidence"),
            ("weight", "weight"),
        ])
    }

    // ----- throttling telemetry -------------------------------------------

    pub fn record_throttle(&self, reason: ThrottleReason, backoff_ms: u64) {
        let t = &self.throttling;
        t.currently_throttled.store(true, Ordering::Relaxed);
        t.consecutive_throttle_events.fetch_add(1, Ordering::Relaxed);
        t.current_backoff_ms.store(backoff_ms, Ordering::Relaxed);
        t.total_throttle_events.fetch_add(1, Ordering::Relaxed);
        let hour = ((now_ms() / 3_600_000) % 24) as usize;
        t.hourly[hour].fetch_add(1, Ordering::Relaxed);
        match reason {
            ThrottleReason::RateLimited => t.rate_limited.fetch_add(1, Ordering::Relaxed),
            ThrottleReason::ServiceUnavailable => {
                t.service_unavailable.fetch_add(1, Ordering::Relaxed)
            }
            ThrottleReason::Timeout => t.timeouts.fetch_add(1, Ordering::Relaxed),
        };
        self.mark_dirty();
    }

    /// A previously throttled call went through.
    pub fn record_throttle_recovered(&self) {
        let t = &self.throttling;
        t.currently_throttled.store(false, Ordering::Relaxed);
        t.consecutive_throttle_events.store(0, Ordering::Relaxed);
        t.current_backoff_ms.store(0, Ordering::Relaxed);
    }

    pub fn record_operation_delayed(&self, delay_ms: u64) {
        self.throttling.delayed_operations.fetch_add(1, Ordering::Relaxed);
        self.throttling.total_delay_ms.fetch_add(delay_ms, Ordering::Relaxed);
    }

    pub fn record_operation_retried(&self) {
        self.throttling.retried_operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_operation_failed(&self) {
        self.throttling.failed_operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn throttling_snapshot(&self) -> ThrottlingSnapshot {
        let t = &self.throttling;
        let delayed = t.delayed_operations.load(Ordering::Relaxed);
        let total_delay = t.total_delay_ms.load(Ordering::Relaxed);
        ThrottlingSnapshot {
            currently_throttled: t.currently_throttled.load(Ordering::Relaxed),
            consecutive_throttle_events: t.consecutive_throttle_events.load(Ordering::Relaxed),
            current_backoff_ms: t.current_backoff_ms.load(Ordering::Relaxed),
            total_throttle_events: t.total_throttle_events.load(Ordering::Relaxed),
            events_per_hour: t.hourly.iter().map(|h| h.load(Ordering::Relaxed)).collect(),
            rate_limited: t.rate_limited.load(Ordering::Relaxed),
            service_unavailable: t.service_unavailable.load(Ordering::Relaxed),
            timeouts: t.timeouts.load(Ordering::Relaxed),
            delayed_operations: delayed,
            retried_operations: t.retried_operations.load(Ordering::Relaxed),
            failed_operations: t.failed_operations.load(Ordering::Relaxed),
            average_delay_ms: if delayed == 0 { 0 } else { total_delay / delayed },
        }
    }

    // ----- persistence -----------------------------------------------------

    pub fn snapshot(&self) -> StatisticsSnapshot {
        let noun_counts = NounType::ALL
            .iter()
            .filter_map(|t| {
                let count = self.noun_counts[t.index()].load(Ordering::Relaxed);
                (count > 0).then(|| (t.as_str().to_string(), count))
            })
            .collect();
        let verb_counts = VerbType::ALL
            .iter()
            .filter_map(|t| {
                let count = self.verb_counts[t.index()].load(Ordering::Relaxed);
                (count > 0).then(|| (t.as_str().to_string(), count))
            })
            .collect();
        StatisticsSnapshot {
            noun_counts,
            verb_counts,
            total_nouns: self.total_nouns.load(Ordering::Relaxed),
            total_verbs: self.total_verbs.load(Ordering::Relaxed),
            total_metadata: self.total_metadata.load(Ordering::Relaxed),
            hnsw_index_size: self.hnsw_index_size.load(Ordering::Relaxed),
            services: self
                .services
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            field_names: self
                .field_names
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            throttling: self.throttling_snapshot(),
            updated_at: now_ms(),
        }
    }

    /// Restore counters from a persisted snapshot (adapter reopen).
    pub fn load_snapshot(&self, snapshot: &StatisticsSnapshot) {
        for (label, count) in &snapshot.noun_counts {
            if let Some(t) = NounType::parse(label) {
                self.noun_counts[t.index()].store(*count, Ordering::Relaxed);
            }
        }
        for (label, count) in &snapshot.verb_counts {
            if let Some(t) = VerbType::parse(label) {
                self.verb_counts[t.index()].store(*count, Ordering::Relaxed);
            }
        }
        self.total_nouns.store(snapshot.total_nouns, Ordering::Relaxed);
        self.total_verbs.store(snapshot.total_verbs, Ordering::Relaxed);
        self.total_metadata.store(snapshot.total_metadata, Ordering::Relaxed);
        self.hnsw_index_size.store(snapshot.hnsw_index_size, Ordering::Relaxed);
        *self.services.write() = snapshot
            .services
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        *self.field_names.write() = snapshot
            .field_names
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
    }
}

fn decrement(counter: &AtomicU32) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
}

fn decrement_u64(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
}

fn collect_field_paths(value: &serde_json::Value, prefix: &str, paths: &mut BTreeSet<String>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                paths.insert(path.clone());
                collect_field_paths(child, &path, paths);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_field_paths(item, prefix, paths);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_counts_follow_adds_and_deletes() {
        let stats = StatisticsRegistry::new();
        stats.record_noun_added(NounType::Document, "svc", false);
        stats.record_noun_added(NounType::Document, "svc", false);
        stats.record_noun_added(NounType::Person, "svc", false);
        assert_eq!(stats.noun_count(), 3);
        assert_eq!(stats.noun_count_for(NounType::Document), 2);

        stats.record_noun_removed(NounType::Document, "svc");
        assert_eq!(stats.noun_count(), 2);
        assert_eq!(stats.noun_count_for(NounType::Document), 1);

        // Decrements never wrap below zero.
        stats.record_noun_removed(NounType::Location, "svc");
        assert_eq!(stats.noun_count_for(NounType::Location), 0);
    }

    #[test]
    fn test_updates_do_not_inflate_counts() {
        let stats = StatisticsRegistry::new();
        stats.record_noun_added(NounType::Note, "svc", false);
        stats.record_noun_added(NounType::Note, "svc", true);
        assert_eq!(stats.noun_count(), 1);

        let service = stats.service_statistics("svc").unwrap();
        assert_eq!(service.operations.adds, 1);
        assert_eq!(service.operations.updates, 1);
    }

    #[test]
    fn test_service_attribution() {
        let stats = StatisticsRegistry::new();
        stats.record_noun_added(NounType::Document, "alpha", false);
        stats.record_verb_added(VerbType::RelatedTo, "beta", false);
        stats.record_metadata_written("alpha");
        stats.record_service_error("beta");

        assert_eq!(stats.list_services(), vec!["alpha".to_string(), "beta".to_string()]);
        let alpha = stats.service_statistics("alpha").unwrap();
        assert_eq!(alpha.total_nouns, 1);
        assert_eq!(alpha.total_metadata, 1);
        assert!(alpha.first_activity <= alpha.last_activity);

        let beta = stats.service_statistics("beta").unwrap();
        assert_eq!(beta.total_verbs, 1);
        assert_eq!(beta.error_count, 1);
    }

    #[test]
    fn test_field_name_discovery() {
        let stats = StatisticsRegistry::new();
        stats.track_field_names(
            "svc",
            &json!({
                "title": "x",
                "author": {"name": "y", "emails": [{"addr": "z"}]},
                "tags": ["a", "b"]
            }),
        );
        let names = stats.available_field_names(Some("svc"));
        for expected in [
            "title",
            "author",
            "author.name",
            "author.emails",
            "author.emails.addr",
            "tags",
        ] {
            assert!(names.contains(expected), "missing path {expected}");
        }
        assert!(stats.available_field_names(Some("other")).is_empty());
        assert!(!stats.available_field_names(None).is_empty());
    }

    #[test]
    fn test_throttling_counters() {
        let stats = StatisticsRegistry::new();
        stats.record_throttle(ThrottleReason::RateLimited, 200);
        stats.record_throttle(ThrottleReason::Timeout, 400);
        stats.record_operation_delayed(100);
        stats.record_operation_delayed(300);
        stats.record_operation_retried();

        let snap = stats.throttling_snapshot();
        assert!(snap.currently_throttled);
        assert_eq!(snap.consecutive_throttle_events, 2);
        assert_eq!(snap.current_backoff_ms, 400);
        assert_eq!(snap.total_throttle_events, 2);
        assert_eq!(snap.rate_limited, 1);
        assert_eq!(snap.timeouts, 1);
        assert_eq!(snap.average_delay_ms, 200);
        assert_eq!(snap.events_per_hour.iter().sum::<u32>(), 2);

        stats.record_throttle_recovered();
        let snap = stats.throttling_snapshot();
        assert!(!snap.currently_throttled);
        assert_eq!(snap.consecutive_throttle_events, 0);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let stats = StatisticsRegistry::new();
        stats.record_noun_added(NounType::Document, "svc", false);
        stats.record_verb_added(VerbType::Mentions, "svc", false);
        stats.update_hnsw_index_size(17);
        stats.track_field_names("svc", &json!({"a": {"b": 1}}));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.noun_counts.get("document"), Some(&1));
        assert_eq!(snapshot.verb_counts.get("mentions"), Some(&1));

        let restored = StatisticsRegistry::new();
        restored.load_snapshot(&snapshot);
        assert_eq!(restored.noun_count(), 1);
        assert_eq!(restored.verb_count(), 1);
        assert_eq!(restored.noun_count_for(NounType::Document), 1);
        assert_eq!(restored.service_statistics("svc"), stats.service_statistics("svc"));
        assert!(restored.available_field_names(Some("svc")).contains("a.b"));
    }

    #[test]
    fn test_dirty_flag() {
        let stats = StatisticsRegistry::new();
        assert!(!stats.take_dirty());
        stats.record_noun_added(NounType::Document, "svc", false);
        assert!(stats.take_dirty());
        assert!(!stats.take_dirty());
    }

    #[test]
    fn test_standard_field_mappings() {
        let mappings = StatisticsRegistry::standard_field_mappings();
        assert_eq!(mappings.get("type"), Some(&"noun"));
        assert_eq!(mappings.get("createdAt"), Some(&"created_at"));
    }
}
