//! Account-wide usage guardrails.
//!
//! Unique responsibility: aggregate current `RunPod` usage (pods, serverless
//! endpoints, network volumes), cache it behind a TTL so scheduled checks do
//! not hammer the API, and validate it against configured ceilings before
//! resources are created.
//!
//! The cache is a small file shared across short-lived CLI invocations: any
//! process can reuse a fresh-enough snapshot written by another, and any
//! process can force-evict it. There is no locking around refresh; a
//! concurrent miss may fetch twice and the last write wins. That costs a
//! redundant upstream call, not correctness.
//!
//! Violations are the one failure mode here that is never swallowed: they
//! raise [`GuardrailsError::Exceeded`] and notify a [`GuardrailSink`].

use std::{fs, io::Write, path::PathBuf, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::runpod_client::{
    ComputeProvider, EndpointDescriptor, NetworkVolumeDescriptor, PodDescriptor,
};
use crate::runpod_config::{GuardrailsConfig, cache_ttl_seconds};

/// Error type for guardrail checks.
#[derive(Debug, Error)]
pub enum GuardrailsError {
    /// A configured ceiling was met or exceeded.
    #[error(
        "RunPod API guardrail exceeded: {service} limit \"{limit}\" is {limit_value} \
         (current usage: {current}). Reduce usage or increase the limit under \
         [guardrails.limits] in the config file"
    )]
    Exceeded {
        /// Service category ("pods", "serverless", "storage").
        service: &'static str,
        /// Limit name (e.g. "pods_max").
        limit: &'static str,
        /// Current usage value.
        current: u64,
        /// Configured ceiling.
        limit_value: u64,
    },
}

/// Aggregated account usage. All aggregates come from one fetch; a snapshot
/// never mixes pods observed now with volumes observed earlier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSnapshot {
    /// Raw pod listing at fetch time.
    pub pods: Vec<PodDescriptor>,
    /// Total pod count.
    pub pods_count: u64,
    /// Pods whose status is exactly "RUNNING".
    pub pods_running_count: u64,
    /// Raw endpoint listing at fetch time.
    pub endpoints: Vec<EndpointDescriptor>,
    /// Total endpoint count.
    pub endpoints_count: u64,
    /// Summed `workersMax` across endpoints.
    pub workers_total: u64,
    /// Raw network volume listing at fetch time.
    pub network_volumes: Vec<NetworkVolumeDescriptor>,
    /// Total network volume count.
    pub network_volumes_count: u64,
    /// Summed volume size in GB.
    pub storage_total_gb: f64,
}

impl UsageSnapshot {
    /// Compute every aggregate from a single set of listings.
    #[must_use]
    pub fn aggregate(
        pods: Vec<PodDescriptor>,
        endpoints: Vec<EndpointDescriptor>,
        network_volumes: Vec<NetworkVolumeDescriptor>,
    ) -> Self {
        let pods_running_count = pods.iter().filter(|p| p.is_running()).count() as u64;
        let workers_total = endpoints
            .iter()
            .map(|e| e.workersMax.unwrap_or(0))
            .sum::<u64>();
        let storage_total_gb = network_volumes
            .iter()
            .map(|v| v.size.unwrap_or(0.0))
            .sum::<f64>();

        Self {
            pods_count: pods.len() as u64,
            pods_running_count,
            endpoints_count: endpoints.len() as u64,
            workers_total,
            network_volumes_count: network_volumes.len() as u64,
            storage_total_gb,
            pods,
            endpoints,
            network_volumes,
        }
    }
}

/// A cached snapshot with its fetch time, as stored in the cache backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedUsage {
    /// When the snapshot was fetched.
    pub fetched_at: DateTime<Utc>,
    /// The snapshot itself.
    pub usage: UsageSnapshot,
}

/// TTL cache backend for usage snapshots. Best-effort: backends swallow
/// their own failures (a broken cache degrades to refetching).
pub trait UsageCache: Send + Sync {
    /// Load the cached entry, if any. Freshness is judged by the caller.
    fn load(&self) -> Option<CachedUsage>;
    /// Store an entry, replacing any previous one.
    fn store(&self, entry: &CachedUsage);
    /// Evict the cached entry immediately.
    fn clear(&self);
}

/// File-backed usage cache shared across processes.
#[derive(Debug, Clone)]
pub struct JsonFileUsageCache {
    path: PathBuf,
}

impl JsonFileUsageCache {
    /// Create a cache at the given path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl UsageCache for JsonFileUsageCache {
    fn load(&self) -> Option<CachedUsage> {
        let bytes = fs::read(&self.path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn store(&self, entry: &CachedUsage) {
        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = self.path.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent)?;
            }
            let mut tmp = self.path.clone();
            let tmp_name = format!(
                ".{}.tmp",
                self.path
                    .file_name()
                    .and_then(|s| s.to_str())
                    .unwrap_or("runpod_usage")
            );
            tmp.set_file_name(tmp_name);

            let json = serde_json::to_vec_pretty(entry)?;
            {
                let mut f = fs::File::create(&tmp)?;
                f.write_all(&json)?;
                f.sync_all()?;
            }
            if self.path.exists() {
                let _ = fs::remove_file(&self.path);
            }
            fs::rename(&tmp, &self.path)
        })();

        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "failed to write usage cache");
        }
    }

    fn clear(&self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Observer notified when a guardrail trips, alongside the raised error.
pub trait GuardrailSink: Send + Sync {
    /// A ceiling was met or exceeded.
    fn tripped(&self, service: &str, limit: &str, current: u64, limit_value: u64);
}

/// Default sink: logs tripped guardrails via `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingGuardrailSink;

impl GuardrailSink for TracingGuardrailSink {
    fn tripped(&self, service: &str, limit: &str, current: u64, limit_value: u64) {
        tracing::error!(service, limit, current, limit_value, "guardrail tripped");
    }
}

/// Usage guardrails: TTL-cached account usage validated against ceilings.
pub struct Guardrails {
    provider: Arc<dyn ComputeProvider>,
    cache: Arc<dyn UsageCache>,
    config: GuardrailsConfig,
    sink: Arc<dyn GuardrailSink>,
}

impl Guardrails {
    /// Create guardrails over a provider and a cache backend.
    pub fn new(
        provider: Arc<dyn ComputeProvider>,
        cache: Arc<dyn UsageCache>,
        config: GuardrailsConfig,
    ) -> Self {
        Self {
            provider,
            cache,
            config,
            sink: Arc::new(TracingGuardrailSink),
        }
    }

    /// Replace the tripped-event sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn GuardrailSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Whether guardrails are enabled at all.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn ttl(&self) -> Duration {
        Duration::seconds(cache_ttl_seconds(&self.config.cache_schedule) as i64)
    }

    /// Current usage: the cached snapshot when fresh, otherwise a fresh
    /// fetch-and-aggregate that replaces the cache.
    pub async fn get_usage(&self) -> UsageSnapshot {
        if let Some(entry) = self.cache.load()
            && Utc::now() - entry.fetched_at < self.ttl()
        {
            debug!("using cached usage snapshot");
            return entry.usage;
        }

        let pods = self.provider.list_pods().await;
        let endpoints = self.provider.list_endpoints().await;
        let network_volumes = self.provider.list_network_volumes().await;
        let usage = UsageSnapshot::aggregate(pods, endpoints, network_volumes);

        self.cache.store(&CachedUsage {
            fetched_at: Utc::now(),
            usage: usage.clone(),
        });

        usage
    }

    /// Evict the cached snapshot immediately.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Validate current usage against every configured ceiling, in fixed
    /// order. The first category meeting or exceeding its ceiling trips the
    /// sink and raises; the rest are not evaluated.
    ///
    /// # Errors
    ///
    /// Returns [`GuardrailsError::Exceeded`] for the first violated limit.
    pub async fn check(&self) -> Result<(), GuardrailsError> {
        if !self.config.enabled {
            return Ok(());
        }

        let usage = self.get_usage().await;
        let limits = &self.config.limits;

        self.gate("pods", "pods_max", usage.pods_count, limits.pods.pods_max)?;
        self.gate(
            "pods",
            "pods_running_max",
            usage.pods_running_count,
            limits.pods.pods_running_max,
        )?;
        self.gate(
            "serverless",
            "endpoints_max",
            usage.endpoints_count,
            limits.serverless.endpoints_max,
        )?;
        self.gate(
            "serverless",
            "workers_total_max",
            usage.workers_total,
            limits.serverless.workers_total_max,
        )?;
        self.gate(
            "storage",
            "network_volumes_max",
            usage.network_volumes_count,
            limits.storage.network_volumes_max,
        )?;
        self.gate(
            "storage",
            "volume_size_gb_max",
            usage.storage_total_gb as u64,
            limits.storage.volume_size_gb_max,
        )?;

        Ok(())
    }

    /// Gate pod creation: run [`Guardrails::check`], then re-validate the pod
    /// ceilings against a fresh usage view. Creating one more pod must not
    /// reach the ceiling.
    ///
    /// # Errors
    ///
    /// Returns [`GuardrailsError::Exceeded`] for the first violated limit.
    pub async fn check_before_create_pod(&self) -> Result<(), GuardrailsError> {
        if !self.config.enabled {
            return Ok(());
        }

        self.check().await?;

        // check() just refreshed the cache, so this reuses the same window.
        let usage = self.get_usage().await;
        let limits = &self.config.limits;
        self.gate(
            "pods",
            "pods_max",
            usage.pods.len() as u64,
            limits.pods.pods_max,
        )?;
        self.gate(
            "pods",
            "pods_running_max",
            usage.pods_running_count,
            limits.pods.pods_running_max,
        )?;

        Ok(())
    }

    /// A limit of `None` or `0` is unconstrained; otherwise `current >=
    /// limit` trips.
    fn gate(
        &self,
        service: &'static str,
        limit: &'static str,
        current: u64,
        configured: Option<u64>,
    ) -> Result<(), GuardrailsError> {
        let Some(limit_value) = configured else {
            return Ok(());
        };
        if limit_value == 0 || current < limit_value {
            return Ok(());
        }

        self.sink.tripped(service, limit, current, limit_value);
        Err(GuardrailsError::Exceeded {
            service,
            limit,
            current,
            limit_value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runpod_config::{GuardrailLimits, PodLimits, ServerlessLimits, StorageLimits};
    use async_trait::async_trait;
    use std::sync::{
        Mutex,
        atomic::{AtomicU32, Ordering},
    };

    fn pod(id: &str, status: &str) -> PodDescriptor {
        PodDescriptor {
            id: id.to_string(),
            name: None,
            desiredStatus: Some(status.to_string()),
            imageName: None,
            ports: None,
            runtime: None,
            machineId: None,
            networkVolumeId: None,
            costPerHr: None,
        }
    }

    fn endpoint(id: &str, workers_max: u64) -> EndpointDescriptor {
        EndpointDescriptor {
            id: id.to_string(),
            name: None,
            workersMax: Some(workers_max),
        }
    }

    fn volume(id: &str, size: f64) -> NetworkVolumeDescriptor {
        NetworkVolumeDescriptor {
            id: id.to_string(),
            name: None,
            size: Some(size),
            dataCenterId: None,
        }
    }

    #[derive(Default)]
    struct ListingProvider {
        pods: Vec<PodDescriptor>,
        endpoints: Vec<EndpointDescriptor>,
        volumes: Vec<NetworkVolumeDescriptor>,
        fetches: AtomicU32,
    }

    #[async_trait]
    impl ComputeProvider for ListingProvider {
        async fn create_pod(&self, _input: &crate::runpod_client::CreatePodInput) -> Option<PodDescriptor> {
            None
        }
        async fn get_pod(&self, _pod_id: &str) -> Option<PodDescriptor> {
            None
        }
        async fn stop_pod(&self, _pod_id: &str) -> bool {
            false
        }
        async fn terminate_pod(&self, _pod_id: &str) -> bool {
            false
        }
        async fn list_pods(&self) -> Vec<PodDescriptor> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.pods.clone()
        }
        async fn list_endpoints(&self) -> Vec<EndpointDescriptor> {
            self.endpoints.clone()
        }
        async fn list_network_volumes(&self) -> Vec<NetworkVolumeDescriptor> {
            self.volumes.clone()
        }
        async fn pod_telemetry(&self, _pod_id: &str) -> Option<crate::runpod_client::TelemetryDescriptor> {
            None
        }
    }

    #[derive(Default)]
    struct MemoryCache(Mutex<Option<CachedUsage>>);

    impl UsageCache for MemoryCache {
        fn load(&self) -> Option<CachedUsage> {
            self.0.lock().ok()?.clone()
        }
        fn store(&self, entry: &CachedUsage) {
            if let Ok(mut slot) = self.0.lock() {
                *slot = Some(entry.clone());
            }
        }
        fn clear(&self) {
            if let Ok(mut slot) = self.0.lock() {
                *slot = None;
            }
        }
    }

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<(String, String, u64, u64)>>);

    impl GuardrailSink for RecordingSink {
        fn tripped(&self, service: &str, limit: &str, current: u64, limit_value: u64) {
            if let Ok(mut events) = self.0.lock() {
                events.push((service.to_string(), limit.to_string(), current, limit_value));
            }
        }
    }

    fn config_with_limits(limits: GuardrailLimits) -> GuardrailsConfig {
        GuardrailsConfig {
            enabled: true,
            cache_schedule: "everyFifteenMinutes".to_string(),
            limits,
        }
    }

    fn guardrails(provider: ListingProvider, limits: GuardrailLimits) -> Guardrails {
        Guardrails::new(
            Arc::new(provider),
            Arc::new(MemoryCache::default()),
            config_with_limits(limits),
        )
    }

    #[tokio::test]
    async fn aggregates_are_computed_from_one_fetch() {
        let provider = ListingProvider {
            pods: vec![pod("a", "RUNNING"), pod("b", "EXITED"), pod("c", "RUNNING")],
            endpoints: vec![endpoint("e1", 3), endpoint("e2", 7)],
            volumes: vec![volume("v1", 40.0), volume("v2", 60.0)],
            ..ListingProvider::default()
        };
        let rails = guardrails(provider, GuardrailLimits::default());

        let usage = rails.get_usage().await;
        assert_eq!(usage.pods_count, 3);
        assert_eq!(usage.pods_running_count, 2);
        assert_eq!(usage.endpoints_count, 2);
        assert_eq!(usage.workers_total, 10);
        assert_eq!(usage.network_volumes_count, 2);
        assert!((usage.storage_total_gb - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn repeated_calls_within_ttl_issue_no_extra_provider_calls() {
        let provider = Arc::new(ListingProvider {
            pods: vec![pod("a", "RUNNING")],
            ..ListingProvider::default()
        });
        let rails = Guardrails::new(
            provider.clone(),
            Arc::new(MemoryCache::default()),
            config_with_limits(GuardrailLimits::default()),
        );

        let _ = rails.get_usage().await;
        let _ = rails.get_usage().await;
        let _ = rails.get_usage().await;
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);

        rails.clear_cache();
        let _ = rails.get_usage().await;
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn expired_cache_entry_triggers_a_fresh_fetch() {
        let provider = Arc::new(ListingProvider::default());
        let cache = Arc::new(MemoryCache::default());
        cache.store(&CachedUsage {
            fetched_at: Utc::now() - Duration::seconds(901),
            usage: UsageSnapshot::aggregate(vec![pod("stale", "RUNNING")], vec![], vec![]),
        });

        let rails = Guardrails::new(
            provider.clone(),
            cache,
            config_with_limits(GuardrailLimits::default()),
        );

        let usage = rails.get_usage().await;
        assert_eq!(usage.pods_count, 0);
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn first_violation_in_fixed_order_wins() {
        let provider = ListingProvider {
            pods: vec![pod("a", "RUNNING"), pod("b", "RUNNING")],
            endpoints: vec![endpoint("e1", 50)],
            ..ListingProvider::default()
        };
        // Both pods_max and workers_total_max are violated; pods_max is
        // earlier in the fixed order.
        let rails = guardrails(
            provider,
            GuardrailLimits {
                pods: PodLimits {
                    pods_max: Some(2),
                    pods_running_max: None,
                },
                serverless: ServerlessLimits {
                    endpoints_max: None,
                    workers_total_max: Some(10),
                },
                storage: StorageLimits::default(),
            },
        );

        match rails.check().await {
            Err(GuardrailsError::Exceeded {
                service,
                limit,
                current,
                limit_value,
            }) => {
                assert_eq!(service, "pods");
                assert_eq!(limit, "pods_max");
                assert_eq!(current, 2);
                assert_eq!(limit_value, 2);
            }
            Ok(()) => panic!("expected a violation"),
        }
    }

    #[tokio::test]
    async fn tripped_sink_receives_the_violation_values() {
        let provider = ListingProvider {
            pods: vec![pod("a", "RUNNING"), pod("b", "EXITED"), pod("c", "RUNNING")],
            ..ListingProvider::default()
        };
        let sink = Arc::new(RecordingSink::default());
        let rails = guardrails(
            provider,
            GuardrailLimits {
                pods: PodLimits {
                    pods_max: Some(2),
                    pods_running_max: None,
                },
                ..GuardrailLimits::default()
            },
        )
        .with_sink(sink.clone());

        assert!(rails.check().await.is_err());
        let events = sink.0.lock().unwrap();
        assert_eq!(
            events.as_slice(),
            &[("pods".to_string(), "pods_max".to_string(), 3, 2)]
        );
    }

    #[tokio::test]
    async fn zero_or_absent_limits_are_unconstrained() {
        let provider = ListingProvider {
            pods: vec![pod("a", "RUNNING"); 100],
            endpoints: vec![endpoint("e", 999)],
            volumes: vec![volume("v", 10_000.0)],
            ..ListingProvider::default()
        };
        let rails = guardrails(
            provider,
            GuardrailLimits {
                pods: PodLimits {
                    pods_max: Some(0),
                    pods_running_max: None,
                },
                ..GuardrailLimits::default()
            },
        );

        assert!(rails.check().await.is_ok());
    }

    #[tokio::test]
    async fn disabled_guardrails_never_raise() {
        let provider = ListingProvider {
            pods: vec![pod("a", "RUNNING"); 10],
            ..ListingProvider::default()
        };
        let mut config = config_with_limits(GuardrailLimits {
            pods: PodLimits {
                pods_max: Some(1),
                pods_running_max: Some(1),
            },
            ..GuardrailLimits::default()
        });
        config.enabled = false;

        let rails = Guardrails::new(
            Arc::new(provider),
            Arc::new(MemoryCache::default()),
            config,
        );
        assert!(rails.check().await.is_ok());
        assert!(rails.check_before_create_pod().await.is_ok());
    }

    #[tokio::test]
    async fn creating_one_more_pod_may_not_reach_the_ceiling() {
        // Two pods exist; pods_max = 3 passes check() but creating a third
        // would reach the ceiling.
        let provider = ListingProvider {
            pods: vec![pod("a", "RUNNING"), pod("b", "EXITED"), pod("c", "EXITED")],
            ..ListingProvider::default()
        };
        let rails = guardrails(
            provider,
            GuardrailLimits {
                pods: PodLimits {
                    pods_max: Some(3),
                    pods_running_max: None,
                },
                ..GuardrailLimits::default()
            },
        );

        match rails.check_before_create_pod().await {
            Err(GuardrailsError::Exceeded { limit, current, limit_value, .. }) => {
                assert_eq!(limit, "pods_max");
                assert_eq!(current, 3);
                assert_eq!(limit_value, 3);
            }
            Ok(()) => panic!("expected creation to be gated"),
        }
    }

    #[test]
    fn file_cache_survives_a_round_trip_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let cache = JsonFileUsageCache::new(dir.path().join("usage.json"));

        assert!(cache.load().is_none());

        let entry = CachedUsage {
            fetched_at: Utc::now(),
            usage: UsageSnapshot::aggregate(vec![pod("a", "RUNNING")], vec![], vec![]),
        };
        cache.store(&entry);

        let loaded = cache.load().unwrap();
        assert_eq!(loaded.usage.pods_count, 1);

        cache.clear();
        assert!(cache.load().is_none());
    }
}
