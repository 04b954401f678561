//! Entry-point facade.
//!
//! Unique responsibility: wire configuration, the API gateway, guardrails,
//! state and stats into per-request [`PodManager`]s, behind a small surface
//! the CLI and embedding code call.
//!
//! Requests are explicit values ([`StartRequest`]) rather than a stateful
//! builder: nothing here mutates hidden selection state between calls, so
//! two concurrent starts for different instances cannot contaminate each
//! other.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::runpod_client::ComputeProvider;
use crate::runpod_config::{ConfigError, RunpodConfig};
use crate::runpod_guardrails::{Guardrails, GuardrailsError, JsonFileUsageCache, UsageSnapshot};
use crate::runpod_manager::{EnsuredPod, ManagerError, PodManager, PruneOutcome};
use crate::runpod_state::JsonFileStateStore;
use crate::runpod_stats::{StatsSnapshot, StatsWriter};

/// Error type for facade operations.
#[derive(Debug, Error)]
pub enum RunPodError {
    /// Configuration problem.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Lifecycle operation failure.
    #[error(transparent)]
    Manager(#[from] ManagerError),
    /// Guardrail violation outside a lifecycle operation.
    #[error(transparent)]
    Guardrails(#[from] GuardrailsError),
}

/// An explicit start request: which instance, and optionally which caller
/// (nickname) is asking, for state-file scoping.
#[derive(Debug, Clone)]
pub struct StartRequest {
    /// Configured instance name.
    pub instance: String,
    /// Caller identity; scopes the state file when set.
    pub nickname: Option<String>,
}

impl StartRequest {
    /// Request a start of the named instance.
    #[must_use]
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            nickname: None,
        }
    }

    /// Attach a caller nickname.
    #[must_use]
    pub fn nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = Some(nickname.into());
        self
    }
}

/// Facade over the whole control plane.
pub struct RunPod {
    config: RunpodConfig,
    provider: Arc<dyn ComputeProvider>,
    last_ensured: Mutex<Option<(String, EnsuredPod)>>,
}

impl RunPod {
    /// Create a facade over a loaded config and a provider.
    #[must_use]
    pub fn new(config: RunpodConfig, provider: Arc<dyn ComputeProvider>) -> Self {
        Self {
            config,
            provider,
            last_ensured: Mutex::new(None),
        }
    }

    /// The loaded configuration.
    #[must_use]
    pub const fn config(&self) -> &RunpodConfig {
        &self.config
    }

    /// Ensure the instance's pod is up. Usage is marked before and after the
    /// ensure so the pruner's idle clock restarts around the whole call.
    ///
    /// Returns `None` when no pod could be ensured.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown instance, a guardrail violation, or a
    /// state persistence failure.
    pub async fn start(&self, request: &StartRequest) -> Result<Option<EnsuredPod>, RunPodError> {
        let manager = self.manager_for(Some(&request.instance), request.nickname.as_deref())?;

        manager.update_last_run_at()?;
        let ensured = manager.ensure_pod().await?;
        let Some(ensured) = ensured else {
            return Ok(None);
        };
        manager.update_last_run_at()?;

        if let Ok(mut slot) = self.last_ensured.lock() {
            *slot = Some((request.instance.clone(), ensured.clone()));
        }
        Ok(Some(ensured))
    }

    /// Public URL for the instance's pod: the last ensured URL when one
    /// exists, otherwise a fresh lookup against the tracked pod.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown instance or a state persistence
    /// failure.
    pub async fn url(&self, instance: &str) -> Result<Option<String>, RunPodError> {
        if let Ok(slot) = self.last_ensured.lock()
            && let Some((ensured_for, ensured)) = slot.as_ref()
            && ensured_for == instance
        {
            return Ok(Some(ensured.url.clone()));
        }
        Ok(self.manager_for(Some(instance), None)?.pod_url().await?)
    }

    /// Record that the instance's pod was used just now.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown instance or a state persistence
    /// failure.
    pub fn mark_used(
        &self,
        instance: &str,
        nickname: Option<&str>,
    ) -> Result<(), RunPodError> {
        Ok(self
            .manager_for(Some(instance), nickname)?
            .update_last_run_at()?)
    }

    /// Run a prune pass for one instance. On a prune, the instance's stats
    /// snapshot is flushed so dashboards stop showing a dead pod.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown instance or a state persistence
    /// failure.
    pub async fn prune(&self, instance: &str) -> Result<PruneOutcome, RunPodError> {
        let manager = self.manager_for(Some(instance), None)?;
        let outcome = manager.prune_if_inactive().await?;

        if outcome == PruneOutcome::Pruned
            && let Err(e) = StatsWriter::new(self.config.stats_file.clone()).flush(Some(instance))
        {
            warn!(instance, error = %e, "failed to flush stats after prune");
        }
        Ok(outcome)
    }

    /// Terminate the instance's pod regardless of idle time.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown instance or a state persistence
    /// failure.
    pub async fn terminate(&self, instance: &str) -> Result<bool, RunPodError> {
        Ok(self
            .manager_for(Some(instance), None)?
            .terminate_pod()
            .await?)
    }

    /// Refresh and return the instance's stats snapshot: fetches the tracked
    /// pod (writing a new snapshot as a side effect) and reads it back.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown instance or a state persistence
    /// failure.
    pub async fn stats(&self, instance: &str) -> Result<Option<StatsSnapshot>, RunPodError> {
        let manager = self.manager_for(Some(instance), None)?;
        let pod = manager.pod_details().await?;
        if pod.is_none() {
            return Ok(None);
        }
        Ok(StatsWriter::new(self.config.stats_file.clone()).read(instance))
    }

    /// Current account usage through the shared guardrails cache.
    pub async fn usage(&self) -> UsageSnapshot {
        self.guardrails().get_usage().await
    }

    /// Validate current usage against the configured ceilings.
    ///
    /// # Errors
    ///
    /// Returns an error for the first violated limit.
    pub async fn check_guardrails(&self) -> Result<(), RunPodError> {
        Ok(self.guardrails().check().await?)
    }

    /// Evict the shared usage cache.
    pub fn clear_usage_cache(&self) {
        self.guardrails().clear_cache();
    }

    fn guardrails(&self) -> Guardrails {
        Guardrails::new(
            self.provider.clone(),
            Arc::new(JsonFileUsageCache::new(self.config.usage_cache_file.clone())),
            self.config.guardrails.clone(),
        )
    }

    fn manager_for(
        &self,
        instance: Option<&str>,
        nickname: Option<&str>,
    ) -> Result<PodManager, RunPodError> {
        let pod_config = self.config.merged_pod_config(instance)?;
        let store = JsonFileStateStore::new(self.config.state_path(instance, nickname));

        let mut manager = PodManager::new(self.provider.clone(), Box::new(store), pod_config)
            .with_readiness(
                self.config.readiness,
                Duration::from_secs(self.config.poll_interval_secs),
                self.config.poll_max_attempts,
            )
            .with_guardrails(self.guardrails());

        if let Some(instance) = instance {
            manager = manager.with_stats(
                StatsWriter::new(self.config.stats_file.clone()),
                instance,
            );
        }

        Ok(manager)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runpod_client::{
        CreatePodInput, EndpointDescriptor, NetworkVolumeDescriptor, PodDescriptor,
        TelemetryDescriptor,
    };
    use crate::runpod_state::StateStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StaticProvider {
        created: PodDescriptor,
        create_calls: AtomicU32,
    }

    #[async_trait]
    impl ComputeProvider for StaticProvider {
        async fn create_pod(&self, _input: &CreatePodInput) -> Option<PodDescriptor> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            Some(self.created.clone())
        }
        async fn get_pod(&self, pod_id: &str) -> Option<PodDescriptor> {
            (pod_id == self.created.id).then(|| self.created.clone())
        }
        async fn stop_pod(&self, _pod_id: &str) -> bool {
            true
        }
        async fn terminate_pod(&self, _pod_id: &str) -> bool {
            true
        }
        async fn list_pods(&self) -> Vec<PodDescriptor> {
            Vec::new()
        }
        async fn list_endpoints(&self) -> Vec<EndpointDescriptor> {
            Vec::new()
        }
        async fn list_network_volumes(&self) -> Vec<NetworkVolumeDescriptor> {
            Vec::new()
        }
        async fn pod_telemetry(&self, _pod_id: &str) -> Option<TelemetryDescriptor> {
            None
        }
    }

    fn running_pod(id: &str) -> PodDescriptor {
        PodDescriptor {
            id: id.to_string(),
            name: None,
            desiredStatus: Some("RUNNING".to_string()),
            imageName: None,
            ports: Some(vec!["8000/http".to_string()]),
            runtime: None,
            machineId: None,
            networkVolumeId: None,
            costPerHr: None,
        }
    }

    fn config_in(dir: &tempfile::TempDir) -> RunpodConfig {
        let mut config = RunpodConfig {
            state_file: dir.path().join("state.json"),
            stats_file: dir.path().join("stats.json"),
            usage_cache_file: dir.path().join("usage.json"),
            poll_interval_secs: 0,
            poll_max_attempts: 2,
            ..RunpodConfig::default()
        };
        config.pod.image_name = Some("ghcr.io/acme/pdf:latest".to_string());
        config
            .instances
            .insert("alpha".to_string(), crate::runpod_config::InstanceConfig::default());
        config
    }

    #[tokio::test]
    async fn start_ensures_and_remembers_the_url() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(StaticProvider {
            created: running_pod("p1"),
            create_calls: AtomicU32::new(0),
        });

        let facade = RunPod::new(config_in(&dir), provider);
        let ensured = facade
            .start(&StartRequest::new("alpha"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(ensured.pod_id, "p1");
        assert_eq!(
            facade.url("alpha").await.unwrap(),
            Some("https://p1-8000.proxy.runpod.net".to_string())
        );
    }

    #[tokio::test]
    async fn start_marks_usage_so_a_fresh_pod_is_not_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(StaticProvider {
            created: running_pod("p1"),
            create_calls: AtomicU32::new(0),
        });

        let facade = RunPod::new(config_in(&dir), provider);
        facade.start(&StartRequest::new("alpha")).await.unwrap();

        assert_eq!(
            facade.prune("alpha").await.unwrap(),
            PruneOutcome::StillActive
        );
    }

    #[tokio::test]
    async fn mark_used_restarts_the_idle_clock() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(StaticProvider {
            created: running_pod("p1"),
            create_calls: AtomicU32::new(0),
        });

        let facade = RunPod::new(config_in(&dir), provider);
        facade.start(&StartRequest::new("alpha")).await.unwrap();

        let store = JsonFileStateStore::new(dir.path().join("state-alpha.json"));
        let before = store.load().unwrap().unwrap().last_run_at.unwrap();

        facade.mark_used("alpha", None).unwrap();
        let after = store.load().unwrap().unwrap().last_run_at.unwrap();
        assert!(after >= before);
    }

    #[tokio::test]
    async fn unknown_instances_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(StaticProvider {
            created: running_pod("p1"),
            create_calls: AtomicU32::new(0),
        });

        let facade = RunPod::new(config_in(&dir), provider);
        let result = facade.start(&StartRequest::new("missing")).await;
        assert!(matches!(
            result,
            Err(RunPodError::Config(ConfigError::UnknownInstance(_)))
        ));
    }

    #[tokio::test]
    async fn nicknames_scope_state_separately() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(StaticProvider {
            created: running_pod("p1"),
            create_calls: AtomicU32::new(0),
        });

        let facade = RunPod::new(config_in(&dir), provider);
        facade
            .start(&StartRequest::new("alpha").nickname("jobs:pdf"))
            .await
            .unwrap();

        // The instance key wins over the nickname for the state path.
        assert!(dir.path().join("state-alpha.json").exists());
    }
}
