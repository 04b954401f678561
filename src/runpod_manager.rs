//! Pod lifecycle manager.
//!
//! Unique responsibility: own the create/reuse/terminate decisions for one
//! instance's pod. Everything here reconciles three sources of truth:
//! - the persisted state record (which pod we own, when it was last used),
//! - the provider's view of that pod,
//! - the merged pod configuration.
//!
//! Ordering rules this module exists to enforce:
//! - State is written (pod ID plus `last_run_at`) BEFORE the readiness wait,
//!   so a crash mid-wait leaves a tracked pod a later prune can reap instead
//!   of an orphan billing silently.
//! - [`PodManager::terminate_pod`] clears state regardless of the provider's
//!   answer; a pod that is already gone must not wedge the record.
//! - Prune eligibility is `elapsed >= inactivity_minutes`, so a pod idle for
//!   exactly the threshold is reaped.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::runpod_client::{
    ComputeProvider, CreatePodInput, DEFAULT_HTTP_PORT, PodDescriptor, proxy_url,
};
use crate::runpod_config::{ComputeRequest, PodConfig, ReadinessMode};
use crate::runpod_guardrails::{Guardrails, GuardrailsError};
use crate::runpod_state::{PodState, StateStore, StateStoreError};
use crate::runpod_stats::StatsWriter;

/// Data-center IDs the provider accepts. Configured values outside this list
/// are dropped before the create call instead of failing it.
pub const VALID_DATA_CENTER_IDS: &[&str] = &[
    "AP-JP-1", "CA-MTL-1", "CA-MTL-2", "CA-MTL-3", "EU-CZ-1", "EU-FR-1", "EU-NL-1", "EU-RO-1",
    "EU-SE-1", "EUR-IS-1", "EUR-IS-2", "EUR-IS-3", "EUR-NO-1", "OC-AU-1", "US-CA-2", "US-DE-1",
    "US-GA-1", "US-GA-2", "US-IL-1", "US-KS-2", "US-KS-3", "US-NC-1", "US-TX-1", "US-TX-3",
    "US-TX-4", "US-WA-1",
];

/// Error type for lifecycle operations. Provider failures are not errors
/// here (the gateway swallows them); only guardrail violations and state
/// persistence failures propagate.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// A usage guardrail blocked the operation.
    #[error(transparent)]
    Guardrails(#[from] GuardrailsError),
    /// The state record could not be read or written.
    #[error(transparent)]
    State(#[from] StateStoreError),
}

/// A pod confirmed (or optimistically assumed) usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsuredPod {
    /// Provider-assigned pod ID.
    pub pod_id: String,
    /// Public HTTP URL for the pod.
    pub url: String,
}

/// Outcome of a prune pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneOutcome {
    /// The tracked pod was idle past the threshold and was terminated.
    Pruned,
    /// A pod is tracked but has not been idle long enough.
    StillActive,
    /// No pod (or no usable timestamp) is tracked.
    NothingToPrune,
}

/// Lifecycle manager for one instance's pod.
pub struct PodManager {
    provider: Arc<dyn ComputeProvider>,
    store: Box<dyn StateStore>,
    pod_config: PodConfig,
    guardrails: Option<Guardrails>,
    stats: Option<(StatsWriter, String)>,
    readiness: ReadinessMode,
    poll_interval: Duration,
    poll_max_attempts: u32,
}

impl PodManager {
    /// Create a manager over a provider, a state store and a merged pod
    /// config.
    #[must_use]
    pub fn new(
        provider: Arc<dyn ComputeProvider>,
        store: Box<dyn StateStore>,
        pod_config: PodConfig,
    ) -> Self {
        Self {
            provider,
            store,
            pod_config,
            guardrails: None,
            stats: None,
            readiness: ReadinessMode::default(),
            poll_interval: Duration::from_secs(5),
            poll_max_attempts: 30,
        }
    }

    /// Gate pod creation behind usage guardrails.
    #[must_use]
    pub fn with_guardrails(mut self, guardrails: Guardrails) -> Self {
        self.guardrails = Some(guardrails);
        self
    }

    /// Write dashboard stats snapshots for `instance` on pod activity.
    #[must_use]
    pub fn with_stats(mut self, writer: StatsWriter, instance: impl Into<String>) -> Self {
        self.stats = Some((writer, instance.into()));
        self
    }

    /// Configure the readiness wait.
    #[must_use]
    pub fn with_readiness(
        mut self,
        mode: ReadinessMode,
        poll_interval: Duration,
        poll_max_attempts: u32,
    ) -> Self {
        self.readiness = mode;
        self.poll_interval = poll_interval;
        self.poll_max_attempts = poll_max_attempts;
        self
    }

    /// Ensure a usable pod exists, idempotently.
    ///
    /// A tracked pod the provider reports as running is reused as-is. A
    /// tracked pod that is gone or not running is terminated best-effort and
    /// replaced. With nothing tracked, a pod is created (guardrails
    /// permitting), persisted, and waited on until it reports running.
    ///
    /// Returns `Ok(None)` when no pod could be ensured: missing image
    /// reference (no remote call is made), a failed create call, or an
    /// exhausted readiness wait under [`ReadinessMode::FailFast`].
    ///
    /// # Errors
    ///
    /// Returns an error on a guardrail violation or a state persistence
    /// failure.
    pub async fn ensure_pod(&self) -> Result<Option<EnsuredPod>, ManagerError> {
        let state = self.store.load()?;

        if let Some(state) = &state
            && let Some(pod_id) = state.pod_id()
        {
            if let Some(pod) = self.provider.get_pod(pod_id).await
                && pod.is_running()
            {
                debug!(pod_id, "reusing tracked running pod");
                let url = self.provider.public_url(pod_id, DEFAULT_HTTP_PORT).await;
                self.write_stats(&pod, state.last_run_at).await;
                return Ok(Some(EnsuredPod {
                    pod_id: pod_id.to_string(),
                    url,
                }));
            }

            // Tracked but gone or not running: reap before replacing so the
            // old pod cannot keep billing untracked.
            info!(pod_id, "tracked pod is not running, terminating before replacement");
            let _ = self.provider.terminate_pod(pod_id).await;
        }

        let Some(input) = self.build_create_input() else {
            return Ok(None);
        };

        if let Some(guardrails) = &self.guardrails {
            guardrails.check_before_create_pod().await?;
        }

        let Some(created) = self.provider.create_pod(&input).await else {
            warn!("pod create call returned nothing");
            return Ok(None);
        };
        info!(pod_id = %created.id, "created pod");

        // Persist before waiting: a crash during the wait must leave the new
        // pod tracked.
        let last_run_at = Utc::now();
        self.store
            .save(&PodState::tracked(&created.id, last_run_at))?;

        let url = match self.wait_for_ready(&created.id).await {
            Some(url) => url,
            None => match self.readiness {
                ReadinessMode::Optimistic => {
                    warn!(pod_id = %created.id, "pod not ready in time, returning proxy URL optimistically");
                    self.provider.public_url(&created.id, DEFAULT_HTTP_PORT).await
                }
                ReadinessMode::FailFast => {
                    // The pod stays tracked; a later ensure or prune pass
                    // picks it up.
                    warn!(pod_id = %created.id, "pod not ready in time");
                    return Ok(None);
                }
            },
        };

        if let Some(pod) = self.provider.get_pod(&created.id).await {
            self.write_stats(&pod, Some(last_run_at)).await;
        }

        Ok(Some(EnsuredPod {
            pod_id: created.id,
            url,
        }))
    }

    /// Record "the pod was used just now". No-op when nothing is tracked.
    ///
    /// # Errors
    ///
    /// Returns an error on a state persistence failure.
    pub fn update_last_run_at(&self) -> Result<(), ManagerError> {
        if let Some(mut state) = self.store.load()?
            && state.pod_id.is_some()
        {
            state.last_run_at = Some(Utc::now());
            self.store.save(&state)?;
        }
        Ok(())
    }

    /// Terminate the tracked pod. State is cleared regardless of the
    /// provider's answer. Returns whether the provider acknowledged (or
    /// `true` when nothing was tracked).
    ///
    /// # Errors
    ///
    /// Returns an error on a state persistence failure.
    pub async fn terminate_pod(&self) -> Result<bool, ManagerError> {
        let state = self.store.load()?;
        let Some(pod_id) = state.as_ref().and_then(PodState::pod_id) else {
            self.store.clear()?;
            return Ok(true);
        };

        let acknowledged = self.provider.terminate_pod(pod_id).await;
        if !acknowledged {
            warn!(pod_id, "provider did not acknowledge terminate, clearing state anyway");
        }
        self.store.clear()?;
        Ok(acknowledged)
    }

    /// Terminate the tracked pod if it has been idle for at least the
    /// configured inactivity threshold.
    ///
    /// # Errors
    ///
    /// Returns an error on a state persistence failure.
    pub async fn prune_if_inactive(&self) -> Result<PruneOutcome, ManagerError> {
        let Some(state) = self.store.load()? else {
            return Ok(PruneOutcome::NothingToPrune);
        };
        if state.pod_id.is_none() {
            return Ok(PruneOutcome::NothingToPrune);
        }
        let Some(last_run_at) = state.last_run_at else {
            return Ok(PruneOutcome::NothingToPrune);
        };

        let idle_minutes = (Utc::now() - last_run_at).num_minutes();
        if idle_minutes < self.pod_config.inactivity_minutes {
            debug!(idle_minutes, threshold = self.pod_config.inactivity_minutes, "pod still active");
            return Ok(PruneOutcome::StillActive);
        }

        info!(idle_minutes, "pruning inactive pod");
        self.terminate_pod().await?;
        Ok(PruneOutcome::Pruned)
    }

    /// Fetch the tracked pod's descriptor and refresh the stats snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error on a state persistence failure.
    pub async fn pod_details(&self) -> Result<Option<PodDescriptor>, ManagerError> {
        let Some(state) = self.store.load()? else {
            return Ok(None);
        };
        let Some(pod_id) = state.pod_id() else {
            return Ok(None);
        };

        let pod = self.provider.get_pod(pod_id).await;
        if let Some(pod) = &pod {
            self.write_stats(pod, state.last_run_at).await;
        }
        Ok(pod)
    }

    /// Public URL for the tracked pod, if any.
    ///
    /// # Errors
    ///
    /// Returns an error on a state persistence failure.
    pub async fn pod_url(&self) -> Result<Option<String>, ManagerError> {
        let Some(state) = self.store.load()? else {
            return Ok(None);
        };
        let Some(pod_id) = state.pod_id() else {
            return Ok(None);
        };
        Ok(Some(
            self.provider.public_url(pod_id, DEFAULT_HTTP_PORT).await,
        ))
    }

    /// The merged pod config this manager operates with.
    #[must_use]
    pub const fn pod_config(&self) -> &PodConfig {
        &self.pod_config
    }

    /// Poll until the pod reports running, up to the attempt budget.
    async fn wait_for_ready(&self, pod_id: &str) -> Option<String> {
        for attempt in 0..self.poll_max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.poll_interval).await;
            }
            if let Some(pod) = self.provider.get_pod(pod_id).await
                && pod.is_running()
            {
                return Some(proxy_url(Some(&pod), pod_id, DEFAULT_HTTP_PORT));
            }
        }
        None
    }

    /// Build the create request from the merged config. `None` when no image
    /// is configured; creation is refused without any remote call.
    fn build_create_input(&self) -> Option<CreatePodInput> {
        let cfg = &self.pod_config;
        let Some(image) = cfg.image_name.clone() else {
            warn!(pod = %cfg.name, "no image_name configured, refusing to create a pod");
            return None;
        };

        let mut input = CreatePodInput {
            name: cfg.name.clone(),
            imageName: image,
            cloudType: cfg.cloud_type.clone(),
            volumeInGb: cfg.volume_in_gb,
            containerDiskInGb: cfg.effective_container_disk_gb(),
            volumeMountPath: cfg.volume_mount_path.clone(),
            ports: cfg.port_list(),
            env: cfg.env_map(),
            computeType: None,
            vcpuCount: None,
            cpuFlavorIds: None,
            gpuCount: None,
            gpuTypeIds: None,
            minRAMPerGPU: None,
            minVCPUPerGPU: None,
            networkVolumeId: cfg.network_volume_id.clone(),
            dataCenterIds: None,
        };

        match cfg.compute_request() {
            ComputeRequest::Gpu {
                count,
                type_id,
                min_ram_per_gpu,
                min_vcpu_per_gpu,
            } => {
                input.gpuCount = Some(count);
                input.gpuTypeIds = Some(vec![type_id]);
                input.minRAMPerGPU = Some(min_ram_per_gpu);
                input.minVCPUPerGPU = Some(min_vcpu_per_gpu);
            }
            ComputeRequest::Cpu {
                vcpu_count,
                cpu_flavor_ids,
            } => {
                input.computeType = Some("CPU".to_string());
                input.vcpuCount = Some(vcpu_count);
                if !cpu_flavor_ids.is_empty() {
                    input.cpuFlavorIds = Some(cpu_flavor_ids);
                }
            }
        }

        let data_centers = filter_valid_data_center_ids(&cfg.data_center_ids);
        if !data_centers.is_empty() {
            input.dataCenterIds = Some(data_centers);
        }

        Some(input)
    }

    async fn write_stats(&self, pod: &PodDescriptor, last_run_at: Option<DateTime<Utc>>) {
        let Some((writer, instance)) = &self.stats else {
            return;
        };
        let telemetry = self.provider.pod_telemetry(&pod.id).await;
        if let Err(e) = writer.write(
            instance,
            pod,
            telemetry.as_ref(),
            last_run_at,
            self.pod_config.inactivity_minutes,
        ) {
            warn!(instance, error = %e, "failed to write stats snapshot");
        }
    }
}

/// Keep only data-center IDs the provider accepts, preserving order.
#[must_use]
pub fn filter_valid_data_center_ids(configured: &[String]) -> Vec<String> {
    configured
        .iter()
        .filter(|id| VALID_DATA_CENTER_IDS.contains(&id.as_str()))
        .cloned()
        .collect()
}
