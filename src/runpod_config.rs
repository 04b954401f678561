//! Configuration for the `RunPod` control plane.
//!
//! Unique responsibility: load and merge the declarative configuration that
//! drives every other module: base pod settings, named instances with
//! per-key overrides, guardrail limits, cache/prune schedules, and file
//! paths for state, stats and the shared usage cache.
//!
//! Configuration lives in a TOML file. The API key may come from the file or
//! from the `RUNPOD_API_KEY` environment variable (`.env` is honored via
//! `dotenvy`). A missing API key aborts before any remote call is attempted.

use std::{collections::HashMap, env, fs, path::{Path, PathBuf}};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default REST API URL.
pub const DEFAULT_REST_URL: &str = "https://rest.runpod.io/v1";

/// Default GraphQL API URL (telemetry only).
pub const DEFAULT_GRAPHQL_URL: &str = "https://api.runpod.io/graphql";

/// Error type for configuration loading and resolution.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No API key in the config file or environment.
    #[error(
        "RunPod API key is not configured. Set RUNPOD_API_KEY in your environment \
         or `api_key` in the config file"
    )]
    MissingApiKey,
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The config file is not valid TOML.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },
    /// An instance name was requested that is not configured.
    #[error("unknown instance: {0}. Configure it under [instances.{0}] in the config file")]
    UnknownInstance(String),
}

/// A single pod environment variable, declarative `{key, value}` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    /// Variable name.
    pub key: String,
    /// Variable value.
    pub value: String,
}

/// Base pod configuration. Instance overrides win key-by-key (see
/// [`PodConfig::merged`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PodConfig {
    /// Pod name as shown in the RunPod console.
    pub name: String,
    /// Container image reference. Required for creation; `None` means
    /// creation is refused without any remote call.
    pub image_name: Option<String>,
    /// GPU count. Zero selects a CPU-class request.
    pub gpu_count: u32,
    /// GPU type ID, used only when `gpu_count > 0`.
    pub gpu_type_id: String,
    /// Minimum vCPU count (per GPU for GPU pods, total for CPU pods).
    pub min_vcpu_count: u32,
    /// Minimum RAM in GB (per GPU for GPU pods).
    pub min_memory_in_gb: u32,
    /// Container disk size in GB.
    pub container_disk_in_gb: u32,
    /// Cap applied to the container disk when requesting a CPU pod.
    pub cpu_container_disk_max_gb: u32,
    /// Persistent volume size in GB.
    pub volume_in_gb: u32,
    /// Volume mount path inside the container.
    pub volume_mount_path: String,
    /// Exposed ports, comma-separated (`"8000/http,22/tcp"`).
    pub ports: String,
    /// Pod environment variables.
    pub env: Vec<EnvVar>,
    /// Optional network volume to attach.
    pub network_volume_id: Option<String>,
    /// Preferred data centers. Filtered against the provider's known-valid
    /// IDs before the create call.
    pub data_center_ids: Vec<String>,
    /// Cloud type ("SECURE" or "COMMUNITY").
    pub cloud_type: String,
    /// CPU flavor IDs, used only when `gpu_count == 0`.
    pub cpu_flavor_ids: Vec<String>,
    /// Minutes of inactivity after which the pod is eligible for pruning.
    pub inactivity_minutes: i64,
}

impl Default for PodConfig {
    fn default() -> Self {
        Self {
            name: "runpod-pod".to_string(),
            image_name: None,
            gpu_count: 0,
            gpu_type_id: "NVIDIA GeForce RTX 4090".to_string(),
            min_vcpu_count: 2,
            min_memory_in_gb: 15,
            container_disk_in_gb: 50,
            cpu_container_disk_max_gb: 20,
            volume_in_gb: 50,
            volume_mount_path: "/workspace".to_string(),
            ports: "8000/http".to_string(),
            env: Vec::new(),
            network_volume_id: None,
            data_center_ids: Vec::new(),
            cloud_type: "SECURE".to_string(),
            cpu_flavor_ids: Vec::new(),
            inactivity_minutes: 2,
        }
    }
}

impl PodConfig {
    /// Merge instance overrides over this base config, key-by-key.
    #[must_use]
    pub fn merged(&self, overrides: &PodOverrides) -> Self {
        let mut out = self.clone();
        if let Some(v) = &overrides.name {
            out.name = v.clone();
        }
        if let Some(v) = &overrides.image_name {
            out.image_name = Some(v.clone());
        }
        if let Some(v) = overrides.gpu_count {
            out.gpu_count = v;
        }
        if let Some(v) = &overrides.gpu_type_id {
            out.gpu_type_id = v.clone();
        }
        if let Some(v) = overrides.min_vcpu_count {
            out.min_vcpu_count = v;
        }
        if let Some(v) = overrides.min_memory_in_gb {
            out.min_memory_in_gb = v;
        }
        if let Some(v) = overrides.container_disk_in_gb {
            out.container_disk_in_gb = v;
        }
        if let Some(v) = overrides.cpu_container_disk_max_gb {
            out.cpu_container_disk_max_gb = v;
        }
        if let Some(v) = overrides.volume_in_gb {
            out.volume_in_gb = v;
        }
        if let Some(v) = &overrides.volume_mount_path {
            out.volume_mount_path = v.clone();
        }
        if let Some(v) = &overrides.ports {
            out.ports = v.clone();
        }
        if let Some(v) = &overrides.env {
            out.env = v.clone();
        }
        if let Some(v) = &overrides.network_volume_id {
            out.network_volume_id = v.clone();
        }
        if let Some(v) = &overrides.data_center_ids {
            out.data_center_ids = v.clone();
        }
        if let Some(v) = &overrides.cloud_type {
            out.cloud_type = v.clone();
        }
        if let Some(v) = &overrides.cpu_flavor_ids {
            out.cpu_flavor_ids = v.clone();
        }
        if let Some(v) = overrides.inactivity_minutes {
            out.inactivity_minutes = v;
        }
        out
    }

    /// The compute variant this config requests, chosen once up front rather
    /// than branching throughout input construction.
    #[must_use]
    pub fn compute_request(&self) -> ComputeRequest {
        if self.gpu_count > 0 {
            ComputeRequest::Gpu {
                count: self.gpu_count,
                type_id: self.gpu_type_id.clone(),
                min_ram_per_gpu: self.min_memory_in_gb,
                min_vcpu_per_gpu: self.min_vcpu_count,
            }
        } else {
            ComputeRequest::Cpu {
                vcpu_count: self.min_vcpu_count,
                cpu_flavor_ids: self.cpu_flavor_ids.clone(),
            }
        }
    }

    /// Effective container disk size. CPU pods are capped at
    /// `cpu_container_disk_max_gb`.
    #[must_use]
    pub fn effective_container_disk_gb(&self) -> u32 {
        if self.gpu_count == 0 {
            self.container_disk_in_gb.min(self.cpu_container_disk_max_gb)
        } else {
            self.container_disk_in_gb
        }
    }

    /// Flatten the declarative env list into the `{KEY: value}` map the REST
    /// API expects.
    #[must_use]
    pub fn env_map(&self) -> HashMap<String, String> {
        self.env
            .iter()
            .map(|e| (e.key.clone(), e.value.clone()))
            .collect()
    }

    /// Split the comma-separated port spec into a list, dropping empties.
    #[must_use]
    pub fn port_list(&self) -> Vec<String> {
        self.ports
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Per-instance pod overrides. Every field is optional; `None` keeps the base
/// value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PodOverrides {
    /// Overrides [`PodConfig::name`].
    pub name: Option<String>,
    /// Overrides [`PodConfig::image_name`].
    pub image_name: Option<String>,
    /// Overrides [`PodConfig::gpu_count`].
    pub gpu_count: Option<u32>,
    /// Overrides [`PodConfig::gpu_type_id`].
    pub gpu_type_id: Option<String>,
    /// Overrides [`PodConfig::min_vcpu_count`].
    pub min_vcpu_count: Option<u32>,
    /// Overrides [`PodConfig::min_memory_in_gb`].
    pub min_memory_in_gb: Option<u32>,
    /// Overrides [`PodConfig::container_disk_in_gb`].
    pub container_disk_in_gb: Option<u32>,
    /// Overrides [`PodConfig::cpu_container_disk_max_gb`].
    pub cpu_container_disk_max_gb: Option<u32>,
    /// Overrides [`PodConfig::volume_in_gb`].
    pub volume_in_gb: Option<u32>,
    /// Overrides [`PodConfig::volume_mount_path`].
    pub volume_mount_path: Option<String>,
    /// Overrides [`PodConfig::ports`].
    pub ports: Option<String>,
    /// Overrides [`PodConfig::env`] wholesale.
    pub env: Option<Vec<EnvVar>>,
    /// Overrides [`PodConfig::network_volume_id`].
    pub network_volume_id: Option<Option<String>>,
    /// Overrides [`PodConfig::data_center_ids`].
    pub data_center_ids: Option<Vec<String>>,
    /// Overrides [`PodConfig::cloud_type`].
    pub cloud_type: Option<String>,
    /// Overrides [`PodConfig::cpu_flavor_ids`].
    pub cpu_flavor_ids: Option<Vec<String>>,
    /// Overrides [`PodConfig::inactivity_minutes`].
    pub inactivity_minutes: Option<i64>,
}

/// Compute variant requested from the provider, chosen once from the merged
/// config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputeRequest {
    /// CPU-class pod.
    Cpu {
        /// Requested vCPU count.
        vcpu_count: u32,
        /// Acceptable CPU flavors; empty means "any".
        cpu_flavor_ids: Vec<String>,
    },
    /// GPU pod.
    Gpu {
        /// Number of GPUs.
        count: u32,
        /// GPU type ID.
        type_id: String,
        /// Minimum RAM per GPU in GB.
        min_ram_per_gpu: u32,
        /// Minimum vCPUs per GPU.
        min_vcpu_per_gpu: u32,
    },
}

/// Ceilings on pod usage. `None` or `0` means unconstrained.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PodLimits {
    /// Maximum total pods.
    pub pods_max: Option<u64>,
    /// Maximum concurrently running pods.
    pub pods_running_max: Option<u64>,
}

/// Ceilings on serverless usage. `None` or `0` means unconstrained.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerlessLimits {
    /// Maximum serverless endpoints.
    pub endpoints_max: Option<u64>,
    /// Maximum summed `workersMax` across endpoints.
    pub workers_total_max: Option<u64>,
}

/// Ceilings on storage usage. `None` or `0` means unconstrained.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageLimits {
    /// Maximum network volumes.
    pub network_volumes_max: Option<u64>,
    /// Maximum summed volume size in GB.
    pub volume_size_gb_max: Option<u64>,
}

/// All guardrail ceilings, grouped by service.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailLimits {
    /// Pod limits.
    pub pods: PodLimits,
    /// Serverless limits.
    pub serverless: ServerlessLimits,
    /// Storage limits.
    pub storage: StorageLimits,
}

/// Guardrails configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailsConfig {
    /// Master switch. Disabled guardrails make every check a no-op.
    pub enabled: bool,
    /// Usage cache refresh cadence (schedule-method name, e.g.
    /// `"everyFifteenMinutes"`). Unrecognized values fall back to 15 minutes.
    pub cache_schedule: String,
    /// Configured ceilings.
    pub limits: GuardrailLimits,
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_schedule: "everyFifteenMinutes".to_string(),
            limits: GuardrailLimits::default(),
        }
    }
}

/// Map a schedule-method name to a cache TTL in seconds.
///
/// Unrecognized names default to 900 seconds (15 minutes).
#[must_use]
pub fn cache_ttl_seconds(schedule: &str) -> u64 {
    match schedule {
        "everyMinute" => 60,
        "everyTwoMinutes" => 120,
        "everyThreeMinutes" => 180,
        "everyFourMinutes" => 240,
        "everyFiveMinutes" => 300,
        "everyTenMinutes" => 600,
        "everyThirtyMinutes" => 1800,
        "hourly" => 3600,
        _ => 900,
    }
}

/// Map a schedule-method name to minutes. Unrecognized names default to 5.
#[must_use]
pub fn schedule_minutes(schedule: &str) -> i64 {
    match schedule {
        "everyMinute" => 1,
        "everyTwoMinutes" => 2,
        "everyThreeMinutes" => 3,
        "everyFourMinutes" => 4,
        "everyFiveMinutes" => 5,
        "everyTenMinutes" => 10,
        "everyFifteenMinutes" => 15,
        "everyThirtyMinutes" => 30,
        "hourly" => 60,
        _ => 5,
    }
}

/// Behavior when the readiness wait exhausts its attempt budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadinessMode {
    /// Return the deterministic proxy URL and assume the pod will come up.
    #[default]
    Optimistic,
    /// Report failure instead of an unverified URL.
    FailFast,
}

/// A named, preconfigured workload profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Prune cadence for this instance (schedule-method name).
    pub prune_schedule: Option<String>,
    /// Dedicated state file; overrides the derived per-instance path.
    pub state_file: Option<PathBuf>,
    /// Pod overrides merged over the base `[pod]` table.
    pub pod: PodOverrides,
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunpodConfig {
    /// API key. Falls back to the `RUNPOD_API_KEY` environment variable.
    pub api_key: Option<String>,
    /// REST API URL.
    pub rest_url: String,
    /// GraphQL API URL.
    pub graphql_url: String,
    /// HTTP request timeout in milliseconds.
    pub http_timeout_ms: u64,
    /// Maximum HTTP retry attempts.
    pub retry_max: u32,
    /// Initial retry backoff in milliseconds (doubles per attempt).
    pub retry_backoff_ms: u64,
    /// Base state file path; per-instance paths derive from it.
    pub state_file: PathBuf,
    /// Base stats file path; per-instance paths derive from it.
    pub stats_file: PathBuf,
    /// Shared guardrails usage cache file.
    pub usage_cache_file: PathBuf,
    /// Readiness-wait fallback behavior.
    pub readiness: ReadinessMode,
    /// Seconds between readiness poll attempts.
    pub poll_interval_secs: u64,
    /// Maximum readiness poll attempts.
    pub poll_max_attempts: u32,
    /// Default prune cadence for instances that do not set one.
    pub prune_schedule: String,
    /// Guardrails configuration.
    pub guardrails: GuardrailsConfig,
    /// Base pod configuration.
    pub pod: PodConfig,
    /// Named instances.
    pub instances: HashMap<String, InstanceConfig>,
}

impl Default for RunpodConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            rest_url: DEFAULT_REST_URL.to_string(),
            graphql_url: DEFAULT_GRAPHQL_URL.to_string(),
            http_timeout_ms: 30_000,
            retry_max: 3,
            retry_backoff_ms: 500,
            state_file: PathBuf::from("state/runpod-pod-state.json"),
            stats_file: PathBuf::from("state/runpod-stats.json"),
            usage_cache_file: PathBuf::from("state/runpod-usage-cache.json"),
            readiness: ReadinessMode::Optimistic,
            poll_interval_secs: 5,
            poll_max_attempts: 30,
            prune_schedule: "everyFiveMinutes".to_string(),
            guardrails: GuardrailsConfig::default(),
            pod: PodConfig::default(),
            instances: HashMap::new(),
        }
    }
}

impl RunpodConfig {
    /// Load configuration from a TOML file. `.env` is honored, and a missing
    /// `api_key` falls back to `RUNPOD_API_KEY`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut cfg: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if cfg.api_key.is_none() {
            cfg.api_key = env::var("RUNPOD_API_KEY")
                .ok()
                .filter(|s| !s.trim().is_empty());
        }

        Ok(cfg)
    }

    /// The configured API key.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingApiKey`] if none is configured.
    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.api_key.as_deref().ok_or(ConfigError::MissingApiKey)
    }

    /// Look up a named instance.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownInstance`] if the name is not configured.
    pub fn instance(&self, name: &str) -> Result<&InstanceConfig, ConfigError> {
        self.instances
            .get(name)
            .ok_or_else(|| ConfigError::UnknownInstance(name.to_string()))
    }

    /// Pod config for an instance: base `[pod]` with the instance overrides
    /// applied. `None` returns the base config unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownInstance`] for an unconfigured name.
    pub fn merged_pod_config(&self, instance: Option<&str>) -> Result<PodConfig, ConfigError> {
        match instance {
            Some(name) => Ok(self.pod.merged(&self.instance(name)?.pod)),
            None => Ok(self.pod.clone()),
        }
    }

    /// Resolve the state file path for an instance or nickname.
    ///
    /// A per-instance `state_file` override wins; otherwise the base path
    /// gets an instance-safe suffix. The suffix key is the instance name,
    /// falling back to the nickname, falling back to `"default"`.
    #[must_use]
    pub fn state_path(&self, instance: Option<&str>, nickname: Option<&str>) -> PathBuf {
        if let Some(name) = instance
            && let Some(cfg) = self.instances.get(name)
            && let Some(path) = &cfg.state_file
        {
            return path.clone();
        }
        let key = instance.or(nickname).unwrap_or("default");
        suffixed_path(&self.state_file, key)
    }
}

/// Insert an instance-safe suffix before a `.json` extension, or append it
/// dot-separated otherwise. Non `[A-Za-z0-9_-]` characters become `_`.
#[must_use]
pub fn suffixed_path(base: &Path, key: &str) -> PathBuf {
    let safe: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if base.extension().and_then(|e| e.to_str()) == Some("json") {
        let stem = base
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("runpod-state");
        base.with_file_name(format!("{stem}-{safe}.json"))
    } else {
        PathBuf::from(format!("{}.{safe}", base.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_overrides_win_key_by_key() {
        let base = PodConfig {
            image_name: Some("base/image:1".to_string()),
            gpu_count: 1,
            ..PodConfig::default()
        };
        let overrides = PodOverrides {
            gpu_count: Some(0),
            ports: Some("9000/http".to_string()),
            ..PodOverrides::default()
        };

        let merged = base.merged(&overrides);
        assert_eq!(merged.gpu_count, 0);
        assert_eq!(merged.ports, "9000/http");
        // Untouched keys keep the base value.
        assert_eq!(merged.image_name.as_deref(), Some("base/image:1"));
    }

    #[test]
    fn compute_request_branches_once_on_gpu_count() {
        let cpu = PodConfig {
            gpu_count: 0,
            min_vcpu_count: 4,
            ..PodConfig::default()
        };
        assert_eq!(
            cpu.compute_request(),
            ComputeRequest::Cpu {
                vcpu_count: 4,
                cpu_flavor_ids: Vec::new(),
            }
        );

        let gpu = PodConfig {
            gpu_count: 2,
            gpu_type_id: "NVIDIA A40".to_string(),
            ..PodConfig::default()
        };
        assert_eq!(
            gpu.compute_request(),
            ComputeRequest::Gpu {
                count: 2,
                type_id: "NVIDIA A40".to_string(),
                min_ram_per_gpu: 15,
                min_vcpu_per_gpu: 2,
            }
        );
    }

    #[test]
    fn cpu_pods_cap_container_disk() {
        let cfg = PodConfig {
            gpu_count: 0,
            container_disk_in_gb: 50,
            cpu_container_disk_max_gb: 20,
            ..PodConfig::default()
        };
        assert_eq!(cfg.effective_container_disk_gb(), 20);

        let gpu = PodConfig {
            gpu_count: 1,
            ..cfg
        };
        assert_eq!(gpu.effective_container_disk_gb(), 50);
    }

    #[test]
    fn env_list_flattens_to_map() {
        let cfg = PodConfig {
            env: vec![
                EnvVar {
                    key: "DATA_DIR".to_string(),
                    value: "/workspace".to_string(),
                },
                EnvVar {
                    key: "OUTPUT_DIR".to_string(),
                    value: "/workspace/output".to_string(),
                },
            ],
            ..PodConfig::default()
        };
        let map = cfg.env_map();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("DATA_DIR").map(String::as_str), Some("/workspace"));
    }

    #[test]
    fn port_spec_splits_and_trims() {
        let cfg = PodConfig {
            ports: "8000/http, 22/tcp,,".to_string(),
            ..PodConfig::default()
        };
        assert_eq!(cfg.port_list(), vec!["8000/http", "22/tcp"]);
    }

    #[test]
    fn unrecognized_cache_schedule_defaults_to_fifteen_minutes() {
        assert_eq!(cache_ttl_seconds("everyMinute"), 60);
        assert_eq!(cache_ttl_seconds("hourly"), 3600);
        assert_eq!(cache_ttl_seconds("whenever"), 900);
    }

    #[test]
    fn suffixed_path_sanitizes_and_inserts_before_extension() {
        let base = PathBuf::from("state/runpod-pod-state.json");
        assert_eq!(
            suffixed_path(&base, "App\\Jobs\\PymupdfJob"),
            PathBuf::from("state/runpod-pod-state-App_Jobs_PymupdfJob.json")
        );

        let bare = PathBuf::from("state/podstate");
        assert_eq!(
            suffixed_path(&bare, "alpha"),
            PathBuf::from("state/podstate.alpha")
        );
    }

    #[test]
    fn state_path_prefers_instance_override() {
        let mut cfg = RunpodConfig::default();
        cfg.instances.insert(
            "alpha".to_string(),
            InstanceConfig {
                state_file: Some(PathBuf::from("/tmp/alpha.json")),
                ..InstanceConfig::default()
            },
        );
        cfg.instances
            .insert("beta".to_string(), InstanceConfig::default());

        assert_eq!(
            cfg.state_path(Some("alpha"), None),
            PathBuf::from("/tmp/alpha.json")
        );
        assert_eq!(
            cfg.state_path(Some("beta"), Some("nick")),
            PathBuf::from("state/runpod-pod-state-beta.json")
        );
        assert_eq!(
            cfg.state_path(None, Some("jobs:pdf")),
            PathBuf::from("state/runpod-pod-state-jobs_pdf.json")
        );
        assert_eq!(
            cfg.state_path(None, None),
            PathBuf::from("state/runpod-pod-state-default.json")
        );
    }

    #[test]
    fn toml_round_trip_with_defaults() {
        let raw = r#"
            state_file = "st/state.json"

            [guardrails]
            enabled = true
            cache_schedule = "everyFiveMinutes"

            [guardrails.limits.pods]
            pods_max = 10
            pods_running_max = 5

            [pod]
            image_name = "ghcr.io/acme/pdf:latest"
            gpu_count = 0

            [instances.pymupdf]
            prune_schedule = "everyFiveMinutes"

            [instances.pymupdf.pod]
            ports = "8000/http"
        "#;
        let cfg: RunpodConfig = toml::from_str(raw).unwrap();
        assert_eq!(cfg.rest_url, DEFAULT_REST_URL);
        assert_eq!(cfg.guardrails.limits.pods.pods_max, Some(10));
        assert_eq!(cfg.pod.inactivity_minutes, 2);
        let merged = cfg.merged_pod_config(Some("pymupdf")).unwrap();
        assert_eq!(merged.image_name.as_deref(), Some("ghcr.io/acme/pdf:latest"));
        assert!(cfg.merged_pod_config(Some("missing")).is_err());
    }
}
