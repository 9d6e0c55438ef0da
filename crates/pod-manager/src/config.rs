//! Pod Manager Configuration
//!
//! Loaded from a mounted YAML file (usually a ConfigMap). Every field has a
//! default so a partial file is enough; `validate` rejects values that would
//! only fail later against the cluster.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// One year; longer idle timeouts are a configuration mistake
const MAX_IDLE_TIMEOUT_MINUTES: u64 = 365 * 24 * 60;

/// Thirty days
const MAX_GRACE_PERIOD_SECONDS: u64 = 30 * 24 * 60 * 60;

/// Main pod manager configuration structure
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodManagerConfig {
    /// Feature flag; when false every operation is refused and GC is a no-op
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Namespace all worktree resources live in
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Interactive shell pod settings
    #[serde(default = "default_shell_pod")]
    pub shell_pod: PodKindConfig,

    /// Container runtime (podman) pod settings
    #[serde(default = "default_podman_pod")]
    pub podman_pod: PodKindConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub ingress: IngressConfig,

    #[serde(default)]
    pub gc: GcConfig,

    #[serde(default)]
    pub readiness: ReadinessConfig,
}

/// Image, quotas and idle timeout for one kind of pod
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodKindConfig {
    pub image: String,

    #[serde(default)]
    pub resources: ResourceConfig,

    /// Minutes without activity before GC reclaims the pod
    pub idle_timeout_minutes: u64,
}

impl PodKindConfig {
    #[must_use]
    pub fn idle_timeout(&self) -> chrono::Duration {
        i64::try_from(self.idle_timeout_minutes)
            .ok()
            .and_then(chrono::Duration::try_minutes)
            .unwrap_or(chrono::Duration::MAX)
    }
}

/// CPU/memory requests and limits, in Kubernetes quantity notation
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    #[serde(default = "default_cpu_request")]
    pub cpu_request: String,
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: String,
    #[serde(default = "default_memory_request")]
    pub memory_request: String,
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            cpu_request: default_cpu_request(),
            cpu_limit: default_cpu_limit(),
            memory_request: default_memory_request(),
            memory_limit: default_memory_limit(),
        }
    }
}

/// Shared data volume configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// PersistentVolumeClaim holding every worktree checkout
    #[serde(default = "default_pvc_name")]
    pub pvc_name: String,

    /// Path the claim's root corresponds to; worktree paths below it are
    /// mounted as sub-paths
    #[serde(default = "default_data_root")]
    pub data_root: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            pvc_name: default_pvc_name(),
            data_root: default_data_root(),
        }
    }
}

/// App exposure (Ingress) configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressConfig {
    /// Base domain for worktree hostnames; callers may override per request
    #[serde(default)]
    pub base_domain: Option<String>,

    /// `ingressClassName` to set on generated ingresses
    #[serde(default)]
    pub class_name: Option<String>,

    /// Extra annotations (cert-manager issuers, proxy settings, ...)
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    /// TLS secret for the wildcard certificate; enables https URLs
    #[serde(default)]
    pub tls_secret_name: Option<String>,
}

/// Garbage collection configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GcConfig {
    /// Minimum age before a resource may be treated as orphaned
    #[serde(default = "default_grace_period")]
    pub grace_period_seconds: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            grace_period_seconds: default_grace_period(),
        }
    }
}

impl GcConfig {
    #[must_use]
    pub fn grace_period(&self) -> chrono::Duration {
        i64::try_from(self.grace_period_seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }
}

/// Readiness wait configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessConfig {
    #[serde(default = "default_readiness_timeout")]
    pub timeout_seconds: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_readiness_timeout(),
        }
    }
}

impl ReadinessConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

fn default_enabled() -> bool {
    true
}

fn default_namespace() -> String {
    "agor-executors".to_string()
}

fn default_shell_pod() -> PodKindConfig {
    PodKindConfig {
        image: "ghcr.io/preset-io/agor-executor:latest".to_string(),
        resources: ResourceConfig::default(),
        idle_timeout_minutes: 30,
    }
}

fn default_podman_pod() -> PodKindConfig {
    PodKindConfig {
        image: "quay.io/podman/stable:latest".to_string(),
        resources: ResourceConfig {
            cpu_request: "250m".to_string(),
            cpu_limit: "4".to_string(),
            memory_request: "512Mi".to_string(),
            memory_limit: "8Gi".to_string(),
        },
        idle_timeout_minutes: 60,
    }
}

fn default_cpu_request() -> String {
    "100m".to_string()
}

fn default_cpu_limit() -> String {
    "2".to_string()
}

fn default_memory_request() -> String {
    "256Mi".to_string()
}

fn default_memory_limit() -> String {
    "4Gi".to_string()
}

fn default_pvc_name() -> String {
    "agor-data".to_string()
}

fn default_data_root() -> String {
    "/data".to_string()
}

fn default_grace_period() -> u64 {
    300 // 5 minutes
}

fn default_readiness_timeout() -> u64 {
    120
}

impl Default for PodManagerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            namespace: default_namespace(),
            shell_pod: default_shell_pod(),
            podman_pod: default_podman_pod(),
            storage: StorageConfig::default(),
            ingress: IngressConfig::default(),
            gc: GcConfig::default(),
            readiness: ReadinessConfig::default(),
        }
    }
}

impl PodManagerConfig {
    /// Validate that configuration has usable values
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.namespace.trim().is_empty() {
            return Err(anyhow::anyhow!("namespace must not be empty"));
        }

        for (kind, pod) in [("shellPod", &self.shell_pod), ("podmanPod", &self.podman_pod)] {
            if pod.image.trim().is_empty() {
                return Err(anyhow::anyhow!("{kind}.image must not be empty"));
            }
            if pod.idle_timeout_minutes == 0 {
                return Err(anyhow::anyhow!(
                    "{kind}.idleTimeoutMinutes must be greater than zero"
                ));
            }
            if pod.idle_timeout_minutes > MAX_IDLE_TIMEOUT_MINUTES {
                return Err(anyhow::anyhow!(
                    "{kind}.idleTimeoutMinutes must be at most {MAX_IDLE_TIMEOUT_MINUTES}"
                ));
            }
        }

        if self.gc.grace_period_seconds > MAX_GRACE_PERIOD_SECONDS {
            return Err(anyhow::anyhow!(
                "gc.gracePeriodSeconds must be at most {MAX_GRACE_PERIOD_SECONDS}"
            ));
        }

        if self.storage.pvc_name.trim().is_empty() {
            return Err(anyhow::anyhow!("storage.pvcName must not be empty"));
        }

        if !self.storage.data_root.starts_with('/') {
            return Err(anyhow::anyhow!(
                "storage.dataRoot must be an absolute path, got '{}'",
                self.storage.data_root
            ));
        }

        if self.readiness.timeout_seconds == 0 {
            return Err(anyhow::anyhow!(
                "readiness.timeoutSeconds must be greater than zero"
            ));
        }

        Ok(())
    }

    /// Load configuration from mounted ConfigMap file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        serde_yaml::from_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))
    }
}
