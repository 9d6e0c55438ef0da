//! Garbage collector for idle and orphaned worktree resources
//!
//! Five phases run in order. The first two follow activity and cascade from
//! a deployment to everything that belongs to it. The last three catch what
//! partial failures leave behind and only touch resources older than the
//! grace period. Every delete tolerates "already gone", so overlapping runs
//! are harmless.

use crate::error::{Error, Result};
use crate::manager::PodManager;
use crate::naming::{
    self, component_selector, managed_selector, Component, ResourceNaming, LABEL_INSTANCE,
    LABEL_WORKTREE_ID,
};
use crate::reconcile::{is_running, ResourceKind};
use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::{apps::v1::Deployment, core::v1::Pod, networking::v1::Ingress};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, info, instrument, warn};

/// Number of resources reclaimed by each phase of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GcReport {
    pub idle_shell_pods: usize,
    pub orphaned_runtime_pods: usize,
    pub orphaned_deployments: usize,
    pub orphaned_services: usize,
    pub orphaned_ingresses: usize,
}

impl GcReport {
    #[must_use]
    pub fn total(&self) -> usize {
        self.idle_shell_pods
            + self.orphaned_runtime_pods
            + self.orphaned_deployments
            + self.orphaned_services
            + self.orphaned_ingresses
    }
}

/// Strictly older than `limit` at `now`. Unknown times are never expired.
fn expired(now: DateTime<Utc>, at: Option<DateTime<Utc>>, limit: Duration) -> bool {
    at.is_some_and(|at| now.signed_duration_since(at) > limit)
}

/// Pods already being deleted; their deployment is gone or going.
fn terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

fn label<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.labels
        .as_ref()
        .and_then(|labels| labels.get(key))
        .map(String::as_str)
}

fn by_name(deployments: Vec<Deployment>) -> BTreeMap<String, Deployment> {
    deployments
        .into_iter()
        .filter_map(|d| d.metadata.name.clone().map(|name| (name, d)))
        .collect()
}

/// Activity of the deployment behind a pod; the pod's own metadata stands in
/// when the deployment is not visible.
fn pod_activity(
    pod: &Pod,
    deployment: &str,
    deployments: &BTreeMap<String, Deployment>,
) -> Option<DateTime<Utc>> {
    let meta = deployments
        .get(deployment)
        .map_or(&pod.metadata, |d| &d.metadata);
    naming::last_activity(meta)
}

/// Names of every backend service an ingress routes to
fn ingress_backends(ingress: &Ingress) -> BTreeSet<String> {
    let Some(spec) = ingress.spec.as_ref() else {
        return BTreeSet::new();
    };

    let default_backend = spec
        .default_backend
        .as_ref()
        .and_then(|backend| backend.service.as_ref())
        .map(|service| service.name.clone());

    let rule_backends = spec
        .rules
        .iter()
        .flatten()
        .filter_map(|rule| rule.http.as_ref())
        .flat_map(|http| http.paths.iter())
        .filter_map(|path| path.backend.service.as_ref())
        .map(|service| service.name.clone());

    default_backend.into_iter().chain(rule_backends).collect()
}

/// `wt-{short}-podman` -> its service, ingress and app service
fn runtime_companions(deployment: &str) -> Vec<(ResourceKind, String)> {
    let base = deployment.strip_suffix("-podman").unwrap_or(deployment);
    vec![
        (ResourceKind::Service, format!("{base}-podman-svc")),
        (ResourceKind::Ingress, format!("{base}-ingress")),
        (ResourceKind::Service, format!("{base}-app-svc")),
    ]
}

impl PodManager {
    /// Run one sweep against the current time.
    pub async fn run_gc(&self) -> GcReport {
        self.run_gc_at(Utc::now()).await
    }

    /// Run one sweep as if the current time were `now`.
    #[instrument(skip(self))]
    pub async fn run_gc_at(&self, now: DateTime<Utc>) -> GcReport {
        let Ok(config) = self.active_config() else {
            debug!("Pod management disabled, skipping garbage collection");
            return GcReport::default();
        };
        let ns = config.namespace.as_str();

        let report = GcReport {
            idle_shell_pods: self
                .phase_idle_shell_pods(ns, now, config.shell_pod.idle_timeout())
                .await
                .unwrap_or_else(|e| phase_failed("idle shell pods", &e)),
            orphaned_runtime_pods: self
                .phase_orphaned_runtime_pods(ns, now, config.podman_pod.idle_timeout())
                .await
                .unwrap_or_else(|e| phase_failed("orphaned runtime pods", &e)),
            orphaned_deployments: self
                .phase_orphaned_deployments(ns, now, config.gc.grace_period())
                .await
                .unwrap_or_else(|e| phase_failed("orphaned deployments", &e)),
            orphaned_services: self
                .phase_orphaned_services(ns, now, config.gc.grace_period())
                .await
                .unwrap_or_else(|e| phase_failed("orphaned services", &e)),
            orphaned_ingresses: self
                .phase_orphaned_ingresses(ns, now, config.gc.grace_period())
                .await
                .unwrap_or_else(|e| phase_failed("orphaned ingresses", &e)),
        };

        if report.total() > 0 {
            info!(
                total = report.total(),
                idle_shell_pods = report.idle_shell_pods,
                orphaned_runtime_pods = report.orphaned_runtime_pods,
                orphaned_deployments = report.orphaned_deployments,
                orphaned_services = report.orphaned_services,
                orphaned_ingresses = report.orphaned_ingresses,
                "🧹 Garbage collection reclaimed resources"
            );
        }

        report
    }

    async fn list_pods_of(&self, ns: &str, component: Component) -> Result<Vec<Pod>> {
        self.cluster
            .list_pods(ns, &component_selector(component))
            .await
            .map_err(|e| Error::api(format!("{component} pods"), e))
    }

    async fn list_deployments_of(&self, ns: &str, selector: &str) -> Result<Vec<Deployment>> {
        self.cluster
            .list_deployments(ns, selector)
            .await
            .map_err(|e| Error::api("deployments", e))
    }

    /// Phase 1: shell deployments idle past the shell timeout, with their SSH service.
    async fn phase_idle_shell_pods(
        &self,
        ns: &str,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<usize> {
        let pods = self.list_pods_of(ns, Component::Terminal).await?;
        let deployments = by_name(
            self.list_deployments_of(ns, &component_selector(Component::Terminal))
                .await?,
        );

        let mut seen = HashSet::new();
        let mut reclaimed = 0;
        for pod in pods.iter().filter(|pod| !terminating(pod)) {
            let Some(deployment) = ResourceNaming::deployment_for_pod(&pod.metadata) else {
                continue;
            };
            if !seen.insert(deployment.clone()) {
                continue;
            }
            if !expired(now, pod_activity(pod, &deployment, &deployments), timeout) {
                continue;
            }

            info!(deployment = %deployment, "Reclaiming idle shell pod");
            let targets = [
                (ResourceKind::Deployment, deployment.clone()),
                (ResourceKind::Service, format!("{deployment}-ssh")),
            ];
            match self.delete_all(ns, &targets).await {
                Ok(()) => reclaimed += 1,
                Err(e) => warn!(deployment = %deployment, error = %e, "Failed to reclaim shell pod"),
            }
        }
        Ok(reclaimed)
    }

    /// Phase 2: runtime pods of worktrees with no running shell, idle past the
    /// runtime timeout, together with their services and ingress.
    async fn phase_orphaned_runtime_pods(
        &self,
        ns: &str,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<usize> {
        let active_worktrees: HashSet<String> = self
            .list_pods_of(ns, Component::Terminal)
            .await?
            .iter()
            .filter(|pod| is_running(pod))
            .filter_map(|pod| label(&pod.metadata, LABEL_WORKTREE_ID).map(str::to_string))
            .collect();

        let pods = self.list_pods_of(ns, Component::ContainerRuntime).await?;
        let deployments = by_name(
            self.list_deployments_of(ns, &component_selector(Component::ContainerRuntime))
                .await?,
        );

        let mut seen = HashSet::new();
        let mut reclaimed = 0;
        for pod in pods.iter().filter(|pod| !terminating(pod)) {
            if label(&pod.metadata, LABEL_WORKTREE_ID)
                .is_some_and(|worktree| active_worktrees.contains(worktree))
            {
                continue;
            }
            let Some(deployment) = ResourceNaming::deployment_for_pod(&pod.metadata) else {
                continue;
            };
            if !seen.insert(deployment.clone()) {
                continue;
            }
            if !expired(now, pod_activity(pod, &deployment, &deployments), timeout) {
                continue;
            }

            info!(deployment = %deployment, "Reclaiming orphaned container runtime");
            let mut targets = vec![(ResourceKind::Deployment, deployment.clone())];
            targets.extend(runtime_companions(&deployment));
            match self.delete_all(ns, &targets).await {
                Ok(()) => reclaimed += 1,
                Err(e) => {
                    warn!(deployment = %deployment, error = %e, "Failed to reclaim runtime pod");
                }
            }
        }
        Ok(reclaimed)
    }

    /// Phase 3: managed deployments with no pod at all, past the grace period.
    async fn phase_orphaned_deployments(
        &self,
        ns: &str,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<usize> {
        let deployments = self.list_deployments_of(ns, &managed_selector()).await?;
        let pods = self
            .cluster
            .list_pods(ns, &managed_selector())
            .await
            .map_err(|e| Error::api("managed pods", e))?;

        let owners: HashSet<String> = pods
            .iter()
            .filter_map(|pod| ResourceNaming::deployment_for_pod(&pod.metadata))
            .collect();

        let mut reclaimed = 0;
        for deployment in &deployments {
            let Some(name) = deployment.metadata.name.as_deref() else {
                continue;
            };
            if owners.contains(name)
                || !expired(now, naming::created_at(&deployment.metadata), grace)
            {
                continue;
            }

            info!(deployment = %name, "Deleting deployment with no pods");
            match self.delete_resource(ns, ResourceKind::Deployment, name).await {
                Ok(()) => reclaimed += 1,
                Err(e) => warn!(deployment = %name, error = %e, "Failed to delete deployment"),
            }
        }
        Ok(reclaimed)
    }

    /// Phase 4: managed services whose worktree has no deployment left, or
    /// whose own deployment is gone, past the grace period.
    async fn phase_orphaned_services(
        &self,
        ns: &str,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<usize> {
        let deployments = self.list_deployments_of(ns, &managed_selector()).await?;
        let live_deployments: HashSet<&str> = deployments
            .iter()
            .filter_map(|d| d.metadata.name.as_deref())
            .collect();
        let live_worktrees: HashSet<&str> = deployments
            .iter()
            .filter_map(|d| label(&d.metadata, LABEL_WORKTREE_ID))
            .collect();

        let services = self
            .cluster
            .list_services(ns, &managed_selector())
            .await
            .map_err(|e| Error::api("services", e))?;

        let mut reclaimed = 0;
        for service in &services {
            let Some(name) = service.metadata.name.as_deref() else {
                continue;
            };
            let worktree_gone = label(&service.metadata, LABEL_WORKTREE_ID)
                .is_some_and(|worktree| !live_worktrees.contains(worktree));
            let owner_gone = label(&service.metadata, LABEL_INSTANCE)
                .is_some_and(|owner| !live_deployments.contains(owner));
            if !(worktree_gone || owner_gone)
                || !expired(now, naming::created_at(&service.metadata), grace)
            {
                continue;
            }

            info!(service = %name, "Deleting orphaned service");
            match self.delete_resource(ns, ResourceKind::Service, name).await {
                Ok(()) => reclaimed += 1,
                Err(e) => warn!(service = %name, error = %e, "Failed to delete service"),
            }
        }
        Ok(reclaimed)
    }

    /// Phase 5: managed ingresses routing only to services that no longer
    /// exist, past the grace period.
    async fn phase_orphaned_ingresses(
        &self,
        ns: &str,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<usize> {
        let services: HashSet<String> = self
            .cluster
            .list_services(ns, &managed_selector())
            .await
            .map_err(|e| Error::api("services", e))?
            .into_iter()
            .filter_map(|service| service.metadata.name)
            .collect();

        let ingresses = self
            .cluster
            .list_ingresses(ns, &managed_selector())
            .await
            .map_err(|e| Error::api("ingresses", e))?;

        let mut reclaimed = 0;
        for ingress in &ingresses {
            let Some(name) = ingress.metadata.name.as_deref() else {
                continue;
            };
            let routed = ingress_backends(ingress)
                .iter()
                .any(|backend| services.contains(backend));
            if routed || !expired(now, naming::created_at(&ingress.metadata), grace) {
                continue;
            }

            info!(ingress = %name, "Deleting orphaned ingress");
            match self.delete_resource(ns, ResourceKind::Ingress, name).await {
                Ok(()) => reclaimed += 1,
                Err(e) => warn!(ingress = %name, error = %e, "Failed to delete ingress"),
            }
        }
        Ok(reclaimed)
    }
}

fn phase_failed(phase: &str, error: &Error) -> usize {
    warn!(phase, error = %error, "Garbage collection phase skipped");
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PodManagerConfig;
    use crate::manifests;
    use crate::reconcile::ShellPodRequest;
    use crate::test_utils::{api_error, FakeCluster};
    use chrono::TimeZone;
    use std::sync::Arc;

    fn setup() -> (Arc<FakeCluster>, PodManager, PodManagerConfig) {
        let cluster = Arc::new(FakeCluster::new());
        let config = PodManagerConfig::default();
        let manager = PodManager::new(cluster.clone(), config.clone()).unwrap();
        (cluster, manager, config)
    }

    fn shell_request(worktree: &str, user: &str) -> ShellPodRequest {
        ShellPodRequest::new(worktree, "feature", user, format!("/data/{worktree}"))
    }

    /// Runtime deployment, its pod and its service, all stamped at `at`
    fn seed_runtime(
        cluster: &FakeCluster,
        config: &PodManagerConfig,
        worktree: &str,
        at: DateTime<Utc>,
    ) {
        let path = format!("/data/{worktree}");
        cluster.insert_ready_deployment(
            manifests::podman_deployment(config, worktree, &path, at).unwrap(),
        );
        cluster.insert_service(manifests::podman_service(worktree, at).unwrap());
    }

    /// Shell deployment, its pod and its SSH service, all stamped at `at`
    fn seed_shell(
        cluster: &FakeCluster,
        config: &PodManagerConfig,
        worktree: &str,
        user: &str,
        at: DateTime<Utc>,
    ) -> String {
        let request = shell_request(worktree, user);
        cluster.insert_service(manifests::shell_ssh_service(&request, at).unwrap());
        cluster.insert_ready_deployment(
            manifests::shell_deployment(config, &request, at).unwrap(),
        )
    }

    #[tokio::test]
    async fn healthy_cluster_reclaims_nothing() {
        let (cluster, manager, config) = setup();
        let now = Utc::now();
        seed_runtime(&cluster, &config, "wt1", now);
        seed_shell(&cluster, &config, "wt1", "u1", now);

        let report = manager.run_gc_at(now + Duration::minutes(10)).await;

        assert_eq!(report, GcReport::default());
        assert_eq!(report.total(), 0);
        assert!(cluster.deleted_names().is_empty());
    }

    #[tokio::test]
    async fn idle_threshold_is_strict() {
        let (cluster, manager, config) = setup();
        // Annotations keep millisecond precision, so pin the clock to a whole second
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let timeout = config.shell_pod.idle_timeout();
        seed_runtime(&cluster, &config, "wt1", now);
        seed_shell(&cluster, &config, "wt1", "exact", now - timeout);
        seed_shell(
            &cluster,
            &config,
            "wt1",
            "under",
            now - timeout + Duration::milliseconds(1),
        );
        seed_shell(
            &cluster,
            &config,
            "wt1",
            "over",
            now - timeout - Duration::milliseconds(1),
        );

        let report = manager.run_gc_at(now).await;

        assert_eq!(report.idle_shell_pods, 1);
        assert!(cluster.deployment("wt-wt1-shell-exact").is_some());
        assert!(cluster.deployment("wt-wt1-shell-under").is_some());
        assert!(cluster.deployment("wt-wt1-shell-over").is_none());
        assert!(cluster.service("wt-wt1-shell-over-ssh").is_none());
        assert!(cluster.service("wt-wt1-shell-exact-ssh").is_some());
    }

    #[tokio::test]
    async fn idle_shell_is_reclaimed_and_recreated_on_demand() {
        let (cluster, manager, config) = setup();
        let started = Utc::now() - Duration::minutes(45);
        seed_runtime(&cluster, &config, "wt1", started);
        seed_shell(&cluster, &config, "wt1", "u1", started);

        let report = manager.run_gc().await;
        assert_eq!(report.idle_shell_pods, 1);
        assert_eq!(report.orphaned_runtime_pods, 0);
        assert!(cluster.deployment("wt-wt1-shell-u1").is_none());
        assert!(cluster.deployment("wt-wt1-podman").is_some());

        let pod = manager
            .ensure_shell_pod(&shell_request("wt1", "u1"))
            .await
            .unwrap();
        assert!(pod.starts_with("wt-wt1-shell-u1-"));
        assert_eq!(cluster.created("Deployment"), vec!["wt-wt1-shell-u1"]);
    }

    #[tokio::test]
    async fn fresh_activity_overrides_old_creation() {
        let (cluster, manager, config) = setup();
        let started = Utc::now() - Duration::hours(3);
        seed_runtime(&cluster, &config, "wt1", started);
        seed_shell(&cluster, &config, "wt1", "u1", started);

        let pod = cluster.pods_of("wt-wt1-shell-u1").remove(0);
        manager.update_last_activity(&pod).await.unwrap();
        let report = manager.run_gc().await;

        assert_eq!(report.idle_shell_pods, 0);
        assert!(cluster.deployment("wt-wt1-shell-u1").is_some());
    }

    #[tokio::test]
    async fn running_shell_protects_idle_runtime() {
        let (cluster, manager, config) = setup();
        let now = Utc::now();
        seed_runtime(&cluster, &config, "wt1", now - Duration::hours(2));
        seed_shell(&cluster, &config, "wt1", "u1", now);

        let report = manager.run_gc_at(now).await;

        assert_eq!(report.orphaned_runtime_pods, 0);
        assert!(cluster.deployment("wt-wt1-podman").is_some());
    }

    #[tokio::test]
    async fn terminating_shell_does_not_protect_runtime() {
        let (cluster, manager, config) = setup();
        let now = Utc::now();
        seed_runtime(&cluster, &config, "wt1", now - Duration::hours(2));
        let shell_pod = seed_shell(&cluster, &config, "wt1", "u1", now);
        cluster.mark_pod_terminating(&shell_pod);

        let report = manager.run_gc_at(now).await;

        assert_eq!(report.orphaned_runtime_pods, 1);
        assert!(cluster.deployment("wt-wt1-podman").is_none());
    }

    #[tokio::test]
    async fn orphaned_runtime_cascades_to_exposure() {
        let (cluster, manager, config) = setup();
        let started = Utc::now() - Duration::hours(2);
        seed_runtime(&cluster, &config, "wt1", started);
        cluster.insert_service(manifests::app_service("wt1", 3000, started).unwrap());
        cluster.insert_ingress(
            manifests::worktree_ingress(&config, "wt1", "app-wt1.example.com", 3000, started)
                .unwrap(),
        );

        let report = manager.run_gc().await;

        assert_eq!(report.orphaned_runtime_pods, 1);
        assert_eq!(report.total(), 1);
        for name in ["wt-wt1-podman-svc", "wt-wt1-app-svc"] {
            assert!(cluster.service(name).is_none(), "{name} left behind");
        }
        assert!(cluster.ingress("wt-wt1-ingress").is_none());
    }

    #[tokio::test]
    async fn podless_deployment_respects_grace_period() {
        let (cluster, manager, config) = setup();
        let now = Utc::now();
        let grace = config.gc.grace_period();
        let old = now - grace - Duration::seconds(1);
        let young = now - Duration::seconds(30);
        cluster.insert_deployment(
            manifests::podman_deployment(&config, "old", "/data/old", old).unwrap(),
        );
        cluster.insert_deployment(
            manifests::podman_deployment(&config, "young", "/data/young", young).unwrap(),
        );

        let report = manager.run_gc_at(now).await;

        assert_eq!(report.orphaned_deployments, 1);
        assert!(cluster.deployment("wt-old-podman").is_none());
        assert!(cluster.deployment("wt-young-podman").is_some());
    }

    #[tokio::test]
    async fn podless_deployment_is_not_shadowed_by_longer_name() {
        let (cluster, manager, config) = setup();
        let now = Utc::now();
        let old = now - Duration::hours(2);
        cluster.insert_deployment(
            manifests::shell_deployment(&config, &shell_request("wt1", "u1"), old).unwrap(),
        );
        seed_runtime(&cluster, &config, "wt1", now);
        seed_shell(&cluster, &config, "wt1", "u1-admin", now);

        let report = manager.run_gc_at(now).await;

        assert_eq!(report.orphaned_deployments, 1);
        assert!(cluster.deployment("wt-wt1-shell-u1").is_none());
        assert!(cluster.deployment("wt-wt1-shell-u1-admin").is_some());
    }

    #[tokio::test]
    async fn rollout_pods_reclaim_their_deployment_once() {
        let (cluster, manager, config) = setup();
        let started = Utc::now() - Duration::hours(2);
        seed_runtime(&cluster, &config, "wt1", started);
        seed_shell(&cluster, &config, "wt1", "u1", started);
        assert!(cluster.spawn_extra_pod("wt-wt1-shell-u1").is_some());
        assert!(cluster.spawn_extra_pod("wt-wt1-podman").is_some());

        let report = manager.run_gc().await;

        assert_eq!(report.idle_shell_pods, 1);
        assert_eq!(report.orphaned_runtime_pods, 1);
        for deployment in ["wt-wt1-shell-u1", "wt-wt1-podman"] {
            let deletes = cluster
                .deleted_names()
                .iter()
                .filter(|call| **call == format!("Deployment {deployment}"))
                .count();
            assert_eq!(deletes, 1, "{deployment}");
        }
    }

    #[tokio::test]
    async fn terminating_pods_are_not_reclaimed_again() {
        let (cluster, manager, config) = setup();
        let started = Utc::now() - Duration::hours(2);
        let shell_pod = seed_shell(&cluster, &config, "wt1", "u1", started);
        cluster.mark_pod_terminating(&shell_pod);
        cluster.forget_deployment("wt-wt1-shell-u1");

        let report = manager.run_gc().await;

        assert_eq!(report.idle_shell_pods, 0);
        assert!(!cluster
            .deleted_names()
            .contains(&"Deployment wt-wt1-shell-u1".to_string()));
    }

    #[tokio::test]
    async fn orphaned_services_and_ingresses_are_swept() {
        let (cluster, manager, config) = setup();
        let now = Utc::now();
        let old = now - Duration::minutes(10);

        // Left behind by a crash between deployment delete and service delete
        cluster.insert_service(manifests::podman_service("gone", old).unwrap());
        cluster.insert_service(manifests::app_service("gone", 8080, old).unwrap());
        cluster.insert_ingress(
            manifests::worktree_ingress(&config, "gone", "gone.example.com", 8080, old).unwrap(),
        );
        // Too young to judge
        cluster.insert_service(manifests::podman_service("new", now).unwrap());

        let report = manager.run_gc_at(now).await;

        assert_eq!(report.orphaned_services, 2);
        assert_eq!(report.orphaned_ingresses, 1);
        assert!(cluster.service("wt-new-podman-svc").is_some());
        assert!(cluster.ingress("wt-gone-ingress").is_none());
    }

    #[tokio::test]
    async fn stale_ssh_service_is_swept_while_runtime_lives() {
        let (cluster, manager, config) = setup();
        let now = Utc::now();
        seed_runtime(&cluster, &config, "wt1", now);
        cluster.insert_service(
            manifests::shell_ssh_service(&shell_request("wt1", "u1"), now - Duration::hours(1))
                .unwrap(),
        );

        let report = manager.run_gc_at(now).await;

        assert_eq!(report.orphaned_services, 1);
        assert!(cluster.service("wt-wt1-shell-u1-ssh").is_none());
        assert!(cluster.service("wt-wt1-podman-svc").is_some());
    }

    #[tokio::test]
    async fn listing_failure_skips_only_that_phase() {
        let (cluster, manager, config) = setup();
        let started = Utc::now() - Duration::hours(2);
        seed_shell(&cluster, &config, "wt1", "u1", started);
        cluster.fail_next_list("Service", api_error(500));

        let report = manager.run_gc().await;

        assert_eq!(report.idle_shell_pods, 1);
        assert_eq!(report.orphaned_services, 0);
    }

    #[tokio::test]
    async fn repeated_sweeps_are_idempotent() {
        let (cluster, manager, config) = setup();
        let started = Utc::now() - Duration::hours(2);
        seed_runtime(&cluster, &config, "wt1", started);
        seed_shell(&cluster, &config, "wt1", "u1", started);

        let first = manager.run_gc().await;
        let second = manager.run_gc().await;

        assert_eq!(first.idle_shell_pods, 1);
        assert_eq!(first.orphaned_runtime_pods, 1);
        assert_eq!(second.total(), 0);
    }

    #[tokio::test]
    async fn disabled_gc_touches_nothing() {
        let cluster = Arc::new(FakeCluster::new());
        let mut config = PodManagerConfig::default();
        config.enabled = false;
        seed_shell(&cluster, &config, "wt1", "u1", Utc::now() - Duration::days(1));
        let manager = PodManager::new(cluster.clone(), config).unwrap();

        let report = manager.run_gc().await;

        assert_eq!(report, GcReport::default());
        assert!(cluster.deleted_names().is_empty());
    }

    #[test]
    fn ingress_backends_cover_rules_and_default() {
        let config = PodManagerConfig::default();
        let mut ingress =
            manifests::worktree_ingress(&config, "wt1", "h.example.com", 80, Utc::now()).unwrap();
        assert_eq!(
            ingress_backends(&ingress).into_iter().collect::<Vec<_>>(),
            vec!["wt-wt1-app-svc".to_string()]
        );

        ingress.spec = None;
        assert!(ingress_backends(&ingress).is_empty());
    }
}
