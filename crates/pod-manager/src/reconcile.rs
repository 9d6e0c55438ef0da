//! Reconciler: the "ensure" operations
//!
//! Each ensure call reads the current state, then creates, waits or returns.
//! Nothing is locked; concurrent callers race at the API server and the 409
//! answer decides. Conflicts are absorbed only for upserted kinds (secrets,
//! services, ingresses); a conflicting deployment create is surfaced.

use crate::error::{self, Error, Result};
use crate::manager::PodManager;
use crate::manifests;
use crate::naming::{self, instance_selector, Component, ResourceNaming};
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Pod, Service},
};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Everything needed to provision a shell pod for one user in one worktree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellPodRequest {
    pub worktree_id: String,
    pub worktree_name: String,
    pub user_id: String,
    /// Absolute path of the worktree checkout on the shared volume
    pub worktree_path: String,
    pub unix_uid: Option<u32>,
    pub unix_username: Option<String>,
    /// Already-resolved API keys, injected through the user's secret
    pub api_keys: Option<BTreeMap<String, String>>,
}

impl ShellPodRequest {
    pub fn new(
        worktree_id: impl Into<String>,
        worktree_name: impl Into<String>,
        user_id: impl Into<String>,
        worktree_path: impl Into<String>,
    ) -> Self {
        Self {
            worktree_id: worktree_id.into(),
            worktree_name: worktree_name.into(),
            user_id: user_id.into(),
            worktree_path: worktree_path.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_unix_user(mut self, uid: Option<u32>, username: Option<String>) -> Self {
        self.unix_uid = uid;
        self.unix_username = username;
        self
    }

    #[must_use]
    pub fn with_api_keys(mut self, api_keys: BTreeMap<String, String>) -> Self {
        self.api_keys = Some(api_keys);
        self
    }
}

/// Where a deployment is in its rollout
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutState {
    /// At least one ready replica
    Ready,
    /// Not ready yet, nothing has failed
    Progressing,
    /// The controller reported `ReplicaFailure`
    Failed(String),
}

#[must_use]
pub fn rollout_state(deployment: &Deployment) -> RolloutState {
    let Some(status) = deployment.status.as_ref() else {
        return RolloutState::Progressing;
    };

    if status.ready_replicas.unwrap_or(0) >= 1 {
        return RolloutState::Ready;
    }

    let failure = status.conditions.as_ref().and_then(|conditions| {
        conditions
            .iter()
            .find(|c| c.type_ == "ReplicaFailure" && c.status == "True")
    });

    match failure {
        Some(condition) => RolloutState::Failed(
            condition
                .message
                .clone()
                .or_else(|| condition.reason.clone())
                .unwrap_or_else(|| "ReplicaFailure".to_string()),
        ),
        None => RolloutState::Progressing,
    }
}

/// Running and not on its way out
pub(crate) fn is_running(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_none()
        && pod
            .status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            == Some("Running")
}

/// Resource kinds the manager deletes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResourceKind {
    Deployment,
    Service,
    Ingress,
}

impl PodManager {
    /// Return the name of a running shell pod for the (worktree, user) pair,
    /// creating the worktree's runtime pod and the shell pod as needed.
    #[instrument(
        skip(self, request),
        fields(worktree_id = %request.worktree_id, user_id = %request.user_id)
    )]
    pub async fn ensure_shell_pod(&self, request: &ShellPodRequest) -> Result<String> {
        let config = self.active_config()?;
        let ns = config.namespace.as_str();

        // The runtime pod is an ordering dependency, not just a sibling
        self.ensure_podman_pod(&request.worktree_id, &request.worktree_path)
            .await?;

        if let Some(keys) = request.api_keys.as_ref().filter(|keys| !keys.is_empty()) {
            self.upsert_user_secret(&request.user_id, keys).await?;
        }

        let name = ResourceNaming::shell_deployment(&request.worktree_id, &request.user_id);

        match self.cluster.get_deployment(ns, &name).await {
            Ok(existing) => {
                if rollout_state(&existing) == RolloutState::Ready {
                    self.touch_deployment(ns, &name).await?;
                } else {
                    info!(deployment = %name, "Shell deployment exists but is not ready, waiting");
                    self.wait_for_ready(ns, &name, config.readiness.timeout())
                        .await?;
                }
                self.ensure_service_present(ns, manifests::shell_ssh_service(request, Utc::now())?)
                    .await?;
            }
            Err(e) if error::is_not_found(&e) => {
                info!(deployment = %name, "🚀 Creating shell deployment");
                let deployment = manifests::shell_deployment(&config, request, Utc::now())?;
                self.cluster
                    .create_deployment(ns, &deployment)
                    .await
                    .map_err(|e| Error::api(&name, e))?;
                self.upsert_service(ns, manifests::shell_ssh_service(request, Utc::now())?)
                    .await?;
                self.wait_for_ready(ns, &name, config.readiness.timeout())
                    .await?;
                info!(deployment = %name, "✅ Shell deployment ready");
            }
            Err(e) => return Err(Error::api(&name, e)),
        }

        self.resolve_running_pod(ns, Component::Terminal, &name)
            .await
    }

    /// Ensure the worktree's shared container runtime is ready and return its
    /// deployment name.
    #[instrument(skip(self, worktree_path))]
    pub async fn ensure_podman_pod(&self, worktree_id: &str, worktree_path: &str) -> Result<String> {
        let config = self.active_config()?;
        let ns = config.namespace.as_str();
        let name = ResourceNaming::podman_deployment(worktree_id);

        match self.cluster.get_deployment(ns, &name).await {
            Ok(existing) => {
                if rollout_state(&existing) == RolloutState::Ready {
                    self.touch_deployment(ns, &name).await?;
                } else {
                    info!(deployment = %name, "Runtime deployment exists but is not ready, waiting");
                    self.wait_for_ready(ns, &name, config.readiness.timeout())
                        .await?;
                }
                self.ensure_service_present(ns, manifests::podman_service(worktree_id, Utc::now())?)
                    .await?;
            }
            Err(e) if error::is_not_found(&e) => {
                info!(deployment = %name, "🚀 Creating container runtime deployment");
                let deployment =
                    manifests::podman_deployment(&config, worktree_id, worktree_path, Utc::now())?;
                self.cluster
                    .create_deployment(ns, &deployment)
                    .await
                    .map_err(|e| Error::api(&name, e))?;
                self.upsert_service(ns, manifests::podman_service(worktree_id, Utc::now())?)
                    .await?;
                self.wait_for_ready(ns, &name, config.readiness.timeout())
                    .await?;
                info!(deployment = %name, "✅ Container runtime ready");
            }
            Err(e) => return Err(Error::api(&name, e)),
        }

        Ok(name)
    }

    /// Tear down a user's shell pod and its SSH service.
    #[instrument(skip(self))]
    pub async fn delete_shell_pod(&self, worktree_id: &str, user_id: &str) -> Result<()> {
        let config = self.active_config()?;
        info!("Deleting shell pod");
        self.delete_all(
            &config.namespace,
            &[
                (
                    ResourceKind::Deployment,
                    ResourceNaming::shell_deployment(worktree_id, user_id),
                ),
                (
                    ResourceKind::Service,
                    ResourceNaming::shell_ssh_service(worktree_id, user_id),
                ),
            ],
        )
        .await
    }

    /// Tear down a worktree's runtime pod together with everything that
    /// routes to it.
    #[instrument(skip(self))]
    pub async fn delete_podman_pod(&self, worktree_id: &str) -> Result<()> {
        let config = self.active_config()?;
        info!("Deleting container runtime pod");
        self.delete_all(&config.namespace, &podman_resources(worktree_id))
            .await
    }

    /// Record activity for the deployment that owns `pod_name`.
    #[instrument(skip(self))]
    pub async fn update_last_activity(&self, pod_name: &str) -> Result<()> {
        let config = self.active_config()?;
        let ns = config.namespace.as_str();

        let pod = self
            .cluster
            .get_pod(ns, pod_name)
            .await
            .map_err(|e| Error::api(pod_name, e))?;

        let deployment = ResourceNaming::deployment_for_pod(&pod.metadata).ok_or_else(|| {
            Error::InvalidArgument(format!("Pod {pod_name} is not owned by a managed deployment"))
        })?;

        self.touch_deployment(ns, &deployment).await
    }

    /// Create the user's API key secret, or replace its values if it exists.
    #[instrument(skip(self, api_keys), fields(keys = api_keys.len()))]
    pub async fn upsert_user_secret(
        &self,
        user_id: &str,
        api_keys: &BTreeMap<String, String>,
    ) -> Result<()> {
        let config = self.active_config()?;
        let ns = config.namespace.as_str();
        let mut secret = manifests::user_secret(user_id, api_keys)?;
        let name = ResourceNaming::user_secret(user_id);

        match self.cluster.create_secret(ns, &secret).await {
            Ok(_) => {
                info!(secret = %name, "Created user secret");
                Ok(())
            }
            Err(e) if error::is_conflict(&e) => {
                let existing = self
                    .cluster
                    .get_secret(ns, &name)
                    .await
                    .map_err(|e| Error::api(&name, e))?;
                secret.metadata.resource_version = existing.metadata.resource_version;
                self.cluster
                    .replace_secret(ns, &name, &secret)
                    .await
                    .map_err(|e| Error::api(&name, e))?;
                debug!(secret = %name, "Replaced user secret");
                Ok(())
            }
            Err(e) => Err(Error::api(&name, e)),
        }
    }

    /// Stamp `last-activity` on a deployment's own metadata.
    pub(crate) async fn touch_deployment(&self, ns: &str, name: &str) -> Result<()> {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            naming::ANNOTATION_LAST_ACTIVITY.to_string(),
            naming::format_timestamp(Utc::now()),
        );
        self.cluster
            .annotate_deployment(ns, name, &annotations)
            .await
            .map_err(|e| Error::api(name, e))?;
        debug!(deployment = %name, "Updated last activity");
        Ok(())
    }

    /// Block until the deployment has a ready replica, reports a replica
    /// failure, or the timeout expires.
    pub(crate) async fn wait_for_ready(&self, ns: &str, name: &str, timeout: Duration) -> Result<()> {
        let mut events = self.cluster.watch_deployment(ns, name);

        let observed = tokio::time::timeout(timeout, async {
            while let Some(event) = events.next().await {
                match event {
                    Ok(Some(deployment)) => match rollout_state(&deployment) {
                        RolloutState::Ready => return Ok(()),
                        RolloutState::Failed(message) => {
                            return Err(Error::ReplicaFailure {
                                deployment: name.to_string(),
                                message,
                            })
                        }
                        RolloutState::Progressing => {
                            debug!(deployment = %name, "Deployment not ready yet");
                        }
                    },
                    Ok(None) => debug!(deployment = %name, "Deployment not visible yet"),
                    Err(e) => warn!(deployment = %name, error = %e, "Watch error, retrying"),
                }
            }
            Err(Error::Watch {
                resource: name.to_string(),
                message: "watch stream ended".to_string(),
            })
        })
        .await;

        observed.unwrap_or_else(|_| {
            Err(Error::ReadinessTimeout {
                deployment: name.to_string(),
                timeout,
            })
        })
    }

    /// Name of the running pod behind a deployment.
    pub(crate) async fn resolve_running_pod(
        &self,
        ns: &str,
        component: Component,
        deployment: &str,
    ) -> Result<String> {
        let pods = self
            .cluster
            .list_pods(ns, &instance_selector(component, deployment))
            .await
            .map_err(|e| Error::api(deployment, e))?;

        let prefix = format!("{deployment}-");
        pods.into_iter()
            .filter(is_running)
            .filter_map(|pod| pod.metadata.name)
            .find(|name| name.starts_with(&prefix))
            .ok_or_else(|| Error::PodNotFound {
                deployment: deployment.to_string(),
            })
    }

    /// Create a service; on conflict replace it in place.
    pub(crate) async fn upsert_service(&self, ns: &str, mut service: Service) -> Result<()> {
        let name = service.metadata.name.clone().unwrap_or_default();

        match self.cluster.create_service(ns, &service).await {
            Ok(_) => {
                info!(service = %name, "Created service");
                Ok(())
            }
            Err(e) if error::is_conflict(&e) => {
                // Preserve resourceVersion and the allocated clusterIP
                let existing = self
                    .cluster
                    .get_service(ns, &name)
                    .await
                    .map_err(|e| Error::api(&name, e))?;
                service.metadata.resource_version = existing.metadata.resource_version;
                if let (Some(spec), Some(existing_spec)) = (service.spec.as_mut(), existing.spec) {
                    spec.cluster_ip = existing_spec.cluster_ip;
                    spec.cluster_ips = existing_spec.cluster_ips;
                }
                self.cluster
                    .replace_service(ns, &name, &service)
                    .await
                    .map_err(|e| Error::api(&name, e))?;
                info!(service = %name, "🔄 Replaced service");
                Ok(())
            }
            Err(e) => Err(Error::api(&name, e)),
        }
    }

    /// Create a companion service only if it is missing.
    async fn ensure_service_present(&self, ns: &str, service: Service) -> Result<()> {
        let name = service.metadata.name.clone().unwrap_or_default();

        match self.cluster.get_service(ns, &name).await {
            Ok(_) => Ok(()),
            Err(e) if error::is_not_found(&e) => {
                warn!(service = %name, "Companion service missing, recreating");
                self.upsert_service(ns, service).await
            }
            Err(e) => Err(Error::api(&name, e)),
        }
    }

    /// Delete one resource; already gone counts as success.
    pub(crate) async fn delete_resource(
        &self,
        ns: &str,
        kind: ResourceKind,
        name: &str,
    ) -> Result<()> {
        let result = match kind {
            ResourceKind::Deployment => self.cluster.delete_deployment(ns, name).await,
            ResourceKind::Service => self.cluster.delete_service(ns, name).await,
            ResourceKind::Ingress => self.cluster.delete_ingress(ns, name).await,
        };
        error::ignore_not_found(result).map_err(|e| Error::api(name, e))?;
        debug!(?kind, name = %name, "Deleted resource");
        Ok(())
    }

    /// Delete every target, attempting all of them; returns the first failure.
    pub(crate) async fn delete_all(
        &self,
        ns: &str,
        targets: &[(ResourceKind, String)],
    ) -> Result<()> {
        let mut first_error = None;
        for (kind, name) in targets {
            if let Err(e) = self.delete_resource(ns, *kind, name).await {
                warn!(?kind, name = %name, error = %e, "Failed to delete resource");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Everything that belongs to a worktree's runtime pod, deployment first.
fn podman_resources(worktree_id: &str) -> Vec<(ResourceKind, String)> {
    vec![
        (
            ResourceKind::Deployment,
            ResourceNaming::podman_deployment(worktree_id),
        ),
        (
            ResourceKind::Service,
            ResourceNaming::podman_service(worktree_id),
        ),
        (
            ResourceKind::Ingress,
            ResourceNaming::ingress(worktree_id),
        ),
        (
            ResourceKind::Service,
            ResourceNaming::app_service(worktree_id),
        ),
    ]
}
