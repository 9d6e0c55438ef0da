//! Remote API client
//!
//! `ClusterApi` is the only way the manager talks to the orchestration
//! platform. `KubeCluster` implements it with `kube`; tests swap in an
//! in-memory fake.

use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Pod, Secret, Service},
    networking::v1::Ingress,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource};
use serde_json::json;
use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

/// Captured result of a one-shot command run inside a pod
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Namespaced CRUD over the resource kinds the manager owns.
///
/// CRUD calls return the raw `kube::Error` so callers can branch on the
/// status code (404/409) before attaching resource context.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_deployment(&self, namespace: &str, name: &str) -> kube::Result<Deployment>;
    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> kube::Result<Deployment>;
    async fn delete_deployment(&self, namespace: &str, name: &str) -> kube::Result<()>;
    async fn list_deployments(
        &self,
        namespace: &str,
        selector: &str,
    ) -> kube::Result<Vec<Deployment>>;
    /// Merge annotations into the deployment's own metadata. Never touches
    /// the pod template, so it cannot trigger a rollout.
    async fn annotate_deployment(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> kube::Result<()>;
    /// Stream of observed states of one deployment (`None` while absent).
    fn watch_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> BoxStream<'static, Result<Option<Deployment>>>;

    async fn get_pod(&self, namespace: &str, name: &str) -> kube::Result<Pod>;
    async fn list_pods(&self, namespace: &str, selector: &str) -> kube::Result<Vec<Pod>>;
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput>;

    async fn get_service(&self, namespace: &str, name: &str) -> kube::Result<Service>;
    async fn create_service(&self, namespace: &str, service: &Service) -> kube::Result<Service>;
    async fn replace_service(
        &self,
        namespace: &str,
        name: &str,
        service: &Service,
    ) -> kube::Result<Service>;
    async fn delete_service(&self, namespace: &str, name: &str) -> kube::Result<()>;
    async fn list_services(&self, namespace: &str, selector: &str) -> kube::Result<Vec<Service>>;

    async fn get_ingress(&self, namespace: &str, name: &str) -> kube::Result<Ingress>;
    async fn create_ingress(&self, namespace: &str, ingress: &Ingress) -> kube::Result<Ingress>;
    async fn replace_ingress(
        &self,
        namespace: &str,
        name: &str,
        ingress: &Ingress,
    ) -> kube::Result<Ingress>;
    async fn delete_ingress(&self, namespace: &str, name: &str) -> kube::Result<()>;
    async fn list_ingresses(&self, namespace: &str, selector: &str)
        -> kube::Result<Vec<Ingress>>;

    async fn get_secret(&self, namespace: &str, name: &str) -> kube::Result<Secret>;
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> kube::Result<Secret>;
    async fn replace_secret(
        &self,
        namespace: &str,
        name: &str,
        secret: &Secret,
    ) -> kube::Result<Secret>;
}

/// `ClusterApi` backed by a real Kubernetes API server
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using in-cluster service account credentials, falling back to
    /// the local kubeconfig.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Config(format!("Failed to load Kubernetes credentials: {e}")))?;
        Ok(Self::new(client))
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn selector_params(selector: &str) -> ListParams {
    ListParams::default().labels(selector)
}

async fn read_stream<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<String> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Exit code reported by the exec completion status.
///
/// Success carries no code; failures carry an `ExitCode` cause. A failure
/// without one (e.g. the command could not be started) is reported as 1.
#[must_use]
pub fn exit_code_from_status(status: &Status) -> i32 {
    if status.status.as_deref() == Some("Success") {
        return 0;
    }

    status
        .details
        .as_ref()
        .and_then(|details| details.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|cause| cause.reason.as_deref() == Some("ExitCode"))
        })
        .and_then(|cause| cause.message.as_deref())
        .and_then(|message| message.trim().parse().ok())
        .unwrap_or(1)
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_deployment(&self, namespace: &str, name: &str) -> kube::Result<Deployment> {
        self.api::<Deployment>(namespace).get(name).await
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> kube::Result<Deployment> {
        self.api::<Deployment>(namespace)
            .create(&PostParams::default(), deployment)
            .await
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> kube::Result<()> {
        // Background propagation so the ReplicaSet and pods go with it
        self.api::<Deployment>(namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map(|_| ())
    }

    async fn list_deployments(
        &self,
        namespace: &str,
        selector: &str,
    ) -> kube::Result<Vec<Deployment>> {
        Ok(self
            .api::<Deployment>(namespace)
            .list(&selector_params(selector))
            .await?
            .items)
    }

    async fn annotate_deployment(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> kube::Result<()> {
        let patch = json!({
            "metadata": {
                "annotations": annotations
            }
        });
        self.api::<Deployment>(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map(|_| ())
    }

    fn watch_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> BoxStream<'static, Result<Option<Deployment>>> {
        let resource = name.to_string();
        watcher::watch_object(self.api::<Deployment>(namespace), name)
            .default_backoff()
            .map(move |event| {
                event.map_err(|e| Error::Watch {
                    resource: resource.clone(),
                    message: e.to_string(),
                })
            })
            .boxed()
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> kube::Result<Pod> {
        self.api::<Pod>(namespace).get(name).await
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> kube::Result<Vec<Pod>> {
        Ok(self
            .api::<Pod>(namespace)
            .list(&selector_params(selector))
            .await?
            .items)
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput> {
        debug!(pod = %pod, container = %container, ?command, "Executing command in pod");

        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);

        let mut attached = self
            .api::<Pod>(namespace)
            .exec(pod, command, &params)
            .await
            .map_err(|e| Error::api(pod, e))?;

        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let status = attached.take_status();

        let (stdout, stderr) = tokio::join!(read_stream(stdout), read_stream(stderr));
        let exec_error = |e: std::io::Error| Error::Exec {
            pod: pod.to_string(),
            message: format!("failed to read output stream: {e}"),
        };
        let stdout = stdout.map_err(exec_error)?;
        let stderr = stderr.map_err(exec_error)?;

        let status = match status {
            Some(status) => status.await,
            None => None,
        };

        if let Err(e) = attached.join().await {
            warn!(pod = %pod, error = %e, "Exec session did not close cleanly");
        }

        let status = status.ok_or_else(|| Error::Exec {
            pod: pod.to_string(),
            message: "no completion status received".to_string(),
        })?;

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: exit_code_from_status(&status),
        })
    }

    async fn get_service(&self, namespace: &str, name: &str) -> kube::Result<Service> {
        self.api::<Service>(namespace).get(name).await
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> kube::Result<Service> {
        self.api::<Service>(namespace)
            .create(&PostParams::default(), service)
            .await
    }

    async fn replace_service(
        &self,
        namespace: &str,
        name: &str,
        service: &Service,
    ) -> kube::Result<Service> {
        self.api::<Service>(namespace)
            .replace(name, &PostParams::default(), service)
            .await
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> kube::Result<()> {
        self.api::<Service>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
    }

    async fn list_services(&self, namespace: &str, selector: &str) -> kube::Result<Vec<Service>> {
        Ok(self
            .api::<Service>(namespace)
            .list(&selector_params(selector))
            .await?
            .items)
    }

    async fn get_ingress(&self, namespace: &str, name: &str) -> kube::Result<Ingress> {
        self.api::<Ingress>(namespace).get(name).await
    }

    async fn create_ingress(&self, namespace: &str, ingress: &Ingress) -> kube::Result<Ingress> {
        self.api::<Ingress>(namespace)
            .create(&PostParams::default(), ingress)
            .await
    }

    async fn replace_ingress(
        &self,
        namespace: &str,
        name: &str,
        ingress: &Ingress,
    ) -> kube::Result<Ingress> {
        self.api::<Ingress>(namespace)
            .replace(name, &PostParams::default(), ingress)
            .await
    }

    async fn delete_ingress(&self, namespace: &str, name: &str) -> kube::Result<()> {
        self.api::<Ingress>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
    }

    async fn list_ingresses(
        &self,
        namespace: &str,
        selector: &str,
    ) -> kube::Result<Vec<Ingress>> {
        Ok(self
            .api::<Ingress>(namespace)
            .list(&selector_params(selector))
            .await?
            .items)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> kube::Result<Secret> {
        self.api::<Secret>(namespace).get(name).await
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> kube::Result<Secret> {
        self.api::<Secret>(namespace)
            .create(&PostParams::default(), secret)
            .await
    }

    async fn replace_secret(
        &self,
        namespace: &str,
        name: &str,
        secret: &Secret,
    ) -> kube::Result<Secret> {
        self.api::<Secret>(namespace)
            .replace(name, &PostParams::default(), secret)
            .await
    }
}
