//! Shared test utilities: an in-memory cluster

use crate::cluster::{ClusterApi, ExecOutput};
use crate::error::{Error, Result};
use crate::naming::LABEL_INSTANCE;
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::api::{
    apps::v1::{Deployment, DeploymentCondition, DeploymentStatus},
    core::v1::{Pod, PodStatus, Secret, Service},
    networking::v1::Ingress,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::error::ErrorResponse;
use kube::Resource;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// API error response with the given HTTP status
pub fn api_error(code: u16) -> kube::Error {
    let reason = match code {
        404 => "NotFound",
        409 => "AlreadyExists",
        403 => "Forbidden",
        _ => "InternalError",
    };
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("injected {code}"),
        reason: reason.to_string(),
        code,
    })
}

/// What a watched deployment does once the manager starts waiting on it
#[derive(Debug, Clone, Default)]
pub enum Readiness {
    /// Becomes ready with one running pod
    #[default]
    Immediate,
    /// Reports a `ReplicaFailure` condition
    ReplicaFailure(String),
    /// Stays unready forever
    Never,
}

struct Failure {
    op: &'static str,
    kind: &'static str,
    name: Option<String>,
    error: kube::Error,
}

#[derive(Default)]
struct State {
    deployments: BTreeMap<String, Deployment>,
    pods: BTreeMap<String, Pod>,
    services: BTreeMap<String, Service>,
    ingresses: BTreeMap<String, Ingress>,
    secrets: BTreeMap<String, Secret>,
    readiness: Readiness,
    revision: u64,
    pod_counter: u32,
    calls: Vec<String>,
    failures: Vec<Failure>,
    exec_output: ExecOutput,
    exec_calls: Vec<(String, String, Vec<String>)>,
}

impl State {
    fn take_failure(&mut self, op: &str, kind: &str, name: Option<&str>) -> Option<kube::Error> {
        let index = self.failures.iter().position(|f| {
            f.op == op && f.kind == kind && (f.name.is_none() || f.name.as_deref() == name)
        })?;
        Some(self.failures.remove(index).error)
    }

    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn spawn_pod(&mut self, deployment: &Deployment) -> String {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        self.pod_counter += 1;
        let pod_name = format!("{name}-6b7c9d8f5-p{:04}", self.pod_counter);

        let template = deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.template.metadata.clone())
            .unwrap_or_default();

        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(pod_name.clone()),
                labels: template.labels,
                annotations: template.annotations,
                creation_timestamp: Some(Time(Utc::now())),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.pods.insert(pod_name.clone(), pod);
        pod_name
    }

    /// Mark ready and make sure a pod backs it; returns the pod name.
    fn make_ready(&mut self, name: &str) -> Option<String> {
        let mut deployment = self.deployments.get(name)?.clone();
        deployment.status = Some(DeploymentStatus {
            replicas: Some(1),
            ready_replicas: Some(1),
            ..Default::default()
        });
        self.deployments.insert(name.to_string(), deployment.clone());

        let existing = self
            .pods
            .iter()
            .find(|(_, pod)| instance_of(pod) == Some(name))
            .map(|(pod_name, _)| pod_name.clone());
        Some(existing.unwrap_or_else(|| self.spawn_pod(&deployment)))
    }

    fn fail_replicas(&mut self, name: &str, message: &str) {
        if let Some(deployment) = self.deployments.get_mut(name) {
            deployment.status = Some(DeploymentStatus {
                conditions: Some(vec![DeploymentCondition {
                    type_: "ReplicaFailure".to_string(),
                    status: "True".to_string(),
                    reason: Some("FailedCreate".to_string()),
                    message: Some(message.to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            });
        }
    }
}

fn instance_of(pod: &Pod) -> Option<&str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(LABEL_INSTANCE))
        .map(String::as_str)
}

/// `k=v,k=v` equality selectors only
fn matches_selector(meta: &ObjectMeta, selector: &str) -> bool {
    let labels = meta.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
            None => labels.contains_key(term),
        })
}

fn name_of<K: Resource>(object: &K) -> String {
    object.meta().name.clone().unwrap_or_default()
}

/// In-memory `ClusterApi`.
///
/// Records every mutating call as `"{verb} {Kind} {name}"`, lets tests inject
/// API failures, and simulates deployment readiness when a watch starts.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn set_readiness(&self, readiness: Readiness) {
        self.state().readiness = readiness;
    }

    pub fn set_exec_output(&self, output: ExecOutput) {
        self.state().exec_output = output;
    }

    pub fn fail_next_create(&self, kind: &'static str, name: &str, error: kube::Error) {
        self.push_failure("create", kind, Some(name), error);
    }

    pub fn fail_next_get(&self, kind: &'static str, name: &str, error: kube::Error) {
        self.push_failure("get", kind, Some(name), error);
    }

    pub fn fail_next_list(&self, kind: &'static str, error: kube::Error) {
        self.push_failure("list", kind, None, error);
    }

    fn push_failure(&self, op: &'static str, kind: &'static str, name: Option<&str>, error: kube::Error) {
        self.state().failures.push(Failure {
            op,
            kind,
            name: name.map(str::to_string),
            error,
        });
    }

    pub fn call_log(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Names of successfully created objects of `kind`, in order
    pub fn created(&self, kind: &str) -> Vec<String> {
        let prefix = format!("create {kind} ");
        self.call_log()
            .iter()
            .filter_map(|call| call.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    pub fn create_count(&self) -> usize {
        self.call_log()
            .iter()
            .filter(|call| call.starts_with("create "))
            .count()
    }

    /// Every delete request, including ones for objects already gone
    pub fn deleted_names(&self) -> Vec<String> {
        self.call_log()
            .iter()
            .filter_map(|call| call.strip_prefix("delete ").map(str::to_string))
            .collect()
    }

    pub fn exec_calls(&self) -> Vec<(String, String, Vec<String>)> {
        self.state().exec_calls.clone()
    }

    pub fn deployment(&self, name: &str) -> Option<Deployment> {
        self.state().deployments.get(name).cloned()
    }

    pub fn service(&self, name: &str) -> Option<Service> {
        self.state().services.get(name).cloned()
    }

    pub fn ingress(&self, name: &str) -> Option<Ingress> {
        self.state().ingresses.get(name).cloned()
    }

    pub fn secret(&self, name: &str) -> Option<Secret> {
        self.state().secrets.get(name).cloned()
    }

    /// Names of the pods backing a deployment
    pub fn pods_of(&self, deployment: &str) -> Vec<String> {
        self.state()
            .pods
            .iter()
            .filter(|(_, pod)| instance_of(pod) == Some(deployment))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Seed a deployment as-is, without recording a call
    pub fn insert_deployment(&self, deployment: Deployment) {
        self.state()
            .deployments
            .insert(name_of(&deployment), deployment);
    }

    /// Seed a ready deployment with one running pod; returns the pod name
    pub fn insert_ready_deployment(&self, deployment: Deployment) -> String {
        let name = name_of(&deployment);
        let mut state = self.state();
        state.deployments.insert(name.clone(), deployment);
        state.make_ready(&name).unwrap_or_default()
    }

    pub fn insert_service(&self, service: Service) {
        self.state().services.insert(name_of(&service), service);
    }

    pub fn insert_ingress(&self, ingress: Ingress) {
        self.state().ingresses.insert(name_of(&ingress), ingress);
    }

    pub fn remove_service(&self, name: &str) {
        self.state().services.remove(name);
    }

    pub fn remove_pods_of(&self, deployment: &str) {
        self.state()
            .pods
            .retain(|_, pod| instance_of(pod) != Some(deployment));
    }

    /// Add another pod to a deployment, as during a rollout; returns its name
    pub fn spawn_extra_pod(&self, deployment: &str) -> Option<String> {
        let mut state = self.state();
        let deployment = state.deployments.get(deployment)?.clone();
        Some(state.spawn_pod(&deployment))
    }

    /// Drop a deployment but leave its pods, as the API server does while
    /// they terminate
    pub fn forget_deployment(&self, name: &str) {
        self.state().deployments.remove(name);
    }

    pub fn mark_pod_terminating(&self, name: &str) {
        if let Some(pod) = self.state().pods.get_mut(name) {
            pod.metadata.deletion_timestamp = Some(Time(Utc::now()));
        }
    }
}

macro_rules! crud {
    ($state:expr, create, $kind:literal, $map:ident, $object:expr) => {{
        let mut state = $state;
        let name = name_of($object);
        if let Some(error) = state.take_failure("create", $kind, Some(name.as_str())) {
            return Err(error);
        }
        if state.$map.contains_key(&name) {
            return Err(api_error(409));
        }
        let mut object = $object.clone();
        object.metadata.resource_version = Some(state.next_revision());
        object.metadata.creation_timestamp = Some(Time(Utc::now()));
        state.$map.insert(name.clone(), object.clone());
        state.calls.push(format!("create {} {}", $kind, name));
        Ok(object)
    }};
    ($state:expr, get, $kind:literal, $map:ident, $name:expr) => {{
        let mut state = $state;
        if let Some(error) = state.take_failure("get", $kind, Some($name)) {
            return Err(error);
        }
        state.$map.get($name).cloned().ok_or_else(|| api_error(404))
    }};
    ($state:expr, replace, $kind:literal, $map:ident, $name:expr, $object:expr) => {{
        let mut state = $state;
        if !state.$map.contains_key($name) {
            return Err(api_error(404));
        }
        let mut object = $object.clone();
        object.metadata.resource_version = Some(state.next_revision());
        state.$map.insert($name.to_string(), object.clone());
        state.calls.push(format!("replace {} {}", $kind, $name));
        Ok(object)
    }};
    ($state:expr, delete, $kind:literal, $map:ident, $name:expr) => {{
        let mut state = $state;
        state.calls.push(format!("delete {} {}", $kind, $name));
        state.$map.remove($name).map(|_| ()).ok_or_else(|| api_error(404))
    }};
    ($state:expr, list, $kind:literal, $map:ident, $selector:expr) => {{
        let mut state = $state;
        if let Some(error) = state.take_failure("list", $kind, None) {
            return Err(error);
        }
        Ok(state
            .$map
            .values()
            .filter(|object| matches_selector(&object.metadata, $selector))
            .cloned()
            .collect())
    }};
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get_deployment(&self, _namespace: &str, name: &str) -> kube::Result<Deployment> {
        crud!(self.state(), get, "Deployment", deployments, name)
    }

    async fn create_deployment(
        &self,
        _namespace: &str,
        deployment: &Deployment,
    ) -> kube::Result<Deployment> {
        crud!(self.state(), create, "Deployment", deployments, deployment)
    }

    async fn delete_deployment(&self, _namespace: &str, name: &str) -> kube::Result<()> {
        self.state()
            .pods
            .retain(|_, pod| instance_of(pod) != Some(name));
        crud!(self.state(), delete, "Deployment", deployments, name)
    }

    async fn list_deployments(
        &self,
        _namespace: &str,
        selector: &str,
    ) -> kube::Result<Vec<Deployment>> {
        crud!(self.state(), list, "Deployment", deployments, selector)
    }

    async fn annotate_deployment(
        &self,
        _namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> kube::Result<()> {
        let mut state = self.state();
        let deployment = state.deployments.get_mut(name).ok_or_else(|| api_error(404))?;
        deployment
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(annotations.clone());
        state.calls.push(format!("annotate Deployment {name}"));
        Ok(())
    }

    fn watch_deployment(
        &self,
        _namespace: &str,
        name: &str,
    ) -> BoxStream<'static, Result<Option<Deployment>>> {
        let mut state = self.state();
        state.calls.push(format!("watch Deployment {name}"));

        if state.deployments.contains_key(name) {
            match state.readiness.clone() {
                Readiness::Immediate => {
                    state.make_ready(name);
                }
                Readiness::ReplicaFailure(message) => state.fail_replicas(name, &message),
                Readiness::Never => {}
            }
        }
        let observed = state.deployments.get(name).cloned();

        // A real watch stays open after the current state; so does this one
        stream::iter(vec![Ok(observed)])
            .chain(stream::pending())
            .boxed()
    }

    async fn get_pod(&self, _namespace: &str, name: &str) -> kube::Result<Pod> {
        crud!(self.state(), get, "Pod", pods, name)
    }

    async fn list_pods(&self, _namespace: &str, selector: &str) -> kube::Result<Vec<Pod>> {
        crud!(self.state(), list, "Pod", pods, selector)
    }

    async fn exec(
        &self,
        _namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput> {
        let mut state = self.state();
        if !state.pods.contains_key(pod) {
            return Err(Error::api(pod, api_error(404)));
        }
        state.calls.push(format!("exec Pod {pod}"));
        state
            .exec_calls
            .push((pod.to_string(), container.to_string(), command));
        Ok(state.exec_output.clone())
    }

    async fn get_service(&self, _namespace: &str, name: &str) -> kube::Result<Service> {
        crud!(self.state(), get, "Service", services, name)
    }

    async fn create_service(&self, _namespace: &str, service: &Service) -> kube::Result<Service> {
        crud!(self.state(), create, "Service", services, service)
    }

    async fn replace_service(
        &self,
        _namespace: &str,
        name: &str,
        service: &Service,
    ) -> kube::Result<Service> {
        crud!(self.state(), replace, "Service", services, name, service)
    }

    async fn delete_service(&self, _namespace: &str, name: &str) -> kube::Result<()> {
        crud!(self.state(), delete, "Service", services, name)
    }

    async fn list_services(&self, _namespace: &str, selector: &str) -> kube::Result<Vec<Service>> {
        crud!(self.state(), list, "Service", services, selector)
    }

    async fn get_ingress(&self, _namespace: &str, name: &str) -> kube::Result<Ingress> {
        crud!(self.state(), get, "Ingress", ingresses, name)
    }

    async fn create_ingress(&self, _namespace: &str, ingress: &Ingress) -> kube::Result<Ingress> {
        crud!(self.state(), create, "Ingress", ingresses, ingress)
    }

    async fn replace_ingress(
        &self,
        _namespace: &str,
        name: &str,
        ingress: &Ingress,
    ) -> kube::Result<Ingress> {
        crud!(self.state(), replace, "Ingress", ingresses, name, ingress)
    }

    async fn delete_ingress(&self, _namespace: &str, name: &str) -> kube::Result<()> {
        crud!(self.state(), delete, "Ingress", ingresses, name)
    }

    async fn list_ingresses(
        &self,
        _namespace: &str,
        selector: &str,
    ) -> kube::Result<Vec<Ingress>> {
        crud!(self.state(), list, "Ingress", ingresses, selector)
    }

    async fn get_secret(&self, _namespace: &str, name: &str) -> kube::Result<Secret> {
        crud!(self.state(), get, "Secret", secrets, name)
    }

    async fn create_secret(&self, _namespace: &str, secret: &Secret) -> kube::Result<Secret> {
        crud!(self.state(), create, "Secret", secrets, secret)
    }

    async fn replace_secret(
        &self,
        _namespace: &str,
        name: &str,
        secret: &Secret,
    ) -> kube::Result<Secret> {
        crud!(self.state(), replace, "Secret", secrets, name, secret)
    }
}
