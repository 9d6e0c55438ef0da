//! Manifest builder
//!
//! Pure functions from domain parameters to typed Kubernetes objects. Each
//! manifest is assembled as a JSON document and decoded into its
//! `k8s-openapi` type, so a malformed document fails here rather than at the
//! API server.

use crate::config::{PodManagerConfig, ResourceConfig};
use crate::error::{Error, Result};
use crate::naming::{
    self, podman_labels, podman_pod_selector, shell_labels, user_secret_labels, Component,
    ResourceNaming, ShellOwner, LABEL_COMPONENT, LABEL_INSTANCE, LABEL_NAME,
};
use crate::reconcile::ShellPodRequest;
use chrono::{DateTime, Utc};
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Secret, Service},
    networking::v1::Ingress,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Port the runtime pod serves the Docker-compatible API on
pub const PODMAN_API_PORT: u16 = 2375;
pub const SSH_PORT: u16 = 22;

pub const SHELL_CONTAINER: &str = "shell";
pub const PODMAN_CONTAINER: &str = "podman";

const DATA_VOLUME: &str = "worktree-data";
const ANNOTATION_WORKTREE_NAME: &str = "agor.io/worktree-name";

fn decode<T: DeserializeOwned>(kind: &'static str, manifest: Value) -> Result<T> {
    serde_json::from_value(manifest).map_err(|source| Error::Manifest { kind, source })
}

fn resources(config: &ResourceConfig) -> Value {
    json!({
        "requests": {
            "cpu": config.cpu_request,
            "memory": config.memory_request
        },
        "limits": {
            "cpu": config.cpu_limit,
            "memory": config.memory_limit
        }
    })
}

/// Mount the shared claim so that only the worktree is visible when the
/// worktree lives under the data root.
fn data_volume_mount(data_root: &str, worktree_path: &str) -> Value {
    let root = data_root.trim_end_matches('/');
    let sub_path = worktree_path
        .strip_prefix(root)
        .and_then(|rest| rest.strip_prefix('/'))
        .map(|rest| rest.trim_end_matches('/'))
        .filter(|rest| !rest.is_empty());

    match sub_path {
        Some(sub_path) => json!({
            "name": DATA_VOLUME,
            "mountPath": worktree_path.trim_end_matches('/'),
            "subPath": sub_path
        }),
        None => json!({
            "name": DATA_VOLUME,
            "mountPath": if root.is_empty() { "/" } else { root }
        }),
    }
}

fn data_volume(config: &PodManagerConfig) -> Value {
    json!({
        "name": DATA_VOLUME,
        "persistentVolumeClaim": {
            "claimName": config.storage.pvc_name
        }
    })
}

fn selector_labels(labels: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    labels
        .iter()
        .filter(|(key, _)| {
            matches!(key.as_str(), LABEL_NAME | LABEL_COMPONENT | LABEL_INSTANCE)
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Interactive shell deployment for one (worktree, user) pair.
pub fn shell_deployment(
    config: &PodManagerConfig,
    request: &ShellPodRequest,
    now: DateTime<Utc>,
) -> Result<Deployment> {
    let name = ResourceNaming::shell_deployment(&request.worktree_id, &request.user_id);
    let labels = shell_labels(&ShellOwner {
        worktree_id: &request.worktree_id,
        user_id: &request.user_id,
        unix_username: request.unix_username.as_deref(),
        unix_uid: request.unix_uid,
    });

    let mut annotations = naming::creation_annotations(now);
    annotations.insert(
        ANNOTATION_WORKTREE_NAME.to_string(),
        request.worktree_name.clone(),
    );

    let mut env = vec![
        json!({"name": "AGOR_WORKTREE_ID", "value": request.worktree_id}),
        json!({"name": "AGOR_WORKTREE_NAME", "value": request.worktree_name}),
        json!({"name": "AGOR_WORKTREE_PATH", "value": request.worktree_path}),
        json!({"name": "AGOR_USER_ID", "value": request.user_id}),
        json!({
            "name": "DOCKER_HOST",
            "value": format!(
                "tcp://{}:{PODMAN_API_PORT}",
                ResourceNaming::podman_service(&request.worktree_id)
            )
        }),
    ];
    if let Some(username) = request.unix_username.as_deref() {
        env.push(json!({"name": "USER", "value": username}));
        env.push(json!({"name": "AGOR_UNIX_USERNAME", "value": username}));
    }
    if let Some(uid) = request.unix_uid {
        env.push(json!({"name": "AGOR_UNIX_UID", "value": uid.to_string()}));
    }

    // The secret may appear after the deployment; the ref is optional
    let container = json!({
        "name": SHELL_CONTAINER,
        "image": config.shell_pod.image,
        "command": ["/bin/sh", "-c", "trap 'exit 0' TERM INT; sleep infinity & wait"],
        "workingDir": request.worktree_path,
        "env": env,
        "ports": [{"name": "ssh", "containerPort": SSH_PORT}],
        "resources": resources(&config.shell_pod.resources),
        "envFrom": [{
            "secretRef": {
                "name": ResourceNaming::user_secret(&request.user_id),
                "optional": true
            }
        }],
        "volumeMounts": [data_volume_mount(&config.storage.data_root, &request.worktree_path)]
    });

    let mut pod_spec = json!({
        "containers": [container],
        "volumes": [data_volume(config)]
    });

    // Consistent file ownership on the shared volume
    if let Some(uid) = request.unix_uid {
        pod_spec["securityContext"] = json!({
            "runAsUser": uid,
            "runAsGroup": uid,
            "fsGroup": uid,
            "fsGroupChangePolicy": "OnRootMismatch"
        });
    }

    let deployment = json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": name,
            "labels": labels,
            "annotations": annotations
        },
        "spec": {
            "replicas": 1,
            "strategy": {"type": "Recreate"},
            "selector": {"matchLabels": selector_labels(&labels)},
            "template": {
                "metadata": {
                    "labels": labels,
                    "annotations": {
                        (naming::ANNOTATION_CREATED_AT): naming::format_timestamp(now)
                    }
                },
                "spec": pod_spec
            }
        }
    });

    decode("Deployment", deployment)
}

/// SSH exposure service that fronts one shell pod.
pub fn shell_ssh_service(request: &ShellPodRequest, now: DateTime<Utc>) -> Result<Service> {
    let deployment = ResourceNaming::shell_deployment(&request.worktree_id, &request.user_id);
    let labels = shell_labels(&ShellOwner {
        worktree_id: &request.worktree_id,
        user_id: &request.user_id,
        unix_username: request.unix_username.as_deref(),
        unix_uid: request.unix_uid,
    });

    let service = json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": ResourceNaming::shell_ssh_service(&request.worktree_id, &request.user_id),
            "labels": labels,
            "annotations": naming::creation_annotations(now)
        },
        "spec": {
            "type": "ClusterIP",
            "ports": [{"name": "ssh", "port": SSH_PORT, "targetPort": "ssh"}],
            "selector": {
                (LABEL_COMPONENT): Component::Terminal.as_str(),
                (LABEL_INSTANCE): deployment
            }
        }
    });

    decode("Service", service)
}

/// Shared container runtime deployment for a worktree.
pub fn podman_deployment(
    config: &PodManagerConfig,
    worktree_id: &str,
    worktree_path: &str,
    now: DateTime<Utc>,
) -> Result<Deployment> {
    let labels = podman_labels(worktree_id);

    let container = json!({
        "name": PODMAN_CONTAINER,
        "image": config.podman_pod.image,
        "command": [
            "podman", "system", "service", "--time=0",
            format!("tcp://0.0.0.0:{PODMAN_API_PORT}")
        ],
        "workingDir": worktree_path,
        "env": [
            {"name": "AGOR_WORKTREE_ID", "value": worktree_id},
            {"name": "AGOR_WORKTREE_PATH", "value": worktree_path}
        ],
        "ports": [{"name": "docker", "containerPort": PODMAN_API_PORT}],
        "securityContext": {"privileged": true},
        "resources": resources(&config.podman_pod.resources),
        "readinessProbe": {
            "tcpSocket": {"port": PODMAN_API_PORT},
            "periodSeconds": 2
        },
        "volumeMounts": [
            data_volume_mount(&config.storage.data_root, worktree_path),
            {"name": "container-storage", "mountPath": "/var/lib/containers"}
        ]
    });

    let deployment = json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": ResourceNaming::podman_deployment(worktree_id),
            "labels": labels,
            "annotations": naming::creation_annotations(now)
        },
        "spec": {
            "replicas": 1,
            "strategy": {"type": "Recreate"},
            "selector": {"matchLabels": selector_labels(&labels)},
            "template": {
                "metadata": {
                    "labels": labels,
                    "annotations": {
                        (naming::ANNOTATION_CREATED_AT): naming::format_timestamp(now)
                    }
                },
                "spec": {
                    "containers": [container],
                    "volumes": [
                        data_volume(config),
                        {"name": "container-storage", "emptyDir": {}}
                    ]
                }
            }
        }
    });

    decode("Deployment", deployment)
}

/// ClusterIP service exposing the runtime pod's Docker API inside the cluster.
pub fn podman_service(worktree_id: &str, now: DateTime<Utc>) -> Result<Service> {
    let service = json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": ResourceNaming::podman_service(worktree_id),
            "labels": podman_labels(worktree_id),
            "annotations": naming::creation_annotations(now)
        },
        "spec": {
            "type": "ClusterIP",
            "ports": [{"name": "docker", "port": PODMAN_API_PORT, "targetPort": "docker"}],
            "selector": {
                (LABEL_COMPONENT): Component::ContainerRuntime.as_str(),
                (LABEL_INSTANCE): ResourceNaming::podman_deployment(worktree_id)
            }
        }
    });

    decode("Service", service)
}

/// Service exposing an arbitrary port of the worktree's runtime pod.
pub fn app_service(worktree_id: &str, port: u16, now: DateTime<Utc>) -> Result<Service> {
    let service = json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": ResourceNaming::app_service(worktree_id),
            "labels": podman_labels(worktree_id),
            "annotations": naming::creation_annotations(now)
        },
        "spec": {
            "type": "ClusterIP",
            "ports": [{"name": "http", "port": port, "targetPort": port}],
            "selector": podman_pod_selector(worktree_id)
        }
    });

    decode("Service", service)
}

/// Ingress routing `host` to the worktree's app service.
pub fn worktree_ingress(
    config: &PodManagerConfig,
    worktree_id: &str,
    host: &str,
    port: u16,
    now: DateTime<Utc>,
) -> Result<Ingress> {
    let mut annotations = config.ingress.annotations.clone();
    annotations.extend(naming::creation_annotations(now));

    let mut spec = json!({
        "rules": [{
            "host": host,
            "http": {
                "paths": [{
                    "path": "/",
                    "pathType": "Prefix",
                    "backend": {
                        "service": {
                            "name": ResourceNaming::app_service(worktree_id),
                            "port": {"number": port}
                        }
                    }
                }]
            }
        }]
    });

    if let Some(class_name) = config.ingress.class_name.as_deref() {
        spec["ingressClassName"] = json!(class_name);
    }
    if let Some(secret_name) = config.ingress.tls_secret_name.as_deref() {
        spec["tls"] = json!([{"hosts": [host], "secretName": secret_name}]);
    }

    let ingress = json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "Ingress",
        "metadata": {
            "name": ResourceNaming::ingress(worktree_id),
            "labels": podman_labels(worktree_id),
            "annotations": annotations
        },
        "spec": spec
    });

    decode("Ingress", ingress)
}

/// Opaque secret holding a user's API keys, injected into shell pods via `envFrom`.
pub fn user_secret(user_id: &str, api_keys: &BTreeMap<String, String>) -> Result<Secret> {
    let secret = json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "type": "Opaque",
        "metadata": {
            "name": ResourceNaming::user_secret(user_id),
            "labels": user_secret_labels(user_id)
        },
        "stringData": api_keys
    });

    decode("Secret", secret)
}
