//! Error taxonomy for the pod manager
//!
//! Every remote failure carries the resource it was about and, when the API
//! server answered, its HTTP status code.

use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The Kubernetes API rejected or failed a request
    #[error("Kubernetes API error on {resource}{}: {source}", status_suffix(.status))]
    Api {
        resource: String,
        status: Option<u16>,
        #[source]
        source: kube::Error,
    },

    /// The watch on a resource broke before a terminal state was observed
    #[error("Watch on {resource} failed: {message}")]
    Watch { resource: String, message: String },

    /// A deployment reported a `ReplicaFailure` condition while we waited on it
    #[error("Deployment {deployment} failed to create replicas: {message}")]
    ReplicaFailure { deployment: String, message: String },

    /// A deployment never reached one ready replica within the readiness timeout
    #[error("Timed out after {timeout:?} waiting for deployment {deployment} to become ready")]
    ReadinessTimeout {
        deployment: String,
        timeout: Duration,
    },

    /// Deployment is ready but no running pod backs it
    #[error("No running pod found for deployment {deployment}")]
    PodNotFound { deployment: String },

    /// The worktree's container runtime pod is missing or not running
    #[error("Container runtime pod for worktree {worktree_id} is not running")]
    RuntimePodUnavailable { worktree_id: String },

    /// Command execution inside a pod failed before an exit status was observed
    #[error("Exec in pod {pod} failed: {message}")]
    Exec { pod: String, message: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A generated manifest could not be decoded into its typed object
    #[error("Failed to build {kind} manifest: {source}")]
    Manifest {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Worktree pod management is disabled")]
    Disabled,
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|code| format!(" (HTTP {code})")).unwrap_or_default()
}

impl Error {
    /// Wrap a kube error with the name of the resource it concerns.
    pub fn api(resource: impl Into<String>, source: kube::Error) -> Self {
        Error::Api {
            resource: resource.into(),
            status: status_code(&source),
            source,
        }
    }

    /// HTTP status code returned by the API server, if any
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Api { status, .. } => *status,
            _ => None,
        }
    }

    /// Name of the resource the error is about, if any
    #[must_use]
    pub fn resource_name(&self) -> Option<&str> {
        match self {
            Error::Api { resource, .. } | Error::Watch { resource, .. } => Some(resource),
            Error::ReplicaFailure { deployment, .. }
            | Error::ReadinessTimeout { deployment, .. }
            | Error::PodNotFound { deployment } => Some(deployment),
            Error::RuntimePodUnavailable { worktree_id } => Some(worktree_id),
            Error::Exec { pod, .. } => Some(pod),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        self.status_code() == Some(409)
    }
}

/// Status code carried by an API error response.
#[must_use]
pub fn status_code(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(ae) => Some(ae.code),
        _ => None,
    }
}

#[must_use]
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

#[must_use]
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// Treat 404 on delete as success: the resource is already gone.
pub fn ignore_not_found(result: Result<(), kube::Error>) -> Result<(), kube::Error> {
    match result {
        Err(err) if is_not_found(&err) => Ok(()),
        other => other,
    }
}
