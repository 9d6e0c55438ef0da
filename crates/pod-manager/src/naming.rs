//! Deterministic resource names, labels and annotations.
//!
//! Names are pure functions of the owning identifiers so existence checks are
//! direct lookups. Labels make every resource discoverable by selector, which
//! is all the inventory the manager and the garbage collector need.

use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

const SHORT_ID_LENGTH: usize = 8;
const MAX_LABEL_VALUE_LENGTH: usize = 63;

pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_WORKTREE_ID: &str = "agor.io/worktree-id";
pub const LABEL_USER_ID: &str = "agor.io/user-id";
pub const LABEL_UNIX_USERNAME: &str = "agor.io/unix-username";
pub const LABEL_UNIX_UID: &str = "agor.io/unix-uid";

pub const ANNOTATION_CREATED_AT: &str = "agor.io/created-at";
pub const ANNOTATION_LAST_ACTIVITY: &str = "agor.io/last-activity";

pub const APP_NAME: &str = "agor";
pub const MANAGER_NAME: &str = "agor-pod-manager";

/// Value of `app.kubernetes.io/component` for each kind of managed resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    /// Interactive shell pods and their SSH services
    Terminal,
    /// Per-worktree container runtime pods, their services and ingresses
    ContainerRuntime,
    /// Per-user API key secrets
    UserCredentials,
}

impl Component {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Terminal => "terminal",
            Self::ContainerRuntime => "container-runtime",
            Self::UserCredentials => "user-credentials",
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct ResourceNaming;

impl ResourceNaming {
    /// First 8 characters of an identifier
    #[must_use]
    pub fn short_id(id: &str) -> &str {
        match id.char_indices().nth(SHORT_ID_LENGTH) {
            Some((idx, _)) => &id[..idx],
            None => id,
        }
    }

    /// `wt-{worktree}-shell-{user}`
    #[must_use]
    pub fn shell_deployment(worktree_id: &str, user_id: &str) -> String {
        format!(
            "wt-{}-shell-{}",
            Self::short_id(worktree_id),
            Self::short_id(user_id)
        )
    }

    /// SSH exposure service that lives and dies with the shell deployment
    #[must_use]
    pub fn shell_ssh_service(worktree_id: &str, user_id: &str) -> String {
        format!("{}-ssh", Self::shell_deployment(worktree_id, user_id))
    }

    /// `wt-{worktree}-podman`
    #[must_use]
    pub fn podman_deployment(worktree_id: &str) -> String {
        format!("wt-{}-podman", Self::short_id(worktree_id))
    }

    /// `wt-{worktree}-podman-svc`
    #[must_use]
    pub fn podman_service(worktree_id: &str) -> String {
        format!("wt-{}-podman-svc", Self::short_id(worktree_id))
    }

    /// `wt-{worktree}-app-svc`
    #[must_use]
    pub fn app_service(worktree_id: &str) -> String {
        format!("wt-{}-app-svc", Self::short_id(worktree_id))
    }

    /// `wt-{worktree}-ingress`
    #[must_use]
    pub fn ingress(worktree_id: &str) -> String {
        format!("wt-{}-ingress", Self::short_id(worktree_id))
    }

    /// Per-user API key secret
    #[must_use]
    pub fn user_secret(user_id: &str) -> String {
        format!("agor-user-{}-keys", Self::short_id(user_id))
    }

    /// Hostname a worktree's app is exposed on
    #[must_use]
    pub fn ingress_host(worktree_id: &str, worktree_name: &str, base_domain: &str) -> String {
        let slug = dns_slug(worktree_name);
        let short = Self::short_id(worktree_id).to_lowercase();
        let base_domain = base_domain.trim_matches('.');
        if slug.is_empty() {
            format!("{short}.{base_domain}")
        } else {
            format!("{slug}-{short}.{base_domain}")
        }
    }

    /// Recover the owning deployment's name from a pod.
    ///
    /// Pods created by this manager carry the deployment in their instance
    /// label. Older pods fall back to stripping the ReplicaSet hash and pod
    /// suffix that the deployment controller appends.
    #[must_use]
    pub fn deployment_for_pod(meta: &ObjectMeta) -> Option<String> {
        if let Some(instance) = meta.labels.as_ref().and_then(|l| l.get(LABEL_INSTANCE)) {
            return Some(instance.clone());
        }

        let name = meta.name.as_deref()?;
        let parts: Vec<&str> = name.split('-').collect();
        if parts.len() <= 2 {
            return None;
        }
        Some(parts[..parts.len() - 2].join("-"))
    }
}

/// Lowercase DNS label: alphanumerics and hyphens, max 40 characters.
fn dns_slug(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let mut slug: String = slug.trim_matches('-').chars().take(40).collect();
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// Sanitize a string into a valid Kubernetes label value.
#[must_use]
pub fn sanitize_label_value(input: &str) -> String {
    let mut sanitized: String = input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();

    sanitized.truncate(MAX_LABEL_VALUE_LENGTH);

    // Must start and end with an alphanumeric character
    sanitized
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// Identity of the owner of a shell pod
#[derive(Debug, Clone, Copy)]
pub struct ShellOwner<'a> {
    pub worktree_id: &'a str,
    pub user_id: &'a str,
    pub unix_username: Option<&'a str>,
    pub unix_uid: Option<u32>,
}

fn base_labels(component: Component) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_NAME.to_string(), APP_NAME.to_string());
    labels.insert(LABEL_COMPONENT.to_string(), component.as_str().to_string());
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGER_NAME.to_string());
    labels
}

/// Labels for the shell deployment, its pod template and its SSH service.
#[must_use]
pub fn shell_labels(owner: &ShellOwner<'_>) -> BTreeMap<String, String> {
    let mut labels = base_labels(Component::Terminal);
    labels.insert(
        LABEL_INSTANCE.to_string(),
        ResourceNaming::shell_deployment(owner.worktree_id, owner.user_id),
    );
    labels.insert(
        LABEL_WORKTREE_ID.to_string(),
        sanitize_label_value(owner.worktree_id),
    );
    labels.insert(LABEL_USER_ID.to_string(), sanitize_label_value(owner.user_id));
    if let Some(username) = owner.unix_username {
        labels.insert(
            LABEL_UNIX_USERNAME.to_string(),
            sanitize_label_value(username),
        );
    }
    if let Some(uid) = owner.unix_uid {
        labels.insert(LABEL_UNIX_UID.to_string(), uid.to_string());
    }
    labels
}

/// Labels for the podman deployment, its pod template and its services/ingress.
#[must_use]
pub fn podman_labels(worktree_id: &str) -> BTreeMap<String, String> {
    let mut labels = base_labels(Component::ContainerRuntime);
    labels.insert(
        LABEL_INSTANCE.to_string(),
        ResourceNaming::podman_deployment(worktree_id),
    );
    labels.insert(
        LABEL_WORKTREE_ID.to_string(),
        sanitize_label_value(worktree_id),
    );
    labels
}

/// Selector matching every runtime pod of a worktree (used by the app service).
#[must_use]
pub fn podman_pod_selector(worktree_id: &str) -> BTreeMap<String, String> {
    let mut selector = BTreeMap::new();
    selector.insert(
        LABEL_COMPONENT.to_string(),
        Component::ContainerRuntime.as_str().to_string(),
    );
    selector.insert(
        LABEL_WORKTREE_ID.to_string(),
        sanitize_label_value(worktree_id),
    );
    selector
}

#[must_use]
pub fn user_secret_labels(user_id: &str) -> BTreeMap<String, String> {
    let mut labels = base_labels(Component::UserCredentials);
    labels.insert(LABEL_USER_ID.to_string(), sanitize_label_value(user_id));
    labels
}

/// Label selector string for every resource this manager owns
#[must_use]
pub fn managed_selector() -> String {
    format!("{LABEL_NAME}={APP_NAME},{LABEL_MANAGED_BY}={MANAGER_NAME}")
}

/// Label selector string for one component
#[must_use]
pub fn component_selector(component: Component) -> String {
    format!("{LABEL_NAME}={APP_NAME},{LABEL_COMPONENT}={component}")
}

/// Label selector string for the pods behind one deployment
#[must_use]
pub fn instance_selector(component: Component, deployment: &str) -> String {
    format!("{},{LABEL_INSTANCE}={deployment}", component_selector(component))
}

/// Label selector string for one worktree's resources of a component
#[must_use]
pub fn worktree_selector(component: Component, worktree_id: &str) -> String {
    format!(
        "{},{LABEL_WORKTREE_ID}={}",
        component_selector(component),
        sanitize_label_value(worktree_id)
    )
}

/// ISO-8601 timestamp with millisecond precision, as stored in annotations
#[must_use]
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// `created-at` and `last-activity`, both set to `now`
#[must_use]
pub fn creation_annotations(now: DateTime<Utc>) -> BTreeMap<String, String> {
    let stamp = format_timestamp(now);
    let mut annotations = BTreeMap::new();
    annotations.insert(ANNOTATION_CREATED_AT.to_string(), stamp.clone());
    annotations.insert(ANNOTATION_LAST_ACTIVITY.to_string(), stamp);
    annotations
}

fn annotation_time(meta: &ObjectMeta, key: &str) -> Option<DateTime<Utc>> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .and_then(|raw| parse_timestamp(raw))
}

/// When the resource came into existence: `created-at`, else the API server's
/// `creationTimestamp`.
#[must_use]
pub fn created_at(meta: &ObjectMeta) -> Option<DateTime<Utc>> {
    annotation_time(meta, ANNOTATION_CREATED_AT)
        .or_else(|| meta.creation_timestamp.as_ref().map(|ts| ts.0))
}

/// Last observed activity. Resources without a `last-activity` annotation are
/// judged by their creation time.
#[must_use]
pub fn last_activity(meta: &ObjectMeta) -> Option<DateTime<Utc>> {
    annotation_time(meta, ANNOTATION_LAST_ACTIVITY).or_else(|| created_at(meta))
}
