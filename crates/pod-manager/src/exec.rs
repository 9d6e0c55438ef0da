//! Exec bridge into a worktree's container runtime pod

use crate::cluster::ExecOutput;
use crate::error::{Error, Result};
use crate::manager::PodManager;
use crate::manifests::PODMAN_CONTAINER;
use crate::naming::{worktree_selector, Component, ResourceNaming};
use crate::reconcile::is_running;
use std::collections::BTreeMap;
use tracing::{debug, instrument, warn};

/// Quote a value for POSIX `sh` using single quotes.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn is_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Build the argv actually sent to the pod.
///
/// Without overrides the command runs as-is. Otherwise it is wrapped in
/// `sh -c` that changes directory and sets the environment, then runs the
/// original argv through `"$@"` so its arguments are never re-parsed.
pub fn wrap_command(
    command: Vec<String>,
    cwd: Option<&str>,
    env: Option<&BTreeMap<String, String>>,
) -> Result<Vec<String>> {
    if command.is_empty() {
        return Err(Error::InvalidArgument("command must not be empty".to_string()));
    }

    let env = env.filter(|env| !env.is_empty());
    if cwd.is_none() && env.is_none() {
        return Ok(command);
    }

    let mut script = String::new();
    if let Some(dir) = cwd {
        script.push_str(&format!("cd {} && ", shell_quote(dir)));
    }
    script.push_str("exec ");
    if let Some(env) = env {
        script.push_str("env ");
        for (key, value) in env {
            if !is_env_key(key) {
                return Err(Error::InvalidArgument(format!(
                    "invalid environment variable name: {key:?}"
                )));
            }
            script.push_str(&format!("{key}={} ", shell_quote(value)));
        }
    }
    script.push_str("\"$@\"");

    let mut wrapped = vec![
        "sh".to_string(),
        "-c".to_string(),
        script,
        "sh".to_string(),
    ];
    wrapped.extend(command);
    Ok(wrapped)
}

impl PodManager {
    /// Run a command inside the worktree's runtime pod, capturing its output.
    ///
    /// A non-zero exit code is returned in the output, not as an error.
    #[instrument(skip(self, command, env), fields(argv0 = command.first().map(String::as_str)))]
    pub async fn exec_in_podman_pod(
        &self,
        worktree_id: &str,
        command: Vec<String>,
        cwd: Option<&str>,
        env: Option<&BTreeMap<String, String>>,
    ) -> Result<ExecOutput> {
        let config = self.active_config()?;
        let ns = config.namespace.as_str();
        let argv = wrap_command(command, cwd, env)?;

        let pods = self
            .cluster
            .list_pods(ns, &worktree_selector(Component::ContainerRuntime, worktree_id))
            .await
            .map_err(|e| Error::api(ResourceNaming::podman_deployment(worktree_id), e))?;

        let pod = pods
            .into_iter()
            .filter(is_running)
            .find_map(|pod| pod.metadata.name)
            .ok_or_else(|| Error::RuntimePodUnavailable {
                worktree_id: worktree_id.to_string(),
            })?;

        let output = self.cluster.exec(ns, &pod, PODMAN_CONTAINER, argv).await?;
        debug!(pod = %pod, exit_code = output.exit_code, "Command finished");

        let deployment = ResourceNaming::podman_deployment(worktree_id);
        if let Err(e) = self.touch_deployment(ns, &deployment).await {
            warn!(deployment = %deployment, error = %e, "Failed to record runtime activity");
        }

        Ok(output)
    }
}
