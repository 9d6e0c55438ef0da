//! App exposure for a worktree's runtime pod
//!
//! A Service selecting the runtime pod plus an Ingress routing a hostname to
//! it. Both are upserted so repeated expose calls converge on the last port.

use crate::error::{self, Error, Result};
use crate::manager::PodManager;
use crate::manifests;
use crate::naming::ResourceNaming;
use crate::reconcile::ResourceKind;
use chrono::Utc;
use k8s_openapi::api::networking::v1::Ingress;
use tracing::{info, instrument};

impl PodManager {
    /// Expose `port` of the worktree's runtime pod and return its public URL.
    ///
    /// `base_domain` overrides the configured base domain.
    #[instrument(skip(self, worktree_name))]
    pub async fn create_worktree_ingress(
        &self,
        worktree_id: &str,
        worktree_name: &str,
        port: u16,
        base_domain: Option<&str>,
    ) -> Result<String> {
        let config = self.active_config()?;
        let ns = config.namespace.as_str();

        if port == 0 {
            return Err(Error::InvalidArgument("port must be non-zero".to_string()));
        }

        let base_domain = base_domain
            .or(config.ingress.base_domain.as_deref())
            .filter(|domain| !domain.trim().is_empty())
            .ok_or_else(|| {
                Error::Config("No base domain configured for worktree ingress".to_string())
            })?;

        let now = Utc::now();
        self.upsert_service(ns, manifests::app_service(worktree_id, port, now)?)
            .await?;

        let host = ResourceNaming::ingress_host(worktree_id, worktree_name, base_domain);
        let ingress = manifests::worktree_ingress(&config, worktree_id, &host, port, now)?;
        self.upsert_ingress(ns, ingress).await?;

        let scheme = if config.ingress.tls_secret_name.is_some() {
            "https"
        } else {
            "http"
        };
        let url = format!("{scheme}://{host}");
        info!(url = %url, "🌐 Worktree app exposed");
        Ok(url)
    }

    /// Remove the worktree's ingress and app service. Already gone is fine.
    #[instrument(skip(self))]
    pub async fn delete_worktree_ingress(&self, worktree_id: &str) -> Result<()> {
        let config = self.active_config()?;
        self.delete_all(
            &config.namespace,
            &[
                (ResourceKind::Ingress, ResourceNaming::ingress(worktree_id)),
                (
                    ResourceKind::Service,
                    ResourceNaming::app_service(worktree_id),
                ),
            ],
        )
        .await
    }

    async fn upsert_ingress(&self, ns: &str, mut ingress: Ingress) -> Result<()> {
        let name = ingress.metadata.name.clone().unwrap_or_default();

        match self.cluster.create_ingress(ns, &ingress).await {
            Ok(_) => {
                info!(ingress = %name, "Created ingress");
                Ok(())
            }
            Err(e) if error::is_conflict(&e) => {
                let existing = self
                    .cluster
                    .get_ingress(ns, &name)
                    .await
                    .map_err(|e| Error::api(&name, e))?;
                ingress.metadata.resource_version = existing.metadata.resource_version;
                self.cluster
                    .replace_ingress(ns, &name, &ingress)
                    .await
                    .map_err(|e| Error::api(&name, e))?;
                info!(ingress = %name, "🔄 Replaced ingress");
                Ok(())
            }
            Err(e) => Err(Error::api(&name, e)),
        }
    }
}
