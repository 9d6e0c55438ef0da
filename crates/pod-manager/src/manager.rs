//! Pod manager handle
//!
//! Holds the cluster client and the current configuration. Configuration can
//! be swapped at runtime; each operation works against the snapshot it took
//! when it started.

use crate::cluster::{ClusterApi, KubeCluster};
use crate::config::PodManagerConfig;
use crate::error::{Error, Result};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

pub struct PodManager {
    pub(crate) cluster: Arc<dyn ClusterApi>,
    config: RwLock<Arc<PodManagerConfig>>,
}

impl PodManager {
    pub fn new(cluster: Arc<dyn ClusterApi>, config: PodManagerConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;

        Ok(Self {
            cluster,
            config: RwLock::new(Arc::new(config)),
        })
    }

    /// Build a manager against the cluster found via in-cluster credentials or kubeconfig.
    pub async fn connect(config: PodManagerConfig) -> Result<Self> {
        let cluster = KubeCluster::try_default().await?;
        info!(namespace = %config.namespace, enabled = config.enabled, "Connected to Kubernetes");
        Self::new(Arc::new(cluster), config)
    }

    /// Current configuration snapshot
    #[must_use]
    pub fn config(&self) -> Arc<PodManagerConfig> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the configuration; takes effect on the next call.
    pub fn update_config(&self, config: PodManagerConfig) -> Result<()> {
        config
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;

        let mut current = self
            .config
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        info!(
            namespace = %config.namespace,
            enabled = config.enabled,
            "Pod manager configuration updated"
        );
        *current = Arc::new(config);
        Ok(())
    }

    /// Snapshot for an operation that needs the feature enabled.
    pub(crate) fn active_config(&self) -> Result<Arc<PodManagerConfig>> {
        let config = self.config();
        if config.enabled {
            Ok(config)
        } else {
            Err(Error::Disabled)
        }
    }
}
