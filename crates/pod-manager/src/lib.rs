/*
 * 5D Labs Agent Platform - Worktree Pod Manager
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Worktree pod lifecycle manager
//!
//! Provisions per-worktree, per-user sandboxed environments on Kubernetes:
//! interactive shell pods, a shared container-runtime ("podman") pod per
//! worktree, optional app exposure through a Service/Ingress pair, and a
//! garbage collector that reclaims idle or orphaned resources. All state lives
//! in the cluster; resources are discovered purely from labels.

pub mod cluster;
pub mod config;
pub mod error;
pub mod exec;
pub mod gc;
pub mod ingress;
pub mod manager;
pub mod manifests;
pub mod naming;
pub mod reconcile;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types
pub use cluster::{ClusterApi, ExecOutput, KubeCluster};
pub use config::PodManagerConfig;
pub use error::{Error, Result};
pub use gc::GcReport;
pub use manager::PodManager;
pub use reconcile::ShellPodRequest;
