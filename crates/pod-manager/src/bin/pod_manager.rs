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

//! Operator CLI for the worktree pod manager
//!
//! Each subcommand maps to one manager operation. `gc-loop` runs the garbage
//! collector on a fixed schedule until interrupted.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pod_manager::{PodManager, PodManagerConfig, ShellPodRequest};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Worktree sandbox pod lifecycle manager
#[derive(Parser)]
#[command(name = "pod-manager", version)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to the mounted configuration file
    #[arg(long, env = "POD_MANAGER_CONFIG", default_value = "/config/config.yaml")]
    config: String,

    /// Emit logs as JSON
    #[arg(long, env = "POD_MANAGER_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ensure a running shell pod for a user in a worktree and print its name
    EnsureShell {
        #[arg(long)]
        worktree_id: String,
        #[arg(long)]
        worktree_name: String,
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        worktree_path: String,
        #[arg(long)]
        unix_uid: Option<u32>,
        #[arg(long)]
        unix_username: Option<String>,
        /// API key to inject, as NAME=VALUE (repeatable)
        #[arg(long = "api-key", value_parser = parse_key_value)]
        api_keys: Vec<(String, String)>,
    },

    /// Ensure the worktree's container runtime pod is ready
    EnsurePodman {
        #[arg(long)]
        worktree_id: String,
        #[arg(long)]
        worktree_path: String,
    },

    /// Delete a user's shell pod
    DeleteShell {
        #[arg(long)]
        worktree_id: String,
        #[arg(long)]
        user_id: String,
    },

    /// Delete the worktree's runtime pod and its exposure
    DeletePodman {
        #[arg(long)]
        worktree_id: String,
    },

    /// Expose a port of the runtime pod and print the public URL
    Expose {
        #[arg(long)]
        worktree_id: String,
        #[arg(long)]
        worktree_name: String,
        #[arg(long)]
        port: u16,
        /// Overrides the configured base domain
        #[arg(long)]
        base_domain: Option<String>,
    },

    /// Remove the worktree's ingress and app service
    Unexpose {
        #[arg(long)]
        worktree_id: String,
    },

    /// Run a command in the worktree's runtime pod; exits with its exit code
    Exec {
        #[arg(long)]
        worktree_id: String,
        #[arg(long)]
        cwd: Option<String>,
        /// Environment override, as NAME=VALUE (repeatable)
        #[arg(long = "env", value_parser = parse_key_value)]
        env: Vec<(String, String)>,
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Record activity for the deployment owning a pod
    Touch {
        #[arg(long)]
        pod: String,
    },

    /// Run one garbage collection pass and print the report
    Gc,

    /// Run garbage collection on a fixed interval until interrupted
    GcLoop {
        #[arg(long, default_value_t = 300)]
        interval_secs: u64,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected NAME=VALUE, got {raw:?}"))
}

fn load_config(config_path: &str) -> PodManagerConfig {
    if !Path::new(config_path).exists() {
        info!("No configuration at {}, using defaults", config_path);
        return PodManagerConfig::default();
    }

    match PodManagerConfig::from_mounted_file(config_path) {
        Ok(cfg) => {
            info!("Loaded pod manager configuration from {}", config_path);
            cfg
        }
        Err(err) => {
            warn!(
                "Failed to load configuration from {}: {}. Using defaults.",
                config_path, err
            );
            PodManagerConfig::default()
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down gracefully"),
        () = terminate => info!("Received SIGTERM, shutting down gracefully"),
    }
}

async fn gc_loop(manager: &PodManager, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    info!(interval_secs = interval.as_secs(), "♻️ Starting garbage collection loop");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                manager.run_gc().await;
            }
            () = &mut shutdown => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = load_config(&cli.config);
    let manager = PodManager::connect(config)
        .await
        .context("Failed to initialize pod manager")?;

    match cli.command {
        Commands::EnsureShell {
            worktree_id,
            worktree_name,
            user_id,
            worktree_path,
            unix_uid,
            unix_username,
            api_keys,
        } => {
            let mut request =
                ShellPodRequest::new(worktree_id, worktree_name, user_id, worktree_path)
                    .with_unix_user(unix_uid, unix_username);
            if !api_keys.is_empty() {
                request = request.with_api_keys(api_keys.into_iter().collect());
            }
            let pod = manager.ensure_shell_pod(&request).await?;
            println!("{pod}");
        }
        Commands::EnsurePodman {
            worktree_id,
            worktree_path,
        } => {
            let deployment = manager
                .ensure_podman_pod(&worktree_id, &worktree_path)
                .await?;
            println!("{deployment}");
        }
        Commands::DeleteShell {
            worktree_id,
            user_id,
        } => manager.delete_shell_pod(&worktree_id, &user_id).await?,
        Commands::DeletePodman { worktree_id } => manager.delete_podman_pod(&worktree_id).await?,
        Commands::Expose {
            worktree_id,
            worktree_name,
            port,
            base_domain,
        } => {
            let url = manager
                .create_worktree_ingress(&worktree_id, &worktree_name, port, base_domain.as_deref())
                .await?;
            println!("{url}");
        }
        Commands::Unexpose { worktree_id } => manager.delete_worktree_ingress(&worktree_id).await?,
        Commands::Exec {
            worktree_id,
            cwd,
            env,
            command,
        } => {
            let env: BTreeMap<String, String> = env.into_iter().collect();
            let output = manager
                .exec_in_podman_pod(&worktree_id, command, cwd.as_deref(), Some(&env))
                .await?;
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            std::process::exit(output.exit_code);
        }
        Commands::Touch { pod } => manager.update_last_activity(&pod).await?,
        Commands::Gc => {
            let report = manager.run_gc().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::GcLoop { interval_secs } => {
            gc_loop(&manager, Duration::from_secs(interval_secs.max(1))).await;
        }
    }

    Ok(())
}
