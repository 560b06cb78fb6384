//! Container backend driven through the docker CLI.
//!
//! One image per deployment attempt (`{slot}:{suffix}`), one container per
//! instance named after the deployment, labelled with the instance labels.
//! Each container gets a private data directory under `volume_root`
//! mounted at `volume_mount`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use modelgrid_core::config::{ContainerConfig, duration_or};
use modelgrid_core::types::label_keys;
use modelgrid_core::{BackendKind, BundleRef, DeploymentIdentity, InstanceLabels, RunningInstance};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::backend::RuntimeBackend;
use crate::command::{CommandRunner, args, run_checked};
use crate::error::{BackendError, BackendResult};

/// Seconds docker waits for a graceful stop before killing.
const STOP_GRACE_SECS: u32 = 10;

pub struct ContainerBackend {
    config: ContainerConfig,
    prefix: String,
    env_vars: BTreeMap<String, String>,
    runner: Arc<dyn CommandRunner>,
    build_timeout: Duration,
    command_timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Inspect {
    id: String,
    name: String,
    config: InspectConfig,
    state: InspectState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    image: String,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    running: bool,
}

impl ContainerBackend {
    pub fn new(
        config: ContainerConfig,
        prefix: impl Into<String>,
        env_vars: BTreeMap<String, String>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let build_timeout = duration_or(&config.build_timeout, Duration::from_secs(120));
        let command_timeout = duration_or(&config.command_timeout, Duration::from_secs(30));
        Self {
            config,
            prefix: prefix.into(),
            env_vars,
            runner,
            build_timeout,
            command_timeout,
        }
    }

    fn volume_path(&self, deployment_name: &str) -> PathBuf {
        self.config.volume_root.join(deployment_name)
    }

    async fn docker(&self, argv: Vec<String>) -> BackendResult<String> {
        let out =
            run_checked(self.runner.as_ref(), &self.config.docker, &argv, self.command_timeout)
                .await?;
        Ok(out.stdout)
    }

    async fn build(
        &self,
        tag: &str,
        context: &Path,
        build_args: &[(String, String)],
    ) -> BackendResult<()> {
        let mut argv = args(["build", "--rm", "--force-rm", "-t", tag]);
        for (k, v) in build_args {
            argv.push("--build-arg".to_string());
            argv.push(format!("{k}={v}"));
        }
        argv.push(context.display().to_string());

        let out = self
            .runner
            .run(&self.config.docker, &argv, self.build_timeout)
            .await
            .map_err(|e| BackendError::Build(format!("{tag}: {e}")))?;
        if !out.success() {
            return Err(BackendError::Build(format!("{tag}: {}", out.combined().trim())));
        }
        debug!(tag, "image built");
        Ok(())
    }

    /// Remove an image, treating "already gone" as success.
    async fn remove_image(&self, image: &str) -> BackendResult<()> {
        let out = self
            .runner
            .run(&self.config.docker, &args(["rmi", image]), self.command_timeout)
            .await?;
        if out.success() || out.stderr.contains("No such image") {
            return Ok(());
        }
        Err(BackendError::Command {
            program: self.config.docker.clone(),
            status: out.status,
            stderr: out.stderr.trim().to_string(),
        })
    }

    /// Empty the volume of a previous run with the same name, or create it.
    async fn reset_volume(&self, deployment_name: &str) -> BackendResult<PathBuf> {
        let path = self.volume_path(deployment_name);
        if tokio::fs::try_exists(&path).await? {
            let mut entries = tokio::fs::read_dir(&path).await?;
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                if entry.file_type().await?.is_dir() {
                    tokio::fs::remove_dir_all(entry.path()).await?;
                } else {
                    tokio::fs::remove_file(entry.path()).await?;
                }
            }
        } else {
            tokio::fs::create_dir_all(&path).await?;
        }
        Ok(path)
    }

    fn parse_inspect(&self, item: Inspect) -> Option<RunningInstance> {
        let deployment_name = item.name.trim_start_matches('/').to_string();
        if !deployment_name.starts_with(&format!("{}_", self.prefix)) {
            return None;
        }
        let labels = item.config.labels.unwrap_or_default();
        let pairs = labels.iter().map(|(k, v)| (k.as_str(), v.as_str()));
        let labels = match InstanceLabels::from_pairs(pairs) {
            Ok(Some(labels)) => labels,
            Ok(None) => {
                debug!(container = %deployment_name, "skipping container without labels");
                return None;
            }
            Err(e) => {
                warn!(
                    container = %deployment_name,
                    error = %e,
                    "skipping container with unreadable labels"
                );
                return None;
            }
        };
        debug!(container = %deployment_name, image = %item.config.image, "listed container");
        Some(RunningInstance {
            backend: BackendKind::Container,
            handle: item.id,
            deployment_name,
            labels,
            running: item.state.running,
        })
    }
}

#[async_trait]
impl RuntimeBackend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn prepare(
        &self,
        identity: &DeploymentIdentity,
        bundle: &BundleRef,
    ) -> BackendResult<()> {
        let image = identity.image_name();
        let user_args: Vec<(String, String)> = self
            .config
            .build_args
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        match &self.config.fix_layer {
            Some(fix_layer) => {
                let base = format!("{image}-tmp");
                self.build(&base, &bundle.path, &user_args).await?;
                let mut fix_args = user_args;
                fix_args.push(("BASE_IMAGE".to_string(), base));
                self.build(&image, fix_layer, &fix_args).await?;
            }
            None => self.build(&image, &bundle.path, &user_args).await?,
        }
        info!(%image, "container image ready");
        Ok(())
    }

    async fn discard_prepared(&self, identity: &DeploymentIdentity) -> BackendResult<()> {
        let image = identity.image_name();
        self.remove_image(&image).await?;
        if self.config.fix_layer.is_some() {
            self.remove_image(&format!("{image}-tmp")).await?;
        }
        Ok(())
    }

    async fn start(
        &self,
        identity: &DeploymentIdentity,
        _bundle: &BundleRef,
        labels: &InstanceLabels,
    ) -> BackendResult<RunningInstance> {
        let deployment_name = identity.deployment_name();
        let volume = self.reset_volume(&deployment_name).await?;
        let port = labels.args.port;

        let port_map = format!("{port}:{port}");
        let mount = format!("{}:{}:z", volume.display(), self.config.volume_mount);
        let mut argv = args([
            "run",
            "-d",
            "--name",
            deployment_name.as_str(),
            "-p",
            port_map.as_str(),
            "-v",
            mount.as_str(),
            "--ulimit",
            "core=0:0",
        ]);
        if let Some(user) = &self.config.user {
            argv.extend(args(["--user", user.as_str()]));
        }
        for (key, value) in labels.to_pairs() {
            argv.push("--label".to_string());
            argv.push(format!("{key}={value}"));
        }
        argv.push("--label".to_string());
        argv.push(format!("{}={deployment_name}", label_keys::DEPLOYMENT_NAME));
        for (key, value) in &self.env_vars {
            argv.push("-e".to_string());
            argv.push(format!("{key}={value}"));
        }
        argv.push(identity.image_name());
        argv.extend(labels.args.to_cli_args());

        let out = self
            .runner
            .run(&self.config.docker, &argv, self.command_timeout)
            .await
            .map_err(|e| BackendError::Run(e.to_string()))?;
        if !out.success() {
            return Err(BackendError::Run(out.combined().trim().to_string()));
        }

        let handle = out.stdout.trim().to_string();
        info!(%deployment_name, container = %handle, port, "container started");
        Ok(RunningInstance {
            backend: BackendKind::Container,
            handle,
            deployment_name,
            labels: labels.clone(),
            running: true,
        })
    }

    async fn restart(&self, instance: &RunningInstance) -> BackendResult<()> {
        self.docker(args(["start", instance.handle.as_str()])).await?;
        info!(deployment = %instance.deployment_name, "container restarted");
        Ok(())
    }

    async fn stop(&self, instance: &RunningInstance) -> BackendResult<()> {
        let grace = STOP_GRACE_SECS.to_string();
        self.docker(args(["stop", "-t", grace.as_str(), instance.handle.as_str()]))
            .await?;
        info!(deployment = %instance.deployment_name, "container stopped");
        Ok(())
    }

    async fn remove(&self, instance: &RunningInstance) -> BackendResult<()> {
        let image = self
            .docker(args(["inspect", "--format", "{{.Config.Image}}", instance.handle.as_str()]))
            .await
            .map(|s| s.trim().to_string())
            .ok();

        self.docker(args(["rm", "-f", instance.handle.as_str()])).await?;
        info!(deployment = %instance.deployment_name, "container removed");

        if let Some(image) = image.filter(|i| !i.is_empty()) {
            if let Err(e) = self.remove_image(&image).await {
                // Another container may still use it.
                warn!(%image, error = %e, "image not removed");
            }
            let intermediate = format!("{image}-tmp");
            if let Err(e) = self.remove_image(&intermediate).await {
                debug!(image = %intermediate, error = %e, "no intermediate image to remove");
            }
        }
        Ok(())
    }

    async fn list_instances(&self) -> BackendResult<Vec<RunningInstance>> {
        let filter = format!("label={}", label_keys::DEPLOYMENT_NAME);
        let ids = self
            .docker(args(["ps", "-a", "-q", "--no-trunc", "--filter", filter.as_str()]))
            .await?;
        let ids: Vec<&str> = ids.split_whitespace().collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut argv = args(["inspect"]);
        argv.extend(args(ids));
        let raw = self.docker(argv).await?;
        let items: Vec<Inspect> = serde_json::from_str(&raw)
            .map_err(|e| BackendError::Serialize(format!("docker inspect: {e}")))?;

        Ok(items.into_iter().filter_map(|item| self.parse_inspect(item)).collect())
    }

    async fn logs(&self, instance: &RunningInstance) -> BackendResult<String> {
        let tail = self.config.log_tail.to_string();
        let out = run_checked(
            self.runner.as_ref(),
            &self.config.docker,
            &args(["logs", "--tail", tail.as_str(), instance.handle.as_str()]),
            self.command_timeout,
        )
        .await?;
        Ok(out.combined())
    }

    async fn cleanup_side_effects(&self, instance: &RunningInstance) -> BackendResult<()> {
        let path = self.volume_path(&instance.deployment_name);
        if tokio::fs::try_exists(&path).await? {
            tokio::fs::remove_dir_all(&path).await?;
            debug!(volume = %path.display(), "volume removed");
        }
        Ok(())
    }
}
