//! Session backend: one tmux session per instance, serving from a private
//! conda environment.
//!
//! tmux has no labels, so instance labels are stored as session
//! environment variables (`model_name`, `model_version`, ...) and read back
//! with `show-environment`. `model_running` tracks whether the server in
//! the session was interrupted.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use modelgrid_core::config::{SessionConfig, duration_or};
use modelgrid_core::{
    BackendKind, BundleRef, DeploymentIdentity, InstanceLabels, RunningInstance, ServeArgs,
};
use tracing::{debug, info, warn};

use crate::backend::RuntimeBackend;
use crate::command::{CommandRunner, args, run_checked};
use crate::error::{BackendError, BackendResult};

const LABEL_VAR_PREFIX: &str = "model_";
const RUNNING_VAR: &str = "model_running";
const CONDA_PREFIX_VAR: &str = "model_conda_prefix";
const BUNDLE_VAR: &str = "model_bundle";
const LOG_LINES: u32 = 200;

pub struct SessionBackend {
    config: SessionConfig,
    prefix: String,
    env_vars: BTreeMap<String, String>,
    runner: Arc<dyn CommandRunner>,
    provision_timeout: Duration,
    command_timeout: Duration,
}

impl SessionBackend {
    pub fn new(
        config: SessionConfig,
        prefix: impl Into<String>,
        env_vars: BTreeMap<String, String>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let provision_timeout = duration_or(&config.provision_timeout, Duration::from_secs(240));
        let command_timeout = duration_or(&config.command_timeout, Duration::from_secs(30));
        Self {
            config,
            prefix: prefix.into(),
            env_vars,
            runner,
            provision_timeout,
            command_timeout,
        }
    }

    fn env_prefix(&self, deployment_name: &str) -> PathBuf {
        self.config.env_root.join(deployment_name)
    }

    async fn tmux(&self, argv: Vec<String>) -> BackendResult<String> {
        let out =
            run_checked(self.runner.as_ref(), &self.config.tmux, &argv, self.command_timeout)
                .await?;
        Ok(out.stdout)
    }

    /// conda `environment.yml` for a bundle: its python version plus its
    /// pip packages and the infrastructure packages.
    fn environment_file(&self, deployment_name: &str, bundle: &BundleRef) -> BackendResult<String> {
        let mut pip = bundle.manifest.pip_packages.clone();
        for package in &self.config.infrastructure_packages {
            if !pip.contains(package) {
                pip.push(package.clone());
            }
        }
        let doc = serde_json::json!({
            "name": deployment_name,
            "channels": ["defaults"],
            "dependencies": [
                format!("python={}", bundle.manifest.python_version),
                "pip",
                { "pip": pip },
            ],
        });
        serde_yaml::to_string(&doc).map_err(|e| BackendError::Serialize(e.to_string()))
    }

    async fn remove_env(&self, prefix: &Path) -> BackendResult<()> {
        if !tokio::fs::try_exists(prefix).await? {
            return Ok(());
        }
        let prefix_arg = prefix.display().to_string();
        let removed = run_checked(
            self.runner.as_ref(),
            &self.config.conda,
            &args(["env", "remove", "--yes", "--prefix", prefix_arg.as_str()]),
            self.provision_timeout,
        )
        .await;
        if let Err(e) = removed {
            warn!(prefix = %prefix_arg, error = %e, "conda env remove failed, deleting directory");
        }
        if tokio::fs::try_exists(prefix).await? {
            tokio::fs::remove_dir_all(prefix).await?;
        }
        debug!(prefix = %prefix_arg, "environment removed");
        Ok(())
    }

    /// Type the activate and serve commands into the session.
    async fn launch(
        &self,
        session: &str,
        conda_prefix: &str,
        bundle: &str,
        serve: &ServeArgs,
    ) -> BackendResult<()> {
        let activate = format!("conda activate {}", shell_quote(conda_prefix));
        self.tmux(args(["send-keys", "-t", session, activate.as_str(), "Enter"]))
            .await?;

        let mut command = Vec::new();
        if !self.env_vars.is_empty() {
            command.push("env".to_string());
            command.extend(self.env_vars.iter().map(|(k, v)| format!("{k}={}", shell_quote(v))));
        }
        command.push(self.config.serve_command.clone());
        command.extend(serve.to_cli_args().iter().map(|a| shell_quote(a)));
        command.push(shell_quote(bundle));
        let command = command.join(" ");

        self.tmux(args(["send-keys", "-t", session, command.as_str(), "Enter"]))
            .await?;
        Ok(())
    }

    async fn set_var(&self, session: &str, key: &str, value: &str) -> BackendResult<()> {
        self.tmux(args(["set-environment", "-t", session, key, value])).await?;
        Ok(())
    }

    async fn session_env(&self, session: &str) -> BackendResult<HashMap<String, String>> {
        let raw = self.tmux(args(["show-environment", "-t", session])).await?;
        Ok(parse_environment(&raw))
    }

    fn instance_from_env(
        &self,
        session: &str,
        env: &HashMap<String, String>,
    ) -> Option<RunningInstance> {
        let pairs = env
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(LABEL_VAR_PREFIX).map(|k| (k, v.as_str())));
        let labels = match InstanceLabels::from_pairs(pairs) {
            Ok(Some(labels)) => labels,
            Ok(None) => return None,
            Err(e) => {
                warn!(session, error = %e, "skipping session with unreadable labels");
                return None;
            }
        };
        Some(RunningInstance {
            backend: BackendKind::Session,
            handle: session.to_string(),
            deployment_name: session.to_string(),
            labels,
            running: env.get(RUNNING_VAR).is_some_and(|v| v == "1"),
        })
    }
}

/// `KEY=VALUE` lines; `-KEY` (unset) lines are ignored.
fn parse_environment(raw: &str) -> HashMap<String, String> {
    raw.lines()
        .filter(|l| !l.starts_with('-'))
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Single-quote for a POSIX shell unless the word is plainly safe.
fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_=./:@,+".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

#[async_trait]
impl RuntimeBackend for SessionBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Session
    }

    async fn prepare(
        &self,
        identity: &DeploymentIdentity,
        bundle: &BundleRef,
    ) -> BackendResult<()> {
        let deployment_name = identity.deployment_name();
        let prefix = self.env_prefix(&deployment_name);
        tokio::fs::create_dir_all(&self.config.env_root).await?;

        let spec_path = self
            .config
            .env_root
            .join(format!("{deployment_name}.environment.yml"));
        tokio::fs::write(&spec_path, self.environment_file(&deployment_name, bundle)?).await?;

        let prefix_arg = prefix.display().to_string();
        let spec_arg = spec_path.display().to_string();
        let argv = args([
            "env",
            "create",
            "--prefix",
            prefix_arg.as_str(),
            "--file",
            spec_arg.as_str(),
        ]);
        let created = self
            .runner
            .run(&self.config.conda, &argv, self.provision_timeout)
            .await;
        if let Err(e) = tokio::fs::remove_file(&spec_path).await {
            warn!(path = %spec_path.display(), error = %e, "environment spec not removed");
        }

        match created {
            Ok(out) if out.success() => {
                info!(%deployment_name, prefix = %prefix_arg, "environment provisioned");
                Ok(())
            }
            Ok(out) => Err(BackendError::Provision(out.combined().trim().to_string())),
            Err(e) => Err(BackendError::Provision(e.to_string())),
        }
    }

    async fn discard_prepared(&self, identity: &DeploymentIdentity) -> BackendResult<()> {
        self.remove_env(&self.env_prefix(&identity.deployment_name())).await
    }

    async fn start(
        &self,
        identity: &DeploymentIdentity,
        bundle: &BundleRef,
        labels: &InstanceLabels,
    ) -> BackendResult<RunningInstance> {
        let session = identity.deployment_name();
        let conda_prefix = self.env_prefix(&session).display().to_string();
        let bundle_path = bundle.path.display().to_string();

        let started = async {
            self.tmux(args(["new-session", "-d", "-s", session.as_str()])).await?;
            for (key, value) in labels.to_pairs() {
                self.set_var(&session, &format!("{LABEL_VAR_PREFIX}{key}"), &value).await?;
            }
            self.set_var(&session, CONDA_PREFIX_VAR, &conda_prefix).await?;
            self.set_var(&session, BUNDLE_VAR, &bundle_path).await?;
            self.launch(&session, &conda_prefix, &bundle_path, &labels.args).await?;
            self.set_var(&session, RUNNING_VAR, "1").await
        }
        .await;
        started.map_err(|e| BackendError::Run(e.to_string()))?;

        info!(%session, port = labels.args.port, "session started");
        Ok(RunningInstance {
            backend: BackendKind::Session,
            handle: session.clone(),
            deployment_name: session,
            labels: labels.clone(),
            running: true,
        })
    }

    async fn restart(&self, instance: &RunningInstance) -> BackendResult<()> {
        let env = self.session_env(&instance.handle).await?;
        let (Some(conda_prefix), Some(bundle)) = (env.get(CONDA_PREFIX_VAR), env.get(BUNDLE_VAR))
        else {
            return Err(BackendError::NotFound(format!(
                "{}: session has no launch environment",
                instance.handle
            )));
        };
        self.launch(&instance.handle, conda_prefix, bundle, &instance.labels.args)
            .await?;
        self.set_var(&instance.handle, RUNNING_VAR, "1").await?;
        info!(session = %instance.handle, "session restarted");
        Ok(())
    }

    async fn stop(&self, instance: &RunningInstance) -> BackendResult<()> {
        self.tmux(args(["send-keys", "-t", instance.handle.as_str(), "C-c"]))
            .await?;
        self.set_var(&instance.handle, RUNNING_VAR, "0").await?;
        info!(session = %instance.handle, "session stopped");
        Ok(())
    }

    async fn remove(&self, instance: &RunningInstance) -> BackendResult<()> {
        if instance.running {
            if let Err(e) = self
                .tmux(args(["send-keys", "-t", instance.handle.as_str(), "C-c"]))
                .await
            {
                // kill-session below ends the process either way.
                debug!(session = %instance.handle, error = %e, "interrupt before removal failed");
            }
        }
        self.tmux(args(["kill-session", "-t", instance.handle.as_str()]))
            .await?;
        info!(session = %instance.handle, "session removed");
        Ok(())
    }

    async fn list_instances(&self) -> BackendResult<Vec<RunningInstance>> {
        let out = self
            .runner
            .run(
                &self.config.tmux,
                &args(["list-sessions", "-F", "#{session_name}"]),
                self.command_timeout,
            )
            .await?;
        if !out.success() {
            // No tmux server means no sessions.
            debug!(stderr = %out.stderr.trim(), "tmux list-sessions failed");
            return Ok(Vec::new());
        }

        let own = format!("{}_", self.prefix);
        let mut instances = Vec::new();
        for session in out.stdout.lines().map(str::trim).filter(|s| s.starts_with(&own)) {
            match self.session_env(session).await {
                Ok(env) => instances.extend(self.instance_from_env(session, &env)),
                Err(e) => warn!(session, error = %e, "cannot read session environment"),
            }
        }
        Ok(instances)
    }

    async fn logs(&self, instance: &RunningInstance) -> BackendResult<String> {
        let start = format!("-{LOG_LINES}");
        let handle = instance.handle.as_str();
        self.tmux(args(["capture-pane", "-p", "-t", handle, "-S", start.as_str()]))
            .await
    }

    async fn cleanup_side_effects(&self, instance: &RunningInstance) -> BackendResult<()> {
        self.remove_env(&self.env_prefix(&instance.deployment_name)).await
    }
}

#[cfg(test)]
mod tests {
    use modelgrid_core::{DependencyManifest, Stage};

    use super::*;
    use crate::command::CommandOutput;
    use crate::command::fake::ScriptedRunner;

    fn identity() -> DeploymentIdentity {
        DeploymentIdentity::new("bentoml", "churn", Stage::Production, Some("7"), Some("zz99aa00"))
            .unwrap()
    }

    fn bundle() -> BundleRef {
        BundleRef {
            name: "churn".into(),
            version: "7".into(),
            path: PathBuf::from("/models/churn/7"),
            manifest: DependencyManifest {
                python_version: "3.8.10".into(),
                pip_packages: vec!["scikit-learn==1.0".into(), "boto3".into()],
            },
        }
    }

    fn backend(root: &Path, runner: Arc<ScriptedRunner>) -> SessionBackend {
        let config = SessionConfig {
            env_root: root.to_path_buf(),
            ..SessionConfig::default()
        };
        let env = BTreeMap::from([("DB_URL".to_string(), "postgres://db".to_string())]);
        SessionBackend::new(config, "bentoml", env, runner)
    }

    #[test]
    fn environment_file_merges_infrastructure_packages() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new(|_, _| CommandOutput::ok("")));
        let yaml = backend(dir.path(), runner).environment_file("x", &bundle()).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        let deps = doc["dependencies"].as_sequence().unwrap();
        assert_eq!(deps[0].as_str(), Some("python=3.8.10"));
        let pip: Vec<&str> = deps[2]["pip"]
            .as_sequence()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert_eq!(pip, vec!["scikit-learn==1.0", "boto3", "psycopg2-binary"]);
    }

    #[tokio::test]
    async fn failed_provisioning_is_a_provision_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new(|program, _| {
            if program == "conda" {
                CommandOutput::failed(1, "ResolvePackageNotFound")
            } else {
                CommandOutput::ok("")
            }
        }));
        let err = backend(dir.path(), runner)
            .prepare(&identity(), &bundle())
            .await
            .unwrap_err();
        assert!(
            matches!(err, BackendError::Provision(msg) if msg.contains("ResolvePackageNotFound"))
        );
        // The generated environment file does not linger.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn start_records_labels_and_launches_server() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new(|_, _| CommandOutput::ok("")));
        let b = backend(dir.path(), runner.clone());
        let id = identity();
        let labels = id.labels(&ServeArgs::with_port(5010), true);

        let inst = b.start(&id, &bundle(), &labels).await.unwrap();
        assert_eq!(inst.handle, "bentoml_churn_production_zz99aa00");

        let sets = runner.calls_starting_with(&["tmux", "set-environment"]);
        assert!(sets.iter().any(|c| c[4] == "model_stage" && c[5] == "production"));
        assert!(sets.iter().any(|c| c[4] == "model_batch_prediction" && c[5] == "true"));
        assert!(sets.iter().any(|c| c[4] == "model_running" && c[5] == "1"));

        let keys = runner.calls_starting_with(&["tmux", "send-keys"]);
        assert!(keys[0][4].starts_with("conda activate "));
        let serve = "env DB_URL=postgres://db bentoml serve-gunicorn --port=5010 --workers=1";
        assert_eq!(keys[1][4], format!("{serve} /models/churn/7"));
    }

    #[tokio::test]
    async fn list_reads_labels_from_session_environment() {
        let runner = Arc::new(ScriptedRunner::new(|_, argv| match argv[0].as_str() {
            "list-sessions" => CommandOutput::ok("bentoml_churn_production_zz99aa00\nscratch\n"),
            "show-environment" => CommandOutput::ok(
                "model_name=churn\nmodel_version=7\nmodel_stage=production\n\
                 model_args={\"port\":5010,\"workers\":2}\nmodel_running=0\n-OLDVAR\n",
            ),
            _ => CommandOutput::failed(1, "unexpected"),
        }));
        let dir = tempfile::tempdir().unwrap();
        let b = backend(dir.path(), runner.clone());

        let all = b.list_instances().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].port(), 5010);
        assert_eq!(all[0].labels.args.workers, 2);
        assert!(!all[0].running);
        // Foreign sessions are never inspected.
        assert_eq!(runner.calls_starting_with(&["tmux", "show-environment"]).len(), 1);
    }

    #[tokio::test]
    async fn no_tmux_server_lists_nothing() {
        let runner =
            Arc::new(ScriptedRunner::new(|_, _| CommandOutput::failed(1, "no server running")));
        let dir = tempfile::tempdir().unwrap();
        assert!(backend(dir.path(), runner).list_instances().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stop_interrupts_and_marks_stopped() {
        let runner = Arc::new(ScriptedRunner::new(|_, _| CommandOutput::ok("")));
        let dir = tempfile::tempdir().unwrap();
        let b = backend(dir.path(), runner.clone());
        let id = identity();
        let inst = RunningInstance {
            backend: BackendKind::Session,
            handle: id.deployment_name(),
            deployment_name: id.deployment_name(),
            labels: id.labels(&ServeArgs::default(), false),
            running: true,
        };

        b.stop(&inst).await.unwrap();

        let calls = runner.calls();
        assert_eq!(calls[0][1..], ["send-keys", "-t", inst.handle.as_str(), "C-c"]);
        assert_eq!(calls[1][4..], ["model_running", "0"]);
    }

    #[tokio::test]
    async fn remove_kills_the_session_when_the_interrupt_fails() {
        let runner = Arc::new(ScriptedRunner::new(|_, argv| match argv[0].as_str() {
            "send-keys" => CommandOutput::failed(1, "pane is dead"),
            _ => CommandOutput::ok(""),
        }));
        let dir = tempfile::tempdir().unwrap();
        let b = backend(dir.path(), runner.clone());
        let id = identity();
        let inst = RunningInstance {
            backend: BackendKind::Session,
            handle: id.deployment_name(),
            deployment_name: id.deployment_name(),
            labels: id.labels(&ServeArgs::default(), false),
            running: true,
        };

        b.remove(&inst).await.unwrap();
        let killed = runner.calls_starting_with(&["tmux", "kill-session"]);
        assert_eq!(killed.len(), 1);
        assert_eq!(killed[0][3], inst.handle);
    }

    #[tokio::test]
    async fn cleanup_removes_environment_directory() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new(|_, _| CommandOutput::failed(1, "conda broken")));
        let b = backend(dir.path(), runner);
        let id = identity();
        let env_dir = dir.path().join(id.deployment_name());
        std::fs::create_dir_all(env_dir.join("bin")).unwrap();
        let inst = RunningInstance {
            backend: BackendKind::Session,
            handle: id.deployment_name(),
            deployment_name: id.deployment_name(),
            labels: id.labels(&ServeArgs::default(), false),
            running: false,
        };

        b.cleanup_side_effects(&inst).await.unwrap();
        assert!(!env_dir.exists());
    }

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("--port=5000"), "--port=5000");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
