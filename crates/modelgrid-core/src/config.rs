//! modelgrid.toml configuration parser.
//!
//! Every section has defaults, so an empty file is a valid configuration.
//! Durations are written as strings ("500ms", "2s", "4m").

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::identity::DEFAULT_PREFIX;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Namespace tag that starts every deployment name.
    pub prefix: String,
    pub server: ServerConfig,
    /// Variables injected into every container and session.
    pub env_vars: BTreeMap<String, String>,
    pub repository: RepositoryConfig,
    pub health: HealthConfig,
    pub port_check: PortCheckConfig,
    pub rollout: RolloutConfig,
    pub container: ContainerConfig,
    pub session: SessionConfig,
    pub schedule: Option<ScheduleConfig>,
    pub monitoring: Option<MonitoringConfig>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            server: ServerConfig::default(),
            env_vars: BTreeMap::new(),
            repository: RepositoryConfig::default(),
            health: HealthConfig::default(),
            port_check: PortCheckConfig::default(),
            rollout: RolloutConfig::default(),
            container: ContainerConfig::default(),
            session: SessionConfig::default(),
            schedule: None,
            monitoring: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Bundles live at `{root}/{name}/{version}/`.
    pub root: PathBuf,
    pub fetch_timeout: String,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/modelgrid/repository"),
            fetch_timeout: "30s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// HTTP path to probe.
    pub path: String,
    /// Host the model servers bind on.
    pub host: String,
    /// Per-attempt timeout.
    pub timeout: String,
    /// Attempts before a new instance is declared failed.
    pub retries: u32,
    /// First backoff interval; doubles per failed attempt.
    pub backoff_base: String,
    /// Backoff ceiling.
    pub backoff_max: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            path: "/healthz".to_string(),
            host: "127.0.0.1".to_string(),
            timeout: "1s".to_string(),
            retries: 20,
            backoff_base: "250ms".to_string(),
            backoff_max: "2s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortCheckConfig {
    pub retries: u32,
    pub interval: String,
}

impl Default for PortCheckConfig {
    fn default() -> Self {
        Self {
            retries: 4,
            interval: "1s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    /// Also stop same-stage instances before the port check.
    pub stop_stage_before_start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Container CLI binary.
    pub docker: String,
    /// Parent directory of per-deployment shared volumes.
    pub volume_root: PathBuf,
    /// Optional build context of a second "fix" stage built on top of the
    /// bundle image (receives `BASE_IMAGE` as build arg).
    pub fix_layer: Option<PathBuf>,
    pub build_args: BTreeMap<String, String>,
    pub build_timeout: String,
    pub command_timeout: String,
    pub user: Option<String>,
    /// Mount point of the shared volume inside the container.
    pub volume_mount: String,
    /// Lines of container log captured on failure.
    pub log_tail: u32,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            docker: "docker".to_string(),
            volume_root: PathBuf::from("/var/lib/modelgrid/volumes"),
            fix_layer: None,
            build_args: BTreeMap::new(),
            build_timeout: "120s".to_string(),
            command_timeout: "30s".to_string(),
            user: None,
            volume_mount: "/data".to_string(),
            log_tail: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub tmux: String,
    pub conda: String,
    /// Parent directory of per-deployment environments.
    pub env_root: PathBuf,
    pub provision_timeout: String,
    pub command_timeout: String,
    /// Serving command; args and bundle path are appended.
    pub serve_command: String,
    /// Always installed on top of the bundle's own packages.
    pub infrastructure_packages: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tmux: "tmux".to_string(),
            conda: "conda".to_string(),
            env_root: PathBuf::from("/var/lib/modelgrid/envs"),
            provision_timeout: "240s".to_string(),
            command_timeout: "30s".to_string(),
            serve_command: "bentoml serve-gunicorn".to_string(),
            infrastructure_packages: vec!["psycopg2-binary".to_string(), "boto3".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Directory watched by the external scheduler.
    pub job_dir: PathBuf,
    /// Job template copied as `{deployment_name}.py`.
    pub template: PathBuf,
    pub docker: String,
    /// Container hosting the scheduler's control CLI.
    pub control_container: String,
    /// Command that deletes a job; the job id is appended.
    pub delete_command: Vec<String>,
    pub command_timeout: String,
    /// Root key of the parameter file, as read by the job template.
    pub params_key: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            job_dir: PathBuf::from("/opt/airflow/dags"),
            template: PathBuf::from("/etc/modelgrid/dag_template.py"),
            docker: "docker".to_string(),
            control_container: "airflow".to_string(),
            delete_command: vec![
                "airflow".to_string(),
                "dags".to_string(),
                "delete".to_string(),
                "-y".to_string(),
            ],
            command_timeout: "30s".to_string(),
            params_key: "airflow".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Shared target list file (YAML sequence).
    pub targets_file: PathBuf,
    /// Host written into every target address.
    pub target_host: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            targets_file: PathBuf::from("/etc/prometheus/targets.yml"),
            target_host: "localhost".to_string(),
        }
    }
}

impl CoordinatorConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = Self::from_toml_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: CoordinatorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject unparsable durations and half-configured credentials.
    pub fn validate(&self) -> CoreResult<()> {
        let mut durations = vec![
            ("repository.fetch_timeout", &self.repository.fetch_timeout),
            ("health.timeout", &self.health.timeout),
            ("health.backoff_base", &self.health.backoff_base),
            ("health.backoff_max", &self.health.backoff_max),
            ("port_check.interval", &self.port_check.interval),
            ("container.build_timeout", &self.container.build_timeout),
            ("container.command_timeout", &self.container.command_timeout),
            ("session.provision_timeout", &self.session.provision_timeout),
            ("session.command_timeout", &self.session.command_timeout),
        ];
        if let Some(schedule) = &self.schedule {
            if schedule.params_key.trim().is_empty() {
                return Err(CoreError::InvalidConfig(
                    "schedule.params_key must not be empty".to_string(),
                ));
            }
            durations.push(("schedule.command_timeout", &schedule.command_timeout));
        }
        for (field, value) in durations {
            if parse_duration(value).is_none() {
                return Err(CoreError::InvalidConfig(format!(
                    "{field}: cannot parse duration {value:?}"
                )));
            }
        }
        if self.server.username.is_some() != self.server.password.is_some() {
            return Err(CoreError::InvalidConfig(
                "server.username and server.password must be set together".to_string(),
            ));
        }
        if self.health.retries == 0 {
            return Err(CoreError::InvalidConfig("health.retries must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Duration accessor with a fallback, for fields already validated.
pub fn duration_or(value: &str, fallback: Duration) -> Duration {
    parse_duration(value).unwrap_or(fallback)
}

/// Parse a duration string like "5s", "500ms", "1m".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
