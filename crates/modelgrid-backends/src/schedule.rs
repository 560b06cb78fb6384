//! Scheduled-job backend.
//!
//! Batch-prediction deployments get a job in an external workflow
//! scheduler. A job is two files in the scheduler's job directory: the
//! job template copied as `{deployment_name}.py` and its parameters in
//! `{deployment_name}.yaml`. Removing a job deletes both files and tells
//! the scheduler to forget it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule;
use modelgrid_core::config::{ScheduleConfig, duration_or};
use modelgrid_core::{BackendKind, ModelSummary, RunningInstance, Stage};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backend::{DependentBackend, Registration};
use crate::command::{CommandRunner, args};
use crate::error::{BackendError, BackendResult};

/// Outcome of asking the scheduler to delete a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDeletion {
    Deleted,
    /// The scheduler never knew the job. Not an error.
    NotFound,
}

/// Control channel to the external scheduler.
#[async_trait]
pub trait SchedulerControl: Send + Sync {
    async fn delete_job(&self, job_id: &str) -> BackendResult<JobDeletion>;
}

/// Runs the scheduler's delete command inside its container.
pub struct ContainerSchedulerControl {
    docker: String,
    container: String,
    delete_command: Vec<String>,
    timeout: Duration,
    runner: Arc<dyn CommandRunner>,
}

impl ContainerSchedulerControl {
    pub fn new(config: &ScheduleConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            docker: config.docker.clone(),
            container: config.control_container.clone(),
            delete_command: config.delete_command.clone(),
            timeout: duration_or(&config.command_timeout, Duration::from_secs(30)),
            runner,
        }
    }
}

#[async_trait]
impl SchedulerControl for ContainerSchedulerControl {
    async fn delete_job(&self, job_id: &str) -> BackendResult<JobDeletion> {
        let mut argv = args(["exec", self.container.as_str()]);
        argv.extend(self.delete_command.iter().cloned());
        argv.push(job_id.to_string());

        let out = self.runner.run(&self.docker, &argv, self.timeout).await?;
        if out.success() {
            return Ok(JobDeletion::Deleted);
        }
        let text = out.combined();
        if text.to_ascii_lowercase().contains("not found") {
            return Ok(JobDeletion::NotFound);
        }
        Err(BackendError::Command {
            program: self.docker.clone(),
            status: out.status,
            stderr: text.trim().to_string(),
        })
    }
}

/// Keys written by the backend; a job definition cannot override them.
const RESERVED_KEYS: [&str; 5] = ["model", "version", "stage", "deployment_name", "start_date"];

/// Contents of `{deployment_name}.yaml`, nested under `params_key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobSpec {
    model: String,
    version: String,
    stage: Stage,
    deployment_name: String,
    start_date: String,
    /// Caller-supplied job definition (schedule, inputs, outputs, ...).
    #[serde(flatten)]
    definition: serde_json::Map<String, serde_json::Value>,
}

/// Map a preset such as `@daily` to its five-field expression. `@once`
/// and a missing interval have no recurring schedule.
fn normalize_interval(interval: Option<&str>) -> Option<String> {
    let interval = interval?.trim();
    let expr = match interval {
        "" | "@once" => return None,
        "@hourly" => "0 * * * *",
        "@daily" => "0 0 * * *",
        "@weekly" => "0 0 * * Sun",
        "@monthly" => "0 0 1 * *",
        "@quarterly" => "0 0 1 */3 *",
        "@yearly" | "@annually" => "0 0 1 1 *",
        other => other,
    };
    Some(expr.to_string())
}

/// Most recent fire time of `expr` before `now`.
fn previous_fire(expr: &str, now: DateTime<Utc>) -> BackendResult<Option<DateTime<Utc>>> {
    // The cron crate expects a leading seconds field.
    let expr = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    let schedule = Schedule::from_str(&expr)
        .map_err(|e| BackendError::Serialize(format!("schedule_interval {expr:?}: {e}")))?;
    Ok(schedule.after(&now).next_back())
}

/// Start date of a new job: the previous fire time of its schedule, or one
/// day ago when it has none.
fn start_date_for(interval: Option<&str>, now: DateTime<Utc>) -> BackendResult<DateTime<Utc>> {
    let fallback = now - ChronoDuration::days(1);
    match normalize_interval(interval) {
        Some(expr) => Ok(previous_fire(&expr, now)?.unwrap_or(fallback)),
        None => Ok(fallback),
    }
}

pub struct ScheduleBackend {
    config: ScheduleConfig,
    prefix: String,
    control: Arc<dyn SchedulerControl>,
    // Job files are rewritten as a set; one writer at a time.
    lock: Mutex<()>,
}

impl ScheduleBackend {
    pub fn new(
        config: ScheduleConfig,
        prefix: impl Into<String>,
        control: Arc<dyn SchedulerControl>,
    ) -> Self {
        Self {
            config,
            prefix: prefix.into(),
            control,
            lock: Mutex::new(()),
        }
    }

    fn job_file(&self, deployment_name: &str) -> PathBuf {
        self.config.job_dir.join(format!("{deployment_name}.py"))
    }

    fn params_file(&self, deployment_name: &str) -> PathBuf {
        self.config.job_dir.join(format!("{deployment_name}.yaml"))
    }

    async fn read_jobs(&self) -> BackendResult<Vec<JobSpec>> {
        if !tokio::fs::try_exists(&self.config.job_dir).await? {
            return Ok(Vec::new());
        }
        let own = format!("{}_", self.prefix);
        let mut jobs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.config.job_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_own_params = path.extension().is_some_and(|e| e == "yaml")
                && path
                    .file_stem()
                    .is_some_and(|s| s.to_string_lossy().starts_with(&own));
            if !is_own_params {
                continue;
            }
            let raw = tokio::fs::read_to_string(&path).await?;
            match self.parse_params(&raw) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable job parameters")
                }
            }
        }
        jobs.sort_by(|a, b| a.deployment_name.cmp(&b.deployment_name));
        Ok(jobs)
    }

    fn parse_params(&self, raw: &str) -> Result<JobSpec, String> {
        let mut doc: BTreeMap<String, serde_yaml::Value> =
            serde_yaml::from_str(raw).map_err(|e| e.to_string())?;
        let spec = doc
            .remove(&self.config.params_key)
            .ok_or_else(|| format!("missing key {:?}", self.config.params_key))?;
        serde_yaml::from_value(spec).map_err(|e| e.to_string())
    }

    /// Delete the job files and notify the scheduler. Returns whether
    /// anything existed locally.
    async fn delete_job(&self, deployment_name: &str, notify_anyway: bool) -> BackendResult<bool> {
        let mut existed = false;
        for path in [self.job_file(deployment_name), self.params_file(deployment_name)] {
            if tokio::fs::try_exists(&path).await? {
                tokio::fs::remove_file(&path).await?;
                existed = true;
            }
        }
        if !existed && !notify_anyway {
            return Ok(false);
        }
        match self.control.delete_job(deployment_name).await {
            Ok(JobDeletion::Deleted) => info!(job = %deployment_name, "scheduled job deleted"),
            Ok(JobDeletion::NotFound) => {
                warn!(job = %deployment_name, "scheduler does not know the job")
            }
            Err(e) => warn!(job = %deployment_name, error = %e, "scheduler delete failed"),
        }
        Ok(existed)
    }
}

#[async_trait]
impl DependentBackend for ScheduleBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Schedule
    }

    async fn register(&self, registration: Registration<'_>) -> BackendResult<bool> {
        let labels = registration.labels;
        if !labels.batch_prediction {
            return Ok(false);
        }
        let Some(job) = registration.job else {
            warn!(
                deployment = %registration.deployment_name,
                "batch deployment without job definition"
            );
            return Ok(false);
        };
        let definition = match job {
            serde_json::Value::Object(map) => map.clone(),
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                return Err(BackendError::Serialize(format!(
                    "job definition must be a mapping, got {other}"
                )));
            }
        };

        let _guard = self.lock.lock().await;

        if !tokio::fs::try_exists(&self.config.template).await? {
            return Err(BackendError::NotFound(format!(
                "job template {}",
                self.config.template.display()
            )));
        }
        tokio::fs::create_dir_all(&self.config.job_dir).await?;

        let start_date = match definition.get("start_date").and_then(|v| v.as_str()) {
            Some(given) => given.to_string(),
            None => {
                let interval = definition.get("schedule_interval").and_then(|v| v.as_str());
                start_date_for(interval, Utc::now())?.to_rfc3339()
            }
        };
        let spec = JobSpec {
            model: labels.name.clone(),
            version: labels.version.clone(),
            stage: labels.stage,
            deployment_name: registration.deployment_name.to_string(),
            start_date,
            definition: definition
                .into_iter()
                .filter(|(k, _)| !RESERVED_KEYS.contains(&k.as_str()))
                .collect(),
        };
        // Superseded jobs are removed through `remove_for`; the same slot
        // may hold one job per runtime backend.
        let params = BTreeMap::from([(self.config.params_key.as_str(), spec)]);
        let yaml =
            serde_yaml::to_string(&params).map_err(|e| BackendError::Serialize(e.to_string()))?;

        tokio::fs::copy(&self.config.template, self.job_file(registration.deployment_name)).await?;
        tokio::fs::write(self.params_file(registration.deployment_name), yaml).await?;
        info!(job = %registration.deployment_name, "scheduled job registered");
        Ok(true)
    }

    async fn remove_for(&self, removed: &[RunningInstance]) -> BackendResult<Vec<String>> {
        let _guard = self.lock.lock().await;
        let mut dropped = Vec::new();
        for instance in removed {
            let existed = self
                .delete_job(&instance.deployment_name, instance.labels.batch_prediction)
                .await?;
            if existed {
                dropped.push(instance.deployment_name.clone());
            } else {
                debug!(deployment = %instance.deployment_name, "no scheduled job to remove");
            }
        }
        Ok(dropped)
    }

    async fn list_entries(&self) -> BackendResult<Vec<ModelSummary>> {
        Ok(self
            .read_jobs()
            .await?
            .into_iter()
            .map(|job| ModelSummary {
                name: job.model,
                version: job.version,
                stage: job.stage,
                deployment_name: Some(job.deployment_name),
                args: None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use modelgrid_core::{DeploymentIdentity, ServeArgs};

    use super::*;

    #[derive(Default)]
    struct RecordingControl {
        deleted: StdMutex<Vec<String>>,
        answer_not_found: bool,
    }

    #[async_trait]
    impl SchedulerControl for RecordingControl {
        async fn delete_job(&self, job_id: &str) -> BackendResult<JobDeletion> {
            self.deleted.lock().unwrap().push(job_id.to_string());
            Ok(if self.answer_not_found {
                JobDeletion::NotFound
            } else {
                JobDeletion::Deleted
            })
        }
    }

    fn setup(control: Arc<RecordingControl>) -> (tempfile::TempDir, ScheduleBackend) {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("template.py");
        std::fs::write(&template, "# job template\n").unwrap();
        let config = ScheduleConfig {
            job_dir: dir.path().join("dags"),
            template,
            ..ScheduleConfig::default()
        };
        (dir, ScheduleBackend::new(config, "bentoml", control))
    }

    fn identity(version: &str, suffix: &str) -> DeploymentIdentity {
        DeploymentIdentity::new("bentoml", "churn", Stage::Production, Some(version), Some(suffix))
            .unwrap()
    }

    fn instance(id: &DeploymentIdentity, batch: bool) -> RunningInstance {
        RunningInstance {
            backend: BackendKind::Container,
            handle: id.suffix.clone(),
            deployment_name: id.deployment_name(),
            labels: id.labels(&ServeArgs::default(), batch),
            running: false,
        }
    }

    #[tokio::test]
    async fn register_writes_job_and_params() {
        let control = Arc::new(RecordingControl::default());
        let (dir, backend) = setup(control);
        let id = identity("7", "aaaa0001");
        let labels = id.labels(&ServeArgs::default(), true);
        let job = serde_json::json!({"schedule_interval": "@daily", "input": "s3://in"});

        let registered = backend
            .register(Registration {
                deployment_name: &id.deployment_name(),
                labels: &labels,
                job: Some(&job),
            })
            .await
            .unwrap();
        assert!(registered);

        let dags = dir.path().join("dags");
        assert!(dags.join(format!("{}.py", id.deployment_name())).exists());
        let params_file = dags.join(format!("{}.yaml", id.deployment_name()));
        let raw = std::fs::read_to_string(params_file).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&raw).unwrap();
        let params = &doc["airflow"];
        assert_eq!(params["model"].as_str(), Some("churn"));
        assert_eq!(params["stage"].as_str(), Some("production"));
        assert_eq!(params["schedule_interval"].as_str(), Some("@daily"));
        let start = DateTime::parse_from_rfc3339(params["start_date"].as_str().unwrap()).unwrap();
        assert_eq!(start.format("%H:%M:%S").to_string(), "00:00:00");

        let listed = backend.list_entries().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].version, "7");
    }

    #[tokio::test]
    async fn online_deployments_get_no_job() {
        let (dir, backend) = setup(Arc::new(RecordingControl::default()));
        let id = identity("7", "aaaa0001");
        let labels = id.labels(&ServeArgs::default(), false);
        let registered = backend
            .register(Registration {
                deployment_name: &id.deployment_name(),
                labels: &labels,
                job: Some(&serde_json::json!({})),
            })
            .await
            .unwrap();
        assert!(!registered);
        assert!(!dir.path().join("dags").exists());
    }

    #[tokio::test]
    async fn register_leaves_other_jobs_of_the_slot() {
        let control = Arc::new(RecordingControl::default());
        let (_dir, backend) = setup(control.clone());
        let job = serde_json::json!({});
        for (version, suffix) in [("7", "aaaa0001"), ("7", "bbbb0002"), ("7", "aaaa0001")] {
            let id = identity(version, suffix);
            let labels = id.labels(&ServeArgs::default(), true);
            backend
                .register(Registration {
                    deployment_name: &id.deployment_name(),
                    labels: &labels,
                    job: Some(&job),
                })
                .await
                .unwrap();
        }

        let listed = backend.list_entries().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(control.deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn params_key_is_configurable() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("template.py");
        std::fs::write(&template, "# job template\n").unwrap();
        let config = ScheduleConfig {
            job_dir: dir.path().join("dags"),
            template,
            params_key: "batch".into(),
            ..ScheduleConfig::default()
        };
        let backend =
            ScheduleBackend::new(config, "bentoml", Arc::new(RecordingControl::default()));
        let id = identity("7", "aaaa0001");
        let labels = id.labels(&ServeArgs::default(), true);
        backend
            .register(Registration {
                deployment_name: &id.deployment_name(),
                labels: &labels,
                job: Some(&serde_json::json!({"start_date": "2024-01-01T00:00:00+00:00"})),
            })
            .await
            .unwrap();

        let params_file = dir.path().join("dags").join(format!("{}.yaml", id.deployment_name()));
        let raw = std::fs::read_to_string(params_file).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&raw).unwrap();
        assert_eq!(doc["batch"]["start_date"].as_str(), Some("2024-01-01T00:00:00+00:00"));
        assert!(doc.get("airflow").is_none());
        assert_eq!(backend.list_entries().await.unwrap().len(), 1);
    }

    fn at(text: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(text).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn presets_start_at_their_previous_tick() {
        let now = at("2024-05-15T10:20:00Z");
        assert_eq!(start_date_for(Some("@daily"), now).unwrap(), at("2024-05-15T00:00:00Z"));
        assert_eq!(start_date_for(Some("@hourly"), now).unwrap(), at("2024-05-15T10:00:00Z"));
        assert_eq!(start_date_for(Some("@monthly"), now).unwrap(), at("2024-05-01T00:00:00Z"));
        assert_eq!(start_date_for(Some("@quarterly"), now).unwrap(), at("2024-04-01T00:00:00Z"));
        assert_eq!(start_date_for(Some("@yearly"), now).unwrap(), at("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn plain_expressions_start_at_their_previous_tick() {
        let now = at("2024-05-15T10:20:00Z");
        assert_eq!(start_date_for(Some("30 2 * * *"), now).unwrap(), at("2024-05-15T02:30:00Z"));
        assert_eq!(start_date_for(Some("45 11 * * *"), now).unwrap(), at("2024-05-14T11:45:00Z"));
    }

    #[test]
    fn unscheduled_jobs_start_a_day_ago() {
        let now = at("2024-05-15T10:20:00Z");
        assert_eq!(start_date_for(Some("@once"), now).unwrap(), at("2024-05-14T10:20:00Z"));
        assert_eq!(start_date_for(None, now).unwrap(), at("2024-05-14T10:20:00Z"));
        assert!(start_date_for(Some("every tuesday"), now).is_err());
    }

    #[tokio::test]
    async fn remove_for_tolerates_unknown_jobs() {
        let control = Arc::new(RecordingControl {
            answer_not_found: true,
            ..Default::default()
        });
        let (_dir, backend) = setup(control.clone());
        let id = identity("7", "aaaa0001");

        // Batch instance without local files: scheduler is still told.
        let dropped = backend.remove_for(&[instance(&id, true)]).await.unwrap();
        assert!(dropped.is_empty());
        assert_eq!(control.deleted.lock().unwrap().len(), 1);

        // Online instance without files: nothing happens.
        backend.remove_for(&[instance(&id, false)]).await.unwrap();
        assert_eq!(control.deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_template_is_an_error() {
        let (dir, backend) = setup(Arc::new(RecordingControl::default()));
        std::fs::remove_file(dir.path().join("template.py")).unwrap();
        let id = identity("7", "aaaa0001");
        let labels = id.labels(&ServeArgs::default(), true);
        let err = backend
            .register(Registration {
                deployment_name: &id.deployment_name(),
                labels: &labels,
                job: Some(&serde_json::json!({})),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::NotFound(_)));
    }
}
