//! Monitoring-target backend.
//!
//! Maintains a file-based service-discovery list (a YAML sequence of
//! `{targets: [host:port], labels: {...}}`) that a metrics scraper
//! watches. Entries written by other tools are preserved untouched.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use modelgrid_core::config::MonitoringConfig;
use modelgrid_core::types::label_keys;
use modelgrid_core::{BackendKind, ModelSummary, RunningInstance, Stage};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::backend::{DependentBackend, Registration};
use crate::error::{BackendError, BackendResult};

/// Label carrying the model name in a target entry.
const MODEL_LABEL: &str = "model";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TargetEntry {
    targets: Vec<String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

impl TargetEntry {
    fn deployment_name(&self) -> Option<&str> {
        self.labels.get(label_keys::DEPLOYMENT_NAME).map(String::as_str)
    }
}

fn as_entry(value: &serde_yaml::Value) -> Option<TargetEntry> {
    serde_yaml::from_value(value.clone()).ok()
}

pub struct MonitoringBackend {
    config: MonitoringConfig,
    // Read-modify-write of a shared file.
    lock: Mutex<()>,
}

impl MonitoringBackend {
    pub fn new(config: MonitoringConfig) -> Self {
        Self {
            config,
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> BackendResult<Vec<serde_yaml::Value>> {
        let path = &self.config.targets_file;
        if !tokio::fs::try_exists(path).await? {
            return Ok(Vec::new());
        }
        let raw = tokio::fs::read_to_string(path).await?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        let doc: Option<Vec<serde_yaml::Value>> = serde_yaml::from_str(&raw)
            .map_err(|e| BackendError::Serialize(format!("{}: {e}", path.display())))?;
        Ok(doc.unwrap_or_default())
    }

    /// Write through a temporary file so the scraper never reads a torn list.
    async fn save(&self, entries: &[serde_yaml::Value]) -> BackendResult<()> {
        let path = &self.config.targets_file;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let yaml =
            serde_yaml::to_string(entries).map_err(|e| BackendError::Serialize(e.to_string()))?;
        let tmp = tmp_path(path);
        tokio::fs::write(&tmp, yaml).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> std::path::PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[async_trait]
impl DependentBackend for MonitoringBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Monitoring
    }

    async fn register(&self, registration: Registration<'_>) -> BackendResult<bool> {
        let labels = registration.labels;
        let entry = TargetEntry {
            targets: vec![format!("{}:{}", self.config.target_host, labels.args.port)],
            labels: BTreeMap::from([
                (label_keys::DEPLOYMENT_NAME.to_string(), registration.deployment_name.to_string()),
                (MODEL_LABEL.to_string(), labels.name.clone()),
                (label_keys::VERSION.to_string(), labels.version.clone()),
                (label_keys::STAGE.to_string(), labels.stage.to_string()),
            ]),
        };
        let value =
            serde_yaml::to_value(&entry).map_err(|e| BackendError::Serialize(e.to_string()))?;

        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        // Superseded entries are dropped by `remove_for`; a slot may hold
        // one entry per runtime backend.
        let own = Some(registration.deployment_name);
        entries.retain(|v| as_entry(v).is_none_or(|existing| existing.deployment_name() != own));
        entries.push(value);
        self.save(&entries).await?;

        info!(
            deployment = %registration.deployment_name,
            port = labels.args.port,
            "monitoring target registered"
        );
        Ok(true)
    }

    async fn remove_for(&self, removed: &[RunningInstance]) -> BackendResult<Vec<String>> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        let mut dropped = Vec::new();
        entries.retain(|v| {
            let name = as_entry(v).and_then(|e| e.deployment_name().map(str::to_string));
            match name {
                Some(name) if removed.iter().any(|i| i.deployment_name == name) => {
                    dropped.push(name);
                    false
                }
                _ => true,
            }
        });
        if !dropped.is_empty() {
            self.save(&entries).await?;
            info!(targets = ?dropped, "monitoring targets removed");
        }
        Ok(dropped)
    }

    async fn list_entries(&self) -> BackendResult<Vec<ModelSummary>> {
        let mut summaries = Vec::new();
        for value in self.load().await? {
            let Some(entry) = as_entry(&value) else { continue };
            let Some(deployment_name) = entry.deployment_name() else { continue };
            let (Some(name), Some(version)) = (
                entry.labels.get(MODEL_LABEL),
                entry.labels.get(label_keys::VERSION),
            ) else {
                continue;
            };
            let stage = match entry.labels.get(label_keys::STAGE).map(|s| s.parse::<Stage>()) {
                Some(Ok(stage)) => stage,
                Some(Err(e)) => {
                    warn!(%deployment_name, error = %e, "monitoring target with unknown stage");
                    continue;
                }
                None => Stage::default(),
            };
            summaries.push(ModelSummary {
                name: name.clone(),
                version: version.clone(),
                stage,
                deployment_name: Some(deployment_name.to_string()),
                args: None,
            });
        }
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use modelgrid_core::{DeploymentIdentity, ServeArgs};

    use super::*;

    fn backend(dir: &Path) -> MonitoringBackend {
        MonitoringBackend::new(MonitoringConfig {
            targets_file: dir.join("targets.yml"),
            target_host: "localhost".into(),
        })
    }

    async fn register(
        b: &MonitoringBackend,
        version: &str,
        suffix: &str,
        port: u16,
    ) -> RunningInstance {
        let id = DeploymentIdentity::new(
            "bentoml",
            "fraud",
            Stage::Production,
            Some(version),
            Some(suffix),
        )
        .unwrap();
        let labels = id.labels(&ServeArgs::with_port(port), false);
        b.register(Registration {
            deployment_name: &id.deployment_name(),
            labels: &labels,
            job: None,
        })
        .await
        .unwrap();
        RunningInstance {
            backend: BackendKind::Container,
            handle: suffix.into(),
            deployment_name: id.deployment_name(),
            labels,
            running: true,
        }
    }

    #[tokio::test]
    async fn register_writes_target_list() {
        let dir = tempfile::tempdir().unwrap();
        let b = backend(dir.path());
        register(&b, "1", "aaaa0001", 6001).await;

        let raw = std::fs::read_to_string(dir.path().join("targets.yml")).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&raw).unwrap();
        assert_eq!(doc[0]["targets"][0].as_str(), Some("localhost:6001"));
        assert_eq!(doc[0]["labels"]["stage"].as_str(), Some("production"));
        assert_eq!(doc[0]["labels"]["model"].as_str(), Some("fraud"));
    }

    #[tokio::test]
    async fn registration_replaces_only_its_own_entry() {
        let dir = tempfile::tempdir().unwrap();
        let b = backend(dir.path());
        register(&b, "1", "aaaa0001", 6001).await;
        register(&b, "1", "bbbb0002", 6002).await;
        register(&b, "1", "aaaa0001", 6003).await;

        let raw = std::fs::read_to_string(dir.path().join("targets.yml")).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&raw).unwrap();
        let targets: Vec<&str> = doc
            .as_sequence()
            .unwrap()
            .iter()
            .map(|entry| entry["targets"][0].as_str().unwrap())
            .collect();
        assert_eq!(targets, vec!["localhost:6002", "localhost:6003"]);
        assert_eq!(b.list_entries().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn foreign_entries_survive_rewrites() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("targets.yml"),
            "- targets: ['node-exporter:9100']\n  labels:\n    job: node\n",
        )
        .unwrap();
        let b = backend(dir.path());
        let inst = register(&b, "1", "aaaa0001", 6001).await;

        let dropped = b.remove_for(&[inst.clone()]).await.unwrap();
        assert_eq!(dropped, vec![inst.deployment_name.clone()]);

        let raw = std::fs::read_to_string(dir.path().join("targets.yml")).unwrap();
        assert!(raw.contains("node-exporter:9100"));
        assert!(b.list_entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_for_unknown_instance_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let b = backend(dir.path());
        let inst = register(&b, "1", "aaaa0001", 6001).await;
        let mut other = inst.clone();
        other.deployment_name = "bentoml_fraud_production_zzzz9999".into();

        assert!(b.remove_for(&[other]).await.unwrap().is_empty());
        assert_eq!(b.list_entries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_file_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(backend(dir.path()).list_entries().await.unwrap().is_empty());
    }
}
