//! Shared types used across ModelGrid crates.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CoreError;

/// Default port a model server listens on.
pub const DEFAULT_PORT: u16 = 5000;

/// Default number of serving workers.
pub const DEFAULT_WORKERS: u32 = 1;

// ── Stage ──────────────────────────────────────────────────────────

/// Logical deployment slot a model version occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Stage {
    #[default]
    None,
    Staging,
    Production,
    Archived,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::None => "none",
            Stage::Staging => "staging",
            Stage::Production => "production",
            Stage::Archived => "archived",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = CoreError;

    /// Case-insensitive; accepts the registry spellings ("Staging", "None").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Stage::None),
            "staging" => Ok(Stage::Staging),
            "production" => Ok(Stage::Production),
            "archived" => Ok(Stage::Archived),
            other => Err(CoreError::InvalidArgument(format!("unknown stage: {other}"))),
        }
    }
}

impl Serialize for Stage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Stage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ── Backend kind ───────────────────────────────────────────────────

/// Which execution substrate a backend drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Container,
    Session,
    Schedule,
    Monitoring,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Container => "container",
            BackendKind::Session => "session",
            BackendKind::Schedule => "schedule",
            BackendKind::Monitoring => "monitoring",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "container" | "docker" => Ok(BackendKind::Container),
            "session" | "tmux" => Ok(BackendKind::Session),
            "schedule" | "airflow" => Ok(BackendKind::Schedule),
            "monitoring" | "prometheus" => Ok(BackendKind::Monitoring),
            other => Err(CoreError::InvalidArgument(format!("unknown backend: {other}"))),
        }
    }
}

// ── Serve args ─────────────────────────────────────────────────────

/// Start arguments handed to the model server.
///
/// `port` and `workers` are always present; anything else is passed through
/// verbatim and rendered as a command-line flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServeArgs {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_workers")]
    pub workers: u32,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_workers() -> u32 {
    DEFAULT_WORKERS
}

impl Default for ServeArgs {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            workers: DEFAULT_WORKERS,
            extra: BTreeMap::new(),
        }
    }
}

impl ServeArgs {
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    /// Render as server flags in key order: `--flag` for `true`, nothing
    /// for `false`, `--key=value` otherwise.
    pub fn to_cli_args(&self) -> Vec<String> {
        let mut all: BTreeMap<&str, serde_json::Value> = self
            .extra
            .iter()
            .map(|(k, v)| (k.as_str(), v.clone()))
            .collect();
        all.insert("port", self.port.into());
        all.insert("workers", self.workers.into());

        all.into_iter()
            .filter_map(|(key, value)| match value {
                serde_json::Value::Bool(true) => Some(format!("--{key}")),
                serde_json::Value::Bool(false) | serde_json::Value::Null => None,
                serde_json::Value::String(s) => Some(format!("--{key}={s}")),
                other => Some(format!("--{key}={other}")),
            })
            .collect()
    }

    /// Serialized form stored in instance labels.
    pub fn to_label(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn from_label(raw: &str) -> Result<Self, CoreError> {
        serde_json::from_str(raw).map_err(|e| CoreError::Label(format!("bad args label: {e}")))
    }
}

// ── Instance labels ────────────────────────────────────────────────

/// Label keys written onto every instance.
pub mod label_keys {
    pub const NAME: &str = "name";
    pub const VERSION: &str = "version";
    pub const STAGE: &str = "stage";
    pub const ARGS: &str = "args";
    pub const BATCH_PREDICTION: &str = "batch_prediction";
    pub const DEPLOYMENT_NAME: &str = "deployment_name";
}

/// The label set that ties an instance to its logical deployment.
///
/// Labels are the only record of which deployment an instance belongs to:
/// backends write them when starting and read them back when listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceLabels {
    pub name: String,
    pub version: String,
    pub stage: Stage,
    pub args: ServeArgs,
    #[serde(default)]
    pub batch_prediction: bool,
}

impl InstanceLabels {
    /// Flatten into string key/value pairs for substrates that only carry strings.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            (label_keys::NAME, self.name.clone()),
            (label_keys::VERSION, self.version.clone()),
            (label_keys::STAGE, self.stage.as_str().to_string()),
            (label_keys::ARGS, self.args.to_label()),
            (label_keys::BATCH_PREDICTION, self.batch_prediction.to_string()),
        ]
    }

    /// Rebuild from string pairs. Returns `Ok(None)` when the mandatory
    /// name/version/stage labels are missing, meaning the instance is not
    /// managed by us.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Option<Self>, CoreError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let map: BTreeMap<&str, &str> = pairs.into_iter().collect();
        let (Some(name), Some(version), Some(stage)) = (
            map.get(label_keys::NAME),
            map.get(label_keys::VERSION),
            map.get(label_keys::STAGE),
        ) else {
            return Ok(None);
        };
        let args = match map.get(label_keys::ARGS) {
            Some(raw) if !raw.is_empty() => ServeArgs::from_label(raw)?,
            _ => ServeArgs::default(),
        };
        let batch_prediction = map
            .get(label_keys::BATCH_PREDICTION)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));
        Ok(Some(Self {
            name: name.to_string(),
            version: version.to_string(),
            stage: stage.parse()?,
            args,
            batch_prediction,
        }))
    }
}

// ── Running instance ───────────────────────────────────────────────

/// A backend-native instance plus the labels read back from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningInstance {
    pub backend: BackendKind,
    /// Backend handle: container id, session name, file stem.
    pub handle: String,
    pub deployment_name: String,
    pub labels: InstanceLabels,
    /// `false` for instances that exist but are stopped.
    pub running: bool,
}

impl RunningInstance {
    /// Port the instance serves on, taken from its start arguments.
    pub fn port(&self) -> u16 {
        self.labels.args.port
    }

    /// Stable identity key used for deduplication.
    pub fn key(&self) -> (BackendKind, &str) {
        (self.backend, self.handle.as_str())
    }
}

/// Public listing entry, as returned by the running-models report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub name: String,
    pub version: String,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<ServeArgs>,
}

impl From<&RunningInstance> for ModelSummary {
    fn from(inst: &RunningInstance) -> Self {
        Self {
            name: inst.labels.name.clone(),
            version: inst.labels.version.clone(),
            stage: inst.labels.stage,
            deployment_name: Some(inst.deployment_name.clone()),
            args: Some(inst.labels.args.clone()),
        }
    }
}
