//! Deployment identity and naming.
//!
//! Every deploy attempt gets a fresh random suffix, so two successive
//! deploys of the same model and stage never share a container, session,
//! image, or environment name.

use std::sync::LazyLock;

use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::types::{InstanceLabels, ServeArgs, Stage};

/// Namespace tag used when the configuration does not override it.
pub const DEFAULT_PREFIX: &str = "bentoml";

/// Length of the random disambiguator.
pub const SUFFIX_LEN: usize = 8;

const SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

static NON_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\W+").expect("static pattern compiles"));

/// Identity of one deployment attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentIdentity {
    pub prefix: String,
    pub name: String,
    pub stage: Stage,
    pub version: Option<String>,
    pub suffix: String,
    pub name_clean: String,
    pub stage_clean: String,
}

impl DeploymentIdentity {
    /// Build an identity. A `None` suffix draws a fresh one.
    pub fn new(
        prefix: &str,
        name: &str,
        stage: Stage,
        version: Option<&str>,
        suffix: Option<&str>,
    ) -> CoreResult<Self> {
        let name_clean = clean(name);
        if name_clean.is_empty() {
            return Err(CoreError::InvalidArgument(format!(
                "model name {name:?} has no word characters"
            )));
        }
        let prefix_clean = clean(prefix);
        if prefix_clean.is_empty() {
            return Err(CoreError::InvalidArgument(format!(
                "prefix {prefix:?} has no word characters"
            )));
        }
        let version = match version.map(str::trim) {
            Some("") | None => None,
            Some(v) => Some(v.to_string()),
        };
        let suffix = match suffix {
            Some(s) => {
                validate_suffix(s)?;
                s.to_string()
            }
            None => generate_suffix(),
        };

        Ok(Self {
            prefix: prefix_clean,
            name: name.to_string(),
            stage,
            version,
            suffix,
            name_clean,
            stage_clean: clean(stage.as_str()),
        })
    }

    /// Same as [`new`](Self::new) but takes the stage as raw text.
    pub fn parse(
        prefix: &str,
        name: &str,
        raw_stage: &str,
        version: Option<&str>,
        suffix: Option<&str>,
    ) -> CoreResult<Self> {
        Self::new(prefix, name, raw_stage.parse()?, version, suffix)
    }

    /// `{prefix}_{name_clean}_{stage_clean}_{suffix}`.
    pub fn deployment_name(&self) -> String {
        format!("{}_{}", self.slot_name(), self.suffix)
    }

    /// `{prefix}_{name_clean}_{stage_clean}`, shared by every attempt in the slot.
    pub fn slot_name(&self) -> String {
        format!("{}_{}_{}", self.prefix, self.name_clean, self.stage_clean)
    }

    /// Image reference: `{slot}:{suffix}`.
    pub fn image_name(&self) -> String {
        format!("{}:{}", self.slot_name(), self.suffix)
    }

    /// Version, or an error for operations that need one.
    pub fn require_version(&self) -> CoreResult<&str> {
        self.version.as_deref().ok_or_else(|| {
            CoreError::InvalidArgument(format!("{}: version is required", self.name))
        })
    }

    /// Labels for a new instance of this identity.
    pub fn labels(&self, args: &ServeArgs, batch_prediction: bool) -> InstanceLabels {
        InstanceLabels {
            name: self.name.clone(),
            version: self.version.clone().unwrap_or_default(),
            stage: self.stage,
            args: args.clone(),
            batch_prediction,
        }
    }
}

/// Strip non-word characters and lowercase.
pub fn clean(raw: &str) -> String {
    NON_WORD.replace_all(raw, "").to_lowercase()
}

/// Draw a uniform random suffix of lowercase letters and digits.
pub fn generate_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..SUFFIX_LEN)
        .map(|_| SUFFIX_CHARSET[rng.gen_range(0..SUFFIX_CHARSET.len())] as char)
        .collect()
}

fn validate_suffix(suffix: &str) -> CoreResult<()> {
    let valid = suffix.len() == SUFFIX_LEN
        && suffix
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidArgument(format!(
            "suffix {suffix:?} must be {SUFFIX_LEN} lowercase letters or digits"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_name_is_stable_for_fixed_suffix() {
        let named = |version| {
            DeploymentIdentity::new(
                "bentoml",
                "Iris-Classifier",
                Stage::Staging,
                Some(version),
                Some("abcd1234"),
            )
            .unwrap()
        };
        let a = named("1");
        let b = named("2");
        assert_eq!(a.deployment_name(), "bentoml_irisclassifier_staging_abcd1234");
        assert_eq!(a.deployment_name(), b.deployment_name());
        assert_eq!(a.image_name(), "bentoml_irisclassifier_staging:abcd1234");
    }

    #[test]
    fn only_suffix_changes_between_fresh_identities() {
        let a = DeploymentIdentity::new("bentoml", "iris", Stage::Production, None, None).unwrap();
        let b = DeploymentIdentity::new("bentoml", "iris", Stage::Production, None, None).unwrap();
        assert_eq!(a.slot_name(), b.slot_name());
        assert_ne!(a.suffix, b.suffix);
        assert!(a.deployment_name().starts_with("bentoml_iris_production_"));
    }

    #[test]
    fn generated_suffix_has_expected_shape() {
        for _ in 0..50 {
            let s = generate_suffix();
            assert_eq!(s.len(), SUFFIX_LEN);
            assert!(s.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
        }
    }

    #[test]
    fn clean_keeps_underscores_and_lowercases() {
        assert_eq!(clean("My Model_v2!"), "mymodel_v2");
        assert_eq!(clean("Staging"), "staging");
    }

    #[test]
    fn rejects_bad_suffix() {
        let err =
            DeploymentIdentity::new("bentoml", "iris", Stage::None, None, Some("ABC")).unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[test]
    fn rejects_unknown_stage_and_empty_name() {
        assert!(DeploymentIdentity::parse("bentoml", "iris", "qa", None, None).is_err());
        assert!(DeploymentIdentity::parse("bentoml", "!!!", "staging", None, None).is_err());
    }

    #[test]
    fn blank_version_is_treated_as_absent() {
        let id = DeploymentIdentity::new("bentoml", "iris", Stage::None, Some("  "), None).unwrap();
        assert!(id.version.is_none());
        assert!(id.require_version().is_err());
    }
}
