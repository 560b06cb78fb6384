//! The single "does this instance belong to that deployment" predicate.
//!
//! Backends never filter by hand: they list their instances, and
//! [`select`] decides which ones a stop/remove pass acts on. Results of
//! several criteria are unioned and deduplicated by instance key, so an
//! instance matching both "same version" and "same stage" is acted on once.

use std::collections::HashSet;

use crate::identity::DeploymentIdentity;
use crate::types::{BackendKind, RunningInstance};

/// One matching criterion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchBy {
    /// Same model name and same version, any stage.
    Version,
    /// Same model name and same stage, any version.
    Stage,
    /// Exact deployment name.
    Name(String),
}

/// Restricts candidates before criteria are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StageScope {
    /// Every instance of the backend is a candidate.
    #[default]
    Any,
    /// Only instances in the identity's own stage are candidates.
    Slot,
}

/// A full stale-instance query.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MatchCriteria {
    pub by: Vec<MatchBy>,
    pub scope: StageScope,
    /// Deployment name that is never selected (the instance just started).
    pub exclude: Option<String>,
}

impl MatchCriteria {
    pub fn new(by: impl Into<Vec<MatchBy>>) -> Self {
        Self {
            by: by.into(),
            ..Default::default()
        }
    }

    pub fn by_version() -> Self {
        Self::new(vec![MatchBy::Version])
    }

    pub fn by_version_or_stage() -> Self {
        Self::new(vec![MatchBy::Version, MatchBy::Stage])
    }

    pub fn by_name(name: impl Into<String>) -> Self {
        Self::new(vec![MatchBy::Name(name.into())])
    }

    pub fn within_slot(mut self) -> Self {
        self.scope = StageScope::Slot;
        self
    }

    pub fn excluding(mut self, deployment_name: impl Into<String>) -> Self {
        self.exclude = Some(deployment_name.into());
        self
    }
}

/// Whether `instance` satisfies a single criterion for `identity`.
///
/// A version criterion never matches when the identity carries no version.
pub fn matches(instance: &RunningInstance, identity: &DeploymentIdentity, by: &MatchBy) -> bool {
    let labels = &instance.labels;
    match by {
        MatchBy::Version => {
            labels.name == identity.name
                && identity.version.as_deref() == Some(labels.version.as_str())
        }
        MatchBy::Stage => labels.name == identity.name && labels.stage == identity.stage,
        MatchBy::Name(name) => instance.deployment_name == *name,
    }
}

/// Select the instances a criteria set refers to, each exactly once.
///
/// Order follows the criteria order, then listing order.
pub fn select(
    instances: &[RunningInstance],
    identity: &DeploymentIdentity,
    criteria: &MatchCriteria,
) -> Vec<RunningInstance> {
    let mut seen: HashSet<(BackendKind, &str)> = HashSet::new();
    let mut selected = Vec::new();

    for by in &criteria.by {
        for inst in instances {
            if criteria.scope == StageScope::Slot && inst.labels.stage != identity.stage {
                continue;
            }
            if criteria.exclude.as_deref() == Some(inst.deployment_name.as_str()) {
                continue;
            }
            if !matches(inst, identity, by) {
                continue;
            }
            if seen.insert(inst.key()) {
                selected.push(inst.clone());
            }
        }
    }

    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InstanceLabels, ServeArgs, Stage};

    fn instance(handle: &str, name: &str, version: &str, stage: Stage) -> RunningInstance {
        RunningInstance {
            backend: BackendKind::Container,
            handle: handle.to_string(),
            deployment_name: format!("bentoml_{name}_{stage}_{handle}"),
            labels: InstanceLabels {
                name: name.to_string(),
                version: version.to_string(),
                stage,
                args: ServeArgs::default(),
                batch_prediction: false,
            },
            running: true,
        }
    }

    fn identity(version: &str, stage: Stage) -> DeploymentIdentity {
        DeploymentIdentity::new("bentoml", "iris", stage, Some(version), Some("newnew00")).unwrap()
    }

    fn handles(selected: &[RunningInstance]) -> Vec<&str> {
        selected.iter().map(|i| i.handle.as_str()).collect()
    }

    #[test]
    fn by_version_ignores_other_versions_in_same_stage() {
        let all = vec![
            instance("a", "iris", "1", Staging),
            instance("b", "iris", "2", Staging),
            instance("c", "iris", "1", Production),
        ];
        let picked = select(&all, &identity("1", Staging), &MatchCriteria::by_version());
        assert_eq!(handles(&picked), vec!["a", "c"]);
    }

    #[test]
    fn by_stage_ignores_other_stages() {
        let all = vec![
            instance("a", "iris", "1", Staging),
            instance("b", "iris", "2", Staging),
            instance("c", "iris", "3", Production),
            instance("d", "mnist", "1", Staging),
        ];
        let criteria = MatchCriteria::new(vec![MatchBy::Stage]);
        let picked = select(&all, &identity("9", Staging), &criteria);
        assert_eq!(handles(&picked), vec!["a", "b"]);
    }

    #[test]
    fn overlapping_criteria_select_each_instance_once() {
        let all = vec![
            instance("a", "iris", "2", Staging),
            instance("b", "iris", "1", Staging),
            instance("c", "iris", "2", Production),
        ];
        let picked = select(&all, &identity("2", Staging), &MatchCriteria::by_version_or_stage());
        // "a" qualifies under both predicates but appears once.
        assert_eq!(handles(&picked), vec!["a", "c", "b"]);
    }

    #[test]
    fn slot_scope_keeps_other_stages_out() {
        let all = vec![
            instance("a", "iris", "1", Production),
            instance("b", "iris", "1", Staging),
        ];
        let criteria = MatchCriteria::by_version_or_stage().within_slot();
        let picked = select(&all, &identity("1", Staging), &criteria);
        assert_eq!(handles(&picked), vec!["b"]);
    }

    #[test]
    fn exclude_skips_fresh_instance() {
        let all = vec![
            instance("a", "iris", "1", Staging),
            instance("b", "iris", "1", Staging),
        ];
        let excluded = all[1].deployment_name.clone();
        let criteria = MatchCriteria::by_version_or_stage().excluding(excluded);
        let picked = select(&all, &identity("1", Staging), &criteria);
        assert_eq!(handles(&picked), vec!["a"]);
    }

    #[test]
    fn by_name_matches_deployment_name_only() {
        let all = vec![instance("a", "iris", "1", Staging), instance("b", "iris", "1", Staging)];
        let target = all[0].deployment_name.clone();
        let picked = select(&all, &identity("1", Staging), &MatchCriteria::by_name(target));
        assert_eq!(handles(&picked), vec!["a"]);
    }

    #[test]
    fn versionless_identity_never_matches_by_version() {
        let all = vec![instance("a", "iris", "", Staging)];
        let id = DeploymentIdentity::new("bentoml", "iris", Staging, None, None).unwrap();
        assert!(select(&all, &id, &MatchCriteria::by_version()).is_empty());
    }

    use Stage::{Production, Staging};
}
