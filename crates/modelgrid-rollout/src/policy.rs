//! Rollout policy: which instances each lifecycle step acts on.

use std::time::Duration;

use modelgrid_core::config::duration_or;
use modelgrid_core::{CoordinatorConfig, MatchBy, MatchCriteria};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutPolicy {
    /// Also stop same-stage instances before the port check. Needed when
    /// every version of a stage serves on the same port.
    pub stop_stage_before_start: bool,
    /// Ceiling on a model repository fetch.
    pub fetch_timeout: Duration,
}

impl Default for RolloutPolicy {
    fn default() -> Self {
        Self {
            stop_stage_before_start: false,
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

impl RolloutPolicy {
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self {
            stop_stage_before_start: config.rollout.stop_stage_before_start,
            fetch_timeout: duration_or(&config.repository.fetch_timeout, Duration::from_secs(30)),
        }
    }

    /// Instances stopped (not removed) before the new one starts. They are
    /// the rollback candidates.
    pub fn pre_stop_criteria(&self) -> MatchCriteria {
        let by = if self.stop_stage_before_start {
            vec![MatchBy::Version, MatchBy::Stage]
        } else {
            vec![MatchBy::Version]
        };
        MatchCriteria::new(by).within_slot()
    }

    /// Instances removed once the new one is healthy.
    pub fn supersede_criteria(&self, new_deployment: &str) -> MatchCriteria {
        MatchCriteria::by_version_or_stage()
            .within_slot()
            .excluding(new_deployment)
    }

    /// Instances removed by an undeploy: the version in every stage.
    pub fn undeploy_criteria(&self) -> MatchCriteria {
        MatchCriteria::by_version()
    }
}

#[cfg(test)]
mod tests {
    use modelgrid_core::StageScope;

    use super::*;

    #[test]
    fn default_pre_stop_is_version_only() {
        let c = RolloutPolicy::default().pre_stop_criteria();
        assert_eq!(c.by, vec![MatchBy::Version]);
        assert_eq!(c.scope, StageScope::Slot);
    }

    #[test]
    fn stage_pre_stop_is_opt_in() {
        let policy = RolloutPolicy {
            stop_stage_before_start: true,
            ..Default::default()
        };
        assert_eq!(policy.pre_stop_criteria().by, vec![MatchBy::Version, MatchBy::Stage]);
    }

    #[test]
    fn supersede_excludes_the_new_instance() {
        let c = RolloutPolicy::default().supersede_criteria("bentoml_iris_staging_abcd1234");
        assert_eq!(c.exclude.as_deref(), Some("bentoml_iris_staging_abcd1234"));
        assert_eq!(c.scope, StageScope::Slot);
    }

    #[test]
    fn undeploy_spans_all_stages() {
        assert_eq!(RolloutPolicy::default().undeploy_criteria().scope, StageScope::Any);
    }

    #[test]
    fn from_config_reads_rollout_section() {
        let config = CoordinatorConfig::from_toml_str(
            "[rollout]\nstop_stage_before_start = true\n[repository]\nfetch_timeout = \"5s\"\n",
        )
        .unwrap();
        let policy = RolloutPolicy::from_config(&config);
        assert!(policy.stop_stage_before_start);
        assert_eq!(policy.fetch_timeout, Duration::from_secs(5));
    }
}
