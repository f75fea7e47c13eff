//! Identifiers for pipeline, stage and job runs.
//!
//! Identifiers are immutable once constructed. Their locator strings are used as
//! cache keys and as artifact URL paths, so their formats are part of the contract.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! define_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                let uuid_str = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Ok(Self(Uuid::parse_str(uuid_str)?))
            }
        }
    };
}

define_id!(AgentId, "agt");

/// Sentinel rendered in locators when a stage run is not pinned.
pub const LATEST: &str = "latest";

/// Counter of a stage run, or the "latest run" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageCounter {
    Run(u32),
    Latest,
}

impl StageCounter {
    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case(LATEST) {
            return Some(StageCounter::Latest);
        }
        s.parse().ok().map(StageCounter::Run)
    }

    pub fn is_latest(&self) -> bool {
        matches!(self, StageCounter::Latest)
    }
}

impl fmt::Display for StageCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageCounter::Run(n) => write!(f, "{}", n),
            StageCounter::Latest => f.write_str(LATEST),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineIdentifier {
    pub name: String,
    pub counter: u32,
    pub label: String,
}

impl PipelineIdentifier {
    pub fn new(name: impl Into<String>, counter: u32, label: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            counter,
            label: label.into(),
        }
    }

    /// `pipeline/counter`
    pub fn locator(&self) -> String {
        format!("{}/{}", self.name, self.counter)
    }

    /// `pipeline/label`
    pub fn locator_for_display(&self) -> String {
        format!("{}/{}", self.name, self.label)
    }
}

impl fmt::Display for PipelineIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.locator())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageIdentifier {
    pub pipeline: PipelineIdentifier,
    pub stage_name: String,
    pub stage_counter: StageCounter,
}

impl StageIdentifier {
    pub fn new(
        pipeline: PipelineIdentifier,
        stage_name: impl Into<String>,
        stage_counter: StageCounter,
    ) -> Self {
        Self {
            pipeline,
            stage_name: stage_name.into(),
            stage_counter,
        }
    }

    /// `pipeline/counter/stage/stageCounter`
    pub fn locator(&self) -> String {
        format!(
            "{}/{}/{}",
            self.pipeline.locator(),
            self.stage_name,
            self.stage_counter
        )
    }

    pub fn locator_for_display(&self) -> String {
        format!(
            "{}/{}/{}",
            self.pipeline.locator_for_display(),
            self.stage_name,
            self.stage_counter
        )
    }
}

impl fmt::Display for StageIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.locator())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobIdentifier {
    pub stage: StageIdentifier,
    pub job_name: String,
}

impl JobIdentifier {
    pub fn new(stage: StageIdentifier, job_name: impl Into<String>) -> Self {
        Self {
            stage,
            job_name: job_name.into(),
        }
    }

    /// Convenience constructor used heavily by fetch resolution and tests.
    pub fn of(
        pipeline_name: impl Into<String>,
        pipeline_counter: u32,
        pipeline_label: impl Into<String>,
        stage_name: impl Into<String>,
        stage_counter: StageCounter,
        job_name: impl Into<String>,
    ) -> Self {
        let pipeline = PipelineIdentifier::new(pipeline_name, pipeline_counter, pipeline_label);
        Self::new(StageIdentifier::new(pipeline, stage_name, stage_counter), job_name)
    }

    pub fn pipeline_name(&self) -> &str {
        &self.stage.pipeline.name
    }

    pub fn pipeline_counter(&self) -> u32 {
        self.stage.pipeline.counter
    }

    pub fn pipeline_label(&self) -> &str {
        &self.stage.pipeline.label
    }

    pub fn stage_name(&self) -> &str {
        &self.stage.stage_name
    }

    pub fn stage_counter(&self) -> StageCounter {
        self.stage.stage_counter
    }

    /// `pipeline/counter/stage/stageCounter/job`
    pub fn build_locator(&self) -> String {
        format!("{}/{}", self.stage.locator(), self.job_name)
    }

    /// `pipeline/label/stage/stageCounter/job`
    pub fn build_locator_for_display(&self) -> String {
        format!("{}/{}", self.stage.locator_for_display(), self.job_name)
    }

    /// Locator of an artifact path published by this job.
    pub fn artifact_locator(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            self.build_locator()
        } else {
            format!("{}/{}", self.build_locator(), path)
        }
    }
}

impl fmt::Display for JobIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.build_locator())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id_display() {
        let id = AgentId::new();
        assert!(id.to_string().starts_with("agt_"));
    }

    #[test]
    fn test_agent_id_parse() {
        let id = AgentId::new();
        let parsed: AgentId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_job_locators() {
        let job = JobIdentifier::of("mingle", 1, "label-1", "dev", StageCounter::Run(2), "one");
        assert_eq!(job.build_locator(), "mingle/1/dev/2/one");
        assert_eq!(job.build_locator_for_display(), "mingle/label-1/dev/2/one");
        assert_eq!(job.artifact_locator("log.xml"), "mingle/1/dev/2/one/log.xml");
    }

    #[test]
    fn test_latest_stage_counter_renders_sentinel() {
        let job = JobIdentifier::of("mingle", 1, "l", "ft", StageCounter::Latest, "linux");
        assert_eq!(job.build_locator(), "mingle/1/ft/latest/linux");
        assert_eq!(StageCounter::parse("latest"), Some(StageCounter::Latest));
        assert_eq!(StageCounter::parse("3"), Some(StageCounter::Run(3)));
        assert_eq!(StageCounter::parse("x"), None);
    }

    #[test]
    fn test_identifiers_are_usable_as_keys() {
        let mut seen = std::collections::HashSet::new();
        let a = JobIdentifier::of("p", 1, "1", "s", StageCounter::Run(1), "j");
        assert!(seen.insert(a.clone()));
        assert!(!seen.insert(a));
    }
}
