//! Test fixtures for configuration trees, build causes and assignments.

use chrono::{TimeZone, Utc};
use gantry_agent::BuildAssignment;
use gantry_core::config::{JobConfig, PipelineConfig, StageConfig, Task};
use gantry_core::ids::{JobIdentifier, StageCounter};
use gantry_core::material::{
    BuildCause, DependencyMaterialRevision, MaterialConfig, MaterialRevision, Revision, ScmKind,
};
use gantry_core::plan::{EnvironmentVariables, JobPlan};
use gantry_core::ports::FixedClock;

/// Revision every fixture git material is built at.
pub const GIT_REVISION: &str = "8f3c2a91d04b7e6655aa01c3e0b9f2d7c4e1a5b0";

/// Factory for pipeline configurations.
pub struct PipelineFixture;

impl PipelineFixture {
    /// `name` with a git material named `repo` and two stages:
    /// `build` (job `compile`) and `test` (jobs `unit`, `integration`).
    pub fn simple(name: &str) -> PipelineConfig {
        PipelineConfig::new(
            name,
            vec![Self::git("repo")],
            vec![
                StageConfig::new("build", vec![Self::job("compile")]),
                StageConfig::new("test", vec![Self::job("unit"), Self::job("integration")]),
            ],
        )
    }

    /// `name` depending on `upstream`'s `upstream_stage`, with one `deploy` stage.
    pub fn downstream(name: &str, upstream: &str, upstream_stage: &str) -> PipelineConfig {
        PipelineConfig::new(
            name,
            vec![
                Self::git("repo"),
                MaterialConfig::dependency(upstream, upstream_stage),
            ],
            vec![StageConfig::new("deploy", vec![Self::job("ship")])],
        )
    }

    pub fn git(name: &str) -> MaterialConfig {
        MaterialConfig::Scm {
            kind: ScmKind::Git,
            url: format!("https://git.example.com/{}.git", name),
            branch: Some("main".to_string()),
            name: Some(name.to_string()),
            dest: None,
        }
    }

    pub fn job(name: &str) -> JobConfig {
        JobConfig::new(name).with_task(Task::exec("echo", [name]))
    }
}

/// Factory for build causes matching fixture configurations.
pub struct CauseFixture;

impl CauseFixture {
    /// A cause with one revision per configured material. Dependency
    /// materials resolve to counter 4 (label `4`), stage counter 1.
    pub fn for_config(config: &PipelineConfig) -> BuildCause {
        let revisions = config
            .materials
            .iter()
            .map(|material| match material {
                MaterialConfig::Scm { .. } => {
                    MaterialRevision::new(material.clone(), Revision::scm(GIT_REVISION))
                }
                MaterialConfig::Dependency {
                    pipeline_name,
                    stage_name,
                    ..
                } => MaterialRevision::dependency(DependencyMaterialRevision::new(
                    pipeline_name.clone(),
                    4,
                    "4",
                    stage_name.clone(),
                    1,
                )),
            })
            .collect();
        BuildCause::new(revisions, "changes")
    }

    /// A cause for a material the configuration does not have.
    pub fn unrelated() -> BuildCause {
        BuildCause::new(
            vec![MaterialRevision::new(
                PipelineFixture::git("somewhere-else"),
                Revision::scm(GIT_REVISION),
            )],
            "changes",
        )
    }
}

/// Clock fixed at 2024-01-15 10:00 UTC.
pub fn fixed_clock() -> FixedClock {
    FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap())
}

/// Factory for agent assignments.
pub struct AssignmentFixture;

impl AssignmentFixture {
    pub fn job(pipeline: &str, counter: u32, job: &str) -> JobIdentifier {
        JobIdentifier::of(pipeline, counter, counter.to_string(), "build", StageCounter::Run(1), job)
    }

    /// An assignment with no materials to update and no builders.
    pub fn empty(pipeline: &str, job: &str) -> BuildAssignment {
        BuildAssignment {
            job: Self::job(pipeline, 1, job),
            plan: JobPlan {
                job_name: job.to_string(),
                resources: Vec::new(),
                artifact_plans: Vec::new(),
                variables: EnvironmentVariables::new(),
                elastic_profile: None,
                timeout_minutes: None,
            },
            materials: Vec::new(),
            builders: Vec::new(),
            fetch_materials: true,
            clean_working_dir: false,
        }
    }
}
