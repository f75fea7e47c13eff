//! Run records: pipelines, stages and job instances.

use crate::config::ApprovalType;
use crate::ids::{AgentId, JobIdentifier, PipelineIdentifier, StageCounter, StageIdentifier};
use crate::material::BuildCause;
use crate::plan::JobPlan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Scheduled,
    Assigned,
    Preparing,
    Building,
    Completing,
    Completed,
}

impl JobState {
    pub fn is_completed(&self) -> bool {
        matches!(self, JobState::Completed)
    }

    pub fn is_active(&self) -> bool {
        !self.is_completed()
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Scheduled => "Scheduled",
            JobState::Assigned => "Assigned",
            JobState::Preparing => "Preparing",
            JobState::Building => "Building",
            JobState::Completing => "Completing",
            JobState::Completed => "Completed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobResult {
    #[default]
    Unknown,
    Passed,
    Failed,
    Cancelled,
}

impl JobResult {
    pub fn is_passed(&self) -> bool {
        matches!(self, JobResult::Passed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, JobResult::Failed)
    }
}

impl fmt::Display for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobResult::Unknown => "Unknown",
            JobResult::Passed => "Passed",
            JobResult::Failed => "Failed",
            JobResult::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStateTransition {
    pub state: JobState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInstance {
    /// Assigned by persistence; `None` until saved.
    pub id: Option<u64>,
    pub name: String,
    /// Name of the job config this instance was generated from.
    pub config_name: String,
    pub state: JobState,
    pub result: JobResult,
    pub agent: Option<AgentId>,
    pub plan: JobPlan,
    pub transitions: Vec<JobStateTransition>,
    pub run_on_all_agents: bool,
    pub run_multiple_instance: bool,
    pub rerun: bool,
    pub copied: bool,
    pub original_job_id: Option<u64>,
    pub scheduled_at: DateTime<Utc>,
}

impl JobInstance {
    pub fn scheduled(
        name: impl Into<String>,
        config_name: impl Into<String>,
        plan: JobPlan,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            name: name.into(),
            config_name: config_name.into(),
            state: JobState::Scheduled,
            result: JobResult::Unknown,
            agent: None,
            plan,
            transitions: vec![JobStateTransition {
                state: JobState::Scheduled,
                at,
            }],
            run_on_all_agents: false,
            run_multiple_instance: false,
            rerun: false,
            copied: false,
            original_job_id: None,
            scheduled_at: at,
        }
    }

    pub fn change_state(&mut self, state: JobState, at: DateTime<Utc>) {
        if self.state == state {
            return;
        }
        self.state = state;
        self.transitions.push(JobStateTransition { state, at });
    }

    pub fn assign(&mut self, agent: AgentId, at: DateTime<Utc>) {
        self.agent = Some(agent);
        self.change_state(JobState::Assigned, at);
    }

    pub fn complete(&mut self, result: JobResult, at: DateTime<Utc>) {
        self.result = result;
        self.change_state(JobState::Completed, at);
    }

    pub fn is_completed(&self) -> bool {
        self.state.is_completed()
    }

    /// Copy carried unchanged into a rerun stage.
    ///
    /// State, result and history are kept; the copy points back at the job it
    /// was first copied from.
    pub fn copy_for_rerun(&self) -> Self {
        let mut copy = self.clone();
        copy.original_job_id = self.original_job_id.or(self.id);
        copy.id = None;
        copy.copied = true;
        copy.rerun = false;
        copy
    }

    pub fn identifier(&self, stage: &StageIdentifier) -> JobIdentifier {
        JobIdentifier::new(stage.clone(), self.name.clone())
    }

    pub fn transition_time(&self, state: JobState) -> Option<DateTime<Utc>> {
        self.transitions.iter().find(|t| t.state == state).map(|t| t.at)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub id: Option<u64>,
    pub name: String,
    pub counter: u32,
    pub jobs: Vec<JobInstance>,
    pub approval_type: ApprovalType,
    pub approved_by: String,
    pub fetch_materials: bool,
    pub clean_working_dir: bool,
    /// md5 of the configuration this stage was created from.
    pub config_version: String,
    pub rerun_of_counter: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl Stage {
    pub fn find_job(&self, name: &str) -> Option<&JobInstance> {
        self.jobs.iter().find(|j| j.name.eq_ignore_ascii_case(name))
    }

    pub fn find_job_mut(&mut self, name: &str) -> Option<&mut JobInstance> {
        self.jobs.iter_mut().find(|j| j.name.eq_ignore_ascii_case(name))
    }

    pub fn job_names(&self) -> Vec<&str> {
        self.jobs.iter().map(|j| j.name.as_str()).collect()
    }

    /// Instances generated from the job config `config_name`.
    pub fn jobs_for_config<'a>(&'a self, config_name: &'a str) -> impl Iterator<Item = &'a JobInstance> {
        self.jobs
            .iter()
            .filter(move |j| j.config_name.eq_ignore_ascii_case(config_name))
    }

    pub fn is_rerun(&self) -> bool {
        self.rerun_of_counter.is_some()
    }

    pub fn is_completed(&self) -> bool {
        self.jobs.iter().all(JobInstance::is_completed)
    }

    /// Aggregate result: cancelled beats failed beats unknown.
    pub fn result(&self) -> JobResult {
        if self.jobs.iter().any(|j| j.result == JobResult::Cancelled) {
            JobResult::Cancelled
        } else if self.jobs.iter().any(|j| j.result.is_failed()) {
            JobResult::Failed
        } else if !self.jobs.is_empty() && self.jobs.iter().all(|j| j.result.is_passed()) {
            JobResult::Passed
        } else {
            JobResult::Unknown
        }
    }

    pub fn identifier(&self, pipeline: &PipelineIdentifier) -> StageIdentifier {
        StageIdentifier::new(pipeline.clone(), self.name.clone(), StageCounter::Run(self.counter))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: Option<u64>,
    pub identifier: PipelineIdentifier,
    pub build_cause: BuildCause,
    pub stages: Vec<Stage>,
    pub created_at: DateTime<Utc>,
}

impl Pipeline {
    pub fn name(&self) -> &str {
        &self.identifier.name
    }

    pub fn counter(&self) -> u32 {
        self.identifier.counter
    }

    pub fn label(&self) -> &str {
        &self.identifier.label
    }

    pub fn first_stage(&self) -> Option<&Stage> {
        self.stages.first()
    }

    /// Latest run of the stage named `name` in this pipeline instance.
    pub fn find_stage(&self, name: &str) -> Option<&Stage> {
        self.stages
            .iter()
            .filter(|s| s.name.eq_ignore_ascii_case(name))
            .max_by_key(|s| s.counter)
    }

    pub fn has_stage_been_run(&self, name: &str) -> bool {
        self.find_stage(name).is_some()
    }

    pub fn add_stage(&mut self, stage: Stage) {
        self.stages.push(stage);
    }
}
