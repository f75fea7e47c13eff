//! Job type strategy.
//!
//! A job config expands into one instance, one instance per matching agent, or
//! a fixed number of numbered instances. The same strategy decides whether an
//! existing instance may be rerun under the current configuration.

use crate::context::SchedulingContext;
use chrono::{DateTime, Utc};
use gantry_core::config::JobConfig;
use gantry_core::instance::JobInstance;
use gantry_core::plan::{EnvironmentVariables, JobPlan};
use gantry_core::{Error, Result};
use tracing::debug;

/// Index (1-based) of a run-multiple instance, exported to the job.
pub const JOB_RUN_INDEX: &str = "GANTRY_JOB_RUN_INDEX";
/// Total number of run-multiple instances, exported to the job.
pub const JOB_RUN_COUNT: &str = "GANTRY_JOB_RUN_COUNT";

const RUN_ON_ALL_MARKER: &str = "runOnAll";
const RUN_INSTANCE_MARKER: &str = "runInstance";

/// Generates `<job>-<marker>-<n>` names, starting at 1.
#[derive(Debug, Clone)]
pub struct CounterBasedJobNameGenerator {
    job_name: String,
    marker: &'static str,
    counter: u32,
}

impl CounterBasedJobNameGenerator {
    pub fn run_on_all(job_name: impl Into<String>) -> Self {
        Self::with_marker(job_name, RUN_ON_ALL_MARKER)
    }

    pub fn run_instance(job_name: impl Into<String>) -> Self {
        Self::with_marker(job_name, RUN_INSTANCE_MARKER)
    }

    fn with_marker(job_name: impl Into<String>, marker: &'static str) -> Self {
        Self {
            job_name: job_name.into(),
            marker,
            counter: 0,
        }
    }

    /// Next counter and the name derived from it.
    pub fn next_name(&mut self) -> (u32, String) {
        self.counter += 1;
        let name = format!("{}-{}-{}", self.job_name, self.marker, self.counter);
        (self.counter, name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobType {
    Single,
    RunOnAllAgents,
    RunMultipleInstances { count: u32 },
}

impl JobType {
    pub fn for_config(config: &JobConfig) -> Result<Self> {
        match (config.run_on_all_agents, config.run_instance_count) {
            (true, Some(_)) => Err(Error::ConflictingJobRunConfig(config.name.clone())),
            (true, None) => Ok(JobType::RunOnAllAgents),
            (false, Some(0)) => Err(Error::InvalidRunInstanceCount(config.name.clone())),
            (false, Some(count)) => Ok(JobType::RunMultipleInstances { count }),
            (false, None) => Ok(JobType::Single),
        }
    }

    /// Human readable name used in rerun refusals.
    pub fn description(&self) -> &'static str {
        match self {
            JobType::Single => "simple",
            JobType::RunOnAllAgents => "run on all agents",
            JobType::RunMultipleInstances { .. } => "run multiple instance",
        }
    }

    pub fn is_fan_out(&self) -> bool {
        !matches!(self, JobType::Single)
    }

    /// Whether `instance_name` is an instance generated from `config_name` under this type.
    pub fn is_instance_of(&self, instance_name: &str, config_name: &str) -> bool {
        let marker = match self {
            JobType::Single => return instance_name.eq_ignore_ascii_case(config_name),
            JobType::RunOnAllAgents => RUN_ON_ALL_MARKER,
            JobType::RunMultipleInstances { .. } => RUN_INSTANCE_MARKER,
        };
        let prefix = format!("{}-{}-", config_name, marker).to_lowercase();
        instance_name
            .to_lowercase()
            .strip_prefix(&prefix)
            .is_some_and(|n| n.parse::<u32>().is_ok())
    }

    /// Expand `config` into scheduled instances sharing `plan` as their base.
    pub fn create_instances(
        &self,
        config: &JobConfig,
        plan: &JobPlan,
        stage_name: &str,
        context: &SchedulingContext,
        at: DateTime<Utc>,
    ) -> Result<Vec<JobInstance>> {
        let mut instances = match self {
            JobType::Single => vec![JobInstance::scheduled(
                config.name.clone(),
                config.name.clone(),
                plan.renamed(config.name.clone()),
                at,
            )],
            JobType::RunOnAllAgents => {
                let agents: Vec<_> = context
                    .agents()
                    .iter()
                    .filter(|a| a.satisfies(&config.resources))
                    .collect();
                if agents.is_empty() {
                    return Err(Error::NoMatchingAgents {
                        job: config.name.clone(),
                        stage: stage_name.to_string(),
                    });
                }

                let mut names = CounterBasedJobNameGenerator::run_on_all(config.name.clone());
                agents
                    .into_iter()
                    .map(|agent| {
                        let (_, name) = names.next_name();
                        let mut job = JobInstance::scheduled(
                            name.clone(),
                            config.name.clone(),
                            plan.renamed(name),
                            at,
                        );
                        job.agent = Some(agent.uuid);
                        job.run_on_all_agents = true;
                        job
                    })
                    .collect()
            }
            JobType::RunMultipleInstances { count } => {
                let mut names = CounterBasedJobNameGenerator::run_instance(config.name.clone());
                (0..*count)
                    .map(|_| {
                        let (index, name) = names.next_name();
                        let mut run_vars = EnvironmentVariables::new();
                        run_vars.add_plain(JOB_RUN_INDEX, index.to_string());
                        run_vars.add_plain(JOB_RUN_COUNT, count.to_string());

                        let mut job = JobInstance::scheduled(
                            name.clone(),
                            config.name.clone(),
                            plan.renamed(name).with_additional_variables(&run_vars),
                            at,
                        );
                        job.run_multiple_instance = true;
                        job
                    })
                    .collect()
            }
        };

        for job in &mut instances {
            job.rerun = context.is_rerun();
        }

        debug!(
            job = %config.name,
            stage = %stage_name,
            job_type = self.description(),
            instances = instances.len(),
            "Created job instances"
        );
        Ok(instances)
    }

    /// Refuse reruns whose previous instance is incompatible with this (current) type.
    ///
    /// `selected` is the number of instances of the same config chosen for rerun.
    pub fn validate_rerun(&self, previous: &JobInstance, selected: usize) -> Result<()> {
        let refuse = |current: &JobType| Error::CannotRerunJob {
            job: previous.name.clone(),
            information: format!(
                "Run configuration for job has been changed to '{}'.",
                current.description()
            ),
        };

        match self {
            JobType::RunMultipleInstances { .. } if !previous.run_multiple_instance => {
                Err(refuse(self))
            }
            JobType::RunOnAllAgents | JobType::Single if previous.run_multiple_instance => {
                Err(refuse(self))
            }
            JobType::Single if previous.run_on_all_agents && selected > 1 => {
                Err(Error::InvalidRerunSelection(previous.config_name.clone()))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AgentSummary;
    use gantry_core::ids::AgentId;

    fn plan(name: &str) -> JobPlan {
        JobPlan {
            job_name: name.to_string(),
            resources: vec![],
            artifact_plans: vec![],
            variables: EnvironmentVariables::new(),
            elastic_profile: None,
            timeout_minutes: None,
        }
    }

    #[test]
    fn test_name_generator_is_one_based() {
        let mut names = CounterBasedJobNameGenerator::run_instance("unit");
        assert_eq!(names.next_name(), (1, "unit-runInstance-1".to_string()));
        assert_eq!(names.next_name(), (2, "unit-runInstance-2".to_string()));
    }

    #[test]
    fn test_conflicting_flags_are_fatal() {
        let config = JobConfig::new("unit").run_on_all_agents().run_instances(2);
        assert!(matches!(
            JobType::for_config(&config),
            Err(Error::ConflictingJobRunConfig(name)) if name == "unit"
        ));
        assert!(JobType::for_config(&JobConfig::new("unit").run_instances(0)).is_err());
    }

    #[test]
    fn test_run_multiple_exports_index_and_count() {
        let config = JobConfig::new("unit").run_instances(3);
        let job_type = JobType::for_config(&config).unwrap();
        let context = SchedulingContext::new("changes");
        let jobs = job_type
            .create_instances(&config, &plan("unit"), "dev", &context, Utc::now())
            .unwrap();

        let names: Vec<&str> = jobs.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["unit-runInstance-1", "unit-runInstance-2", "unit-runInstance-3"]
        );
        assert_eq!(jobs[1].plan.job_name, "unit-runInstance-2");
        assert_eq!(jobs[1].plan.variables.value_of(JOB_RUN_INDEX), Some("2"));
        assert_eq!(jobs[1].plan.variables.value_of(JOB_RUN_COUNT), Some("3"));
        assert!(jobs.iter().all(|j| j.run_multiple_instance && j.config_name == "unit"));
    }

    #[test]
    fn test_run_on_all_assigns_matching_agents() {
        let linux = AgentSummary::new(AgentId::new(), "l1", ["linux"]);
        let windows = AgentSummary::new(AgentId::new(), "w1", ["windows"]);
        let linux2 = AgentSummary::new(AgentId::new(), "l2", ["linux", "docker"]);
        let context =
            SchedulingContext::new("changes").with_agents(vec![linux.clone(), windows, linux2.clone()]);
        let config = JobConfig::new("unit").with_resources(["linux"]).run_on_all_agents();

        let jobs = JobType::RunOnAllAgents
            .create_instances(&config, &plan("unit"), "dev", &context, Utc::now())
            .unwrap();

        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].name, "unit-runOnAll-1");
        assert_eq!(jobs[0].agent, Some(linux.uuid));
        assert_eq!(jobs[1].agent, Some(linux2.uuid));
    }

    #[test]
    fn test_run_on_all_without_agents_fails() {
        let config = JobConfig::new("foo").run_on_all_agents();
        let err = JobType::RunOnAllAgents
            .create_instances(&config, &plan("foo"), "myStage", &SchedulingContext::new("u"), Utc::now())
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Could not find matching agents to run job [foo] of stage [myStage]."
        );
    }

    #[test]
    fn test_is_instance_of() {
        assert!(JobType::RunOnAllAgents.is_instance_of("rails-runOnAll-2", "rails"));
        assert!(!JobType::RunOnAllAgents.is_instance_of("rails-runInstance-2", "rails"));
        assert!(JobType::RunMultipleInstances { count: 2 }.is_instance_of("Rails-runInstance-10", "rails"));
        assert!(JobType::Single.is_instance_of("RAILS", "rails"));
    }

    #[test]
    fn test_rerun_refusals() {
        let mut multiple = JobInstance::scheduled("rails-runInstance-1", "rails", plan("rails"), Utc::now());
        multiple.run_multiple_instance = true;
        let err = JobType::Single.validate_rerun(&multiple, 1).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot rerun job 'rails-runInstance-1'. Run configuration for job has been changed to 'simple'."
        );

        let single = JobInstance::scheduled("rails", "rails", plan("rails"), Utc::now());
        let err = JobType::RunMultipleInstances { count: 2 }
            .validate_rerun(&single, 1)
            .unwrap_err();
        assert!(err.to_string().ends_with("'run multiple instance'."));

        let mut on_all = JobInstance::scheduled("rails-runOnAll-1", "rails", plan("rails"), Utc::now());
        on_all.run_on_all_agents = true;
        assert!(JobType::Single.validate_rerun(&on_all, 1).is_ok());
        assert_eq!(
            JobType::Single.validate_rerun(&on_all, 2).unwrap_err().to_string(),
            "Cannot schedule multiple instances of job named 'rails'."
        );
    }
}
