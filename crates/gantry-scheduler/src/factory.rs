//! Instance factory.
//!
//! Turns configuration plus a build cause into pipeline, stage and job run
//! records. Every operation is synchronous and either returns a complete
//! record or an error; nothing is half built.

use crate::context::SchedulingContext;
use crate::job_type::JobType;
use gantry_core::config::{JobConfig, PipelineConfig, StageConfig};
use gantry_core::ids::PipelineIdentifier;
use gantry_core::instance::{JobInstance, Pipeline, Stage};
use gantry_core::label::LabelTemplate;
use gantry_core::material::{BuildCause, MaterialConfig, Revision};
use gantry_core::plan::{EnvironmentVariables, JobPlan};
use gantry_core::ports::Clock;
use gantry_core::{Error, Result};
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Debug, Default, Clone, Copy)]
pub struct InstanceFactory;

impl InstanceFactory {
    pub fn new() -> Self {
        Self
    }

    /// Create run `counter` of `pipeline_config` with its first stage scheduled.
    pub fn create_pipeline_instance(
        &self,
        pipeline_config: &PipelineConfig,
        build_cause: &BuildCause,
        context: &SchedulingContext,
        config_md5: &str,
        counter: u32,
        clock: &dyn Clock,
    ) -> Result<Pipeline> {
        verify_materials(pipeline_config, build_cause)?;

        let first = pipeline_config
            .first_stage()
            .ok_or_else(|| Error::NoStages {
                pipeline: pipeline_config.name.clone(),
            })?;

        let label = LabelTemplate::new(&pipeline_config.label_template).render(
            counter,
            build_cause,
            &pipeline_config.variables,
        );

        let context = context
            .override_environment_variables(&pipeline_config.variables)
            .with_overrides(&build_cause.variables);
        let stage = self.create_stage_instance(first, &context, config_md5, clock)?;

        info!(
            pipeline = %pipeline_config.name,
            counter,
            label = %label,
            approver = %build_cause.approver,
            "Created pipeline instance"
        );

        Ok(Pipeline {
            id: None,
            identifier: PipelineIdentifier::new(pipeline_config.name.clone(), counter, label),
            build_cause: build_cause.clone(),
            stages: vec![stage],
            created_at: clock.now(),
        })
    }

    /// Create the first run of `stage_config`. Callers scheduling a later run bump `counter`.
    pub fn create_stage_instance(
        &self,
        stage_config: &StageConfig,
        context: &SchedulingContext,
        config_md5: &str,
        clock: &dyn Clock,
    ) -> Result<Stage> {
        let context = context.override_environment_variables(&stage_config.variables);

        let mut jobs = Vec::new();
        for job_config in &stage_config.jobs {
            jobs.extend(self.create_job_instances(&stage_config.name, job_config, &context, clock)?);
        }

        debug!(stage = %stage_config.name, jobs = jobs.len(), "Created stage instance");

        Ok(Stage {
            id: None,
            name: stage_config.name.clone(),
            counter: 1,
            jobs,
            approval_type: context.approval_type().unwrap_or(stage_config.approval_type),
            approved_by: context.approver().to_string(),
            fetch_materials: stage_config.fetch_materials,
            clean_working_dir: stage_config.clean_working_dir,
            config_version: config_md5.to_string(),
            rerun_of_counter: None,
            created_at: clock.now(),
        })
    }

    /// Look up `stage_name` in `pipeline_config` and create a run of it.
    pub fn create_stage_instance_for(
        &self,
        pipeline_config: &PipelineConfig,
        stage_name: &str,
        context: &SchedulingContext,
        config_md5: &str,
        clock: &dyn Clock,
    ) -> Result<Stage> {
        let stage_config =
            pipeline_config
                .find_stage(stage_name)
                .ok_or_else(|| Error::StageNotFound {
                    pipeline: pipeline_config.name.clone(),
                    stage: stage_name.to_string(),
                })?;
        let context = context.override_environment_variables(&pipeline_config.variables);
        self.create_stage_instance(stage_config, &context, config_md5, clock)
    }

    /// Create a new run of `stage` in which only `job_names` are scheduled again.
    ///
    /// Jobs not selected are copied with their state and result. Fan-out jobs
    /// are regenerated as a whole: every instance of a selected run-on-all or
    /// run-multiple config is replaced at the position of the first one.
    pub fn create_stage_for_rerun_of_jobs(
        &self,
        stage: &Stage,
        job_names: &[String],
        context: &SchedulingContext,
        stage_config: &StageConfig,
        clock: &dyn Clock,
        latest_config_md5: &str,
    ) -> Result<Stage> {
        let context = context
            .override_environment_variables(&stage_config.variables)
            .permit_rerun();

        let mut selected: Vec<&JobInstance> = Vec::new();
        for name in job_names {
            let job = stage.find_job(name).ok_or_else(|| Error::JobNotFound {
                stage: stage.name.clone(),
                job: name.clone(),
            })?;
            if !selected.iter().any(|j| j.name == job.name) {
                selected.push(job);
            }
        }

        let mut selected_per_config: HashMap<String, usize> = HashMap::new();
        for job in &selected {
            *selected_per_config
                .entry(job.config_name.to_lowercase())
                .or_default() += 1;
        }

        let mut rerun_configs: HashMap<String, (&JobConfig, JobType)> = HashMap::new();
        for job in &selected {
            let job_config =
                stage_config
                    .find_job(&job.config_name)
                    .ok_or_else(|| Error::CannotRerunJob {
                        job: job.name.clone(),
                        information: "Configuration for job doesn't exist.".to_string(),
                    })?;
            let job_type = JobType::for_config(job_config)?;
            let key = job.config_name.to_lowercase();
            job_type.validate_rerun(job, selected_per_config[&key])?;
            rerun_configs.insert(key, (job_config, job_type));
        }

        let at = clock.now();
        let mut jobs = Vec::with_capacity(stage.jobs.len());
        let mut regenerated: Vec<String> = Vec::new();

        for job in &stage.jobs {
            let key = job.config_name.to_lowercase();
            let is_selected = selected.iter().any(|s| s.name == job.name);

            match rerun_configs.get(&key) {
                Some((job_config, job_type)) if job_type.is_fan_out() => {
                    if !regenerated.contains(&key) {
                        regenerated.push(key);
                        jobs.extend(self.create_job_instances(&stage.name, job_config, &context, clock)?);
                    }
                }
                Some((job_config, _)) if is_selected => {
                    let plan = self.create_job_plan(job_config, &context)?;
                    let mut fresh = JobInstance::scheduled(
                        job_config.name.clone(),
                        job_config.name.clone(),
                        plan,
                        at,
                    );
                    fresh.rerun = true;
                    if job.run_on_all_agents {
                        fresh.agent = job.agent;
                    }
                    jobs.push(fresh);
                }
                _ => jobs.push(job.copy_for_rerun()),
            }
        }

        info!(
            stage = %stage.name,
            from_counter = stage.counter,
            counter = stage.counter + 1,
            rerun_jobs = ?job_names,
            "Created stage for rerun of jobs"
        );

        Ok(Stage {
            id: None,
            name: stage.name.clone(),
            counter: stage.counter + 1,
            jobs,
            approval_type: context.approval_type().unwrap_or(stage_config.approval_type),
            approved_by: context.approver().to_string(),
            fetch_materials: stage_config.fetch_materials,
            clean_working_dir: stage_config.clean_working_dir,
            config_version: latest_config_md5.to_string(),
            rerun_of_counter: Some(stage.rerun_of_counter.unwrap_or(stage.counter)),
            created_at: at,
        })
    }

    /// Resolve the plan a job will run with.
    ///
    /// Variables are layered scoped < job < overrides < elastic profile; a
    /// later layer wins while the first position of a name is kept.
    pub fn create_job_plan(&self, job_config: &JobConfig, context: &SchedulingContext) -> Result<JobPlan> {
        let elastic_profile = match &job_config.elastic_profile_id {
            Some(id) => Some(context.elastic_profile(id).ok_or_else(|| {
                Error::ElasticProfileNotFound {
                    job: job_config.name.clone(),
                    profile: id.clone(),
                }
            })?),
            None => None,
        };

        let mut variables = EnvironmentVariables::new();
        variables.merge(context.scoped_variables());
        variables.merge(&job_config.variables);
        variables.merge(context.overrides());
        if let Some(profile) = &elastic_profile {
            variables.merge(&profile.environment_variables);
        }

        Ok(JobPlan {
            job_name: job_config.name.clone(),
            resources: job_config.resources.clone(),
            artifact_plans: job_config.artifacts.clone(),
            variables,
            elastic_profile,
            timeout_minutes: job_config.timeout_minutes,
        })
    }

    pub fn create_job_instances(
        &self,
        stage_name: &str,
        job_config: &JobConfig,
        context: &SchedulingContext,
        clock: &dyn Clock,
    ) -> Result<Vec<JobInstance>> {
        let job_type = JobType::for_config(job_config)?;
        let plan = self.create_job_plan(job_config, context)?;
        job_type.create_instances(job_config, &plan, stage_name, context, clock.now())
    }
}

fn verify_materials(pipeline_config: &PipelineConfig, build_cause: &BuildCause) -> Result<()> {
    let expected = pipeline_config.material_fingerprints();
    let actual = build_cause.fingerprints();
    if expected != actual {
        return Err(Error::MaterialMismatch {
            pipeline: pipeline_config.name.clone(),
            expected,
            actual,
        });
    }

    for material in &pipeline_config.materials {
        let Some(revision) = build_cause.revision_for_fingerprint(&material.fingerprint()) else {
            continue;
        };
        let reason = match (material, &revision.revision) {
            (MaterialConfig::Dependency { .. }, Revision::Scm { .. }) => {
                Some("a dependency material needs an upstream stage revision")
            }
            (MaterialConfig::Scm { .. }, Revision::Dependency(_)) => {
                Some("an scm material needs a source revision")
            }
            _ => None,
        };
        if let Some(reason) = reason {
            return Err(Error::PipelineMaterialMismatch {
                pipeline: pipeline_config.name.clone(),
                material: material.name().to_string(),
                reason: reason.to_string(),
            });
        }
    }
    Ok(())
}
