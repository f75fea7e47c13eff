//! Turns a job assignment into the single command tree a session runs.

use crate::builders::{Builder, pipeline_working_dir};
use crate::command::BuildCommand;
use gantry_core::config::RunIfConfig;
use gantry_core::ids::JobIdentifier;
use gantry_core::instance::JobState;
use gantry_core::material::MaterialRevision;
use gantry_core::plan::JobPlan;
use serde::{Deserialize, Serialize};

/// Everything an agent receives for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildAssignment {
    pub job: JobIdentifier,
    pub plan: JobPlan,
    pub materials: Vec<MaterialRevision>,
    pub builders: Vec<Builder>,
    #[serde(default = "default_true")]
    pub fetch_materials: bool,
    #[serde(default)]
    pub clean_working_dir: bool,
}

fn default_true() -> bool {
    true
}

pub struct BuildComposer<'a> {
    assignment: &'a BuildAssignment,
}

impl<'a> BuildComposer<'a> {
    pub fn new(assignment: &'a BuildAssignment) -> Self {
        Self { assignment }
    }

    /// Prepare, build, then report completing.
    ///
    /// Preparation cleans and updates the pipeline directory and exports the
    /// job's variables. The completing steps run whatever the result.
    pub fn compose(&self) -> BuildCommand {
        let mut commands = vec![BuildCommand::report_current_status(JobState::Preparing)];
        commands.extend(self.prepare());
        commands.push(BuildCommand::report_current_status(JobState::Building));
        commands.extend(self.assignment.builders.iter().map(Builder::build_command));
        commands.push(BuildCommand::report_current_status(JobState::Completing).with_run_if(RunIfConfig::Any));
        commands.push(BuildCommand::report_completing().with_run_if(RunIfConfig::Any));
        BuildCommand::compose(commands)
    }

    fn prepare(&self) -> Vec<BuildCommand> {
        let job = &self.assignment.job;
        let pipeline_dir = pipeline_working_dir(job.pipeline_name(), None);
        let mut commands = Vec::new();

        if self.assignment.clean_working_dir {
            commands.push(BuildCommand::cleandir(pipeline_dir.clone(), Vec::new()));
        }
        commands.push(BuildCommand::mkdirs(pipeline_dir));

        if self.assignment.fetch_materials {
            for revision in self.assignment.materials.iter().filter(|r| !r.material.is_dependency()) {
                match serde_json::to_string(revision) {
                    Ok(json) => {
                        let dest = pipeline_working_dir(job.pipeline_name(), revision.material.dest());
                        commands.push(BuildCommand::update_material(json, dest));
                    }
                    Err(e) => commands.push(BuildCommand::fail(format!(
                        "[gantry] Could not prepare material {}: {}",
                        revision.material.name(),
                        e
                    ))),
                }
            }
        }

        let builtins = [
            ("GANTRY_PIPELINE_NAME", job.pipeline_name().to_string()),
            ("GANTRY_PIPELINE_COUNTER", job.pipeline_counter().to_string()),
            ("GANTRY_PIPELINE_LABEL", job.pipeline_label().to_string()),
            ("GANTRY_STAGE_NAME", job.stage_name().to_string()),
            ("GANTRY_STAGE_COUNTER", job.stage_counter().to_string()),
            ("GANTRY_JOB_NAME", job.job_name.clone()),
        ];
        for (name, value) in builtins {
            commands.push(BuildCommand::export(name, Some(value), false));
        }
        for variable in self.assignment.plan.variables.iter() {
            commands.push(BuildCommand::export(
                variable.name.clone(),
                Some(variable.value.clone()),
                variable.secure,
            ));
        }
        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandKind;
    use gantry_core::ids::StageCounter;
    use gantry_core::material::{DependencyMaterialRevision, MaterialConfig, Revision};
    use gantry_core::plan::EnvironmentVariables;
    use pretty_assertions::assert_eq;

    fn assignment() -> BuildAssignment {
        let mut variables = EnvironmentVariables::new();
        variables.add_plain("PLAN_VAR", "plain");
        variables.add_secure("PLAN_SECRET", "hidden");
        BuildAssignment {
            job: JobIdentifier::of("cruise", 7, "7-abc", "dev", StageCounter::Run(2), "unit"),
            plan: JobPlan {
                job_name: "unit".into(),
                resources: Vec::new(),
                artifact_plans: Vec::new(),
                variables,
                elastic_profile: None,
                timeout_minutes: None,
            },
            materials: vec![
                MaterialRevision::new(MaterialConfig::git("https://example.com/repo.git"), Revision::scm("abc")),
                MaterialRevision::dependency(DependencyMaterialRevision::new("up", 3, "3", "dist", 1)),
            ],
            builders: Vec::new(),
            fetch_materials: true,
            clean_working_dir: true,
        }
    }

    fn kinds(command: &BuildCommand) -> Vec<CommandKind> {
        command.sub_commands.iter().map(|c| c.name).collect()
    }

    #[test]
    fn test_compose_order() {
        let assignment = assignment();
        let command = BuildComposer::new(&assignment).compose();

        let kinds = kinds(&command);
        assert_eq!(kinds[0], CommandKind::ReportCurrentStatus);
        assert_eq!(kinds[1], CommandKind::Cleandir);
        assert_eq!(kinds[2], CommandKind::Mkdirs);
        assert_eq!(kinds[3], CommandKind::UpdateMaterial);
        assert_eq!(kinds.iter().filter(|k| **k == CommandKind::UpdateMaterial).count(), 1);
        assert_eq!(kinds.iter().filter(|k| **k == CommandKind::Export).count(), 8);
        assert_eq!(kinds[kinds.len() - 2], CommandKind::ReportCurrentStatus);
        assert_eq!(kinds[kinds.len() - 1], CommandKind::ReportCompleting);
        assert_eq!(command.sub_commands.last().map(|c| c.run_if), Some(RunIfConfig::Any));
    }

    #[test]
    fn test_exports_builtin_and_plan_variables() {
        let assignment = assignment();
        let command = BuildComposer::new(&assignment).compose();

        let exports: Vec<(&str, &str, bool)> = command
            .sub_commands
            .iter()
            .filter(|c| c.name == CommandKind::Export)
            .map(|c| {
                (
                    c.arg_str("name").unwrap_or_default(),
                    c.arg_str("value").unwrap_or_default(),
                    c.arg_bool("secure"),
                )
            })
            .collect();

        assert!(exports.contains(&("GANTRY_PIPELINE_LABEL", "7-abc", false)));
        assert!(exports.contains(&("GANTRY_STAGE_COUNTER", "2", false)));
        assert!(exports.contains(&("PLAN_SECRET", "hidden", true)));
    }

    #[test]
    fn test_skips_material_update_when_disabled() {
        let mut assignment = assignment();
        assignment.fetch_materials = false;
        assignment.clean_working_dir = false;

        let kinds = kinds(&BuildComposer::new(&assignment).compose());

        assert!(!kinds.contains(&CommandKind::UpdateMaterial));
        assert!(!kinds.contains(&CommandKind::Cleandir));
    }
}
