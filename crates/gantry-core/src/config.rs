//! Pipeline configuration tree.
//!
//! These types are the scheduler's read-only view of a pipeline as configured by
//! the user. Lookups of stages and jobs by name are case insensitive.

use crate::instance::JobResult;
use crate::material::MaterialConfig;
use crate::plan::{ArtifactPlan, EnvironmentVariables};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    #[serde(default = "default_label_template")]
    pub label_template: String,
    pub materials: Vec<MaterialConfig>,
    pub stages: Vec<StageConfig>,
    #[serde(default)]
    pub variables: EnvironmentVariables,
}

fn default_label_template() -> String {
    "${COUNT}".to_string()
}

impl PipelineConfig {
    pub fn new(name: impl Into<String>, materials: Vec<MaterialConfig>, stages: Vec<StageConfig>) -> Self {
        Self {
            name: name.into(),
            label_template: default_label_template(),
            materials,
            stages,
            variables: EnvironmentVariables::new(),
        }
    }

    pub fn first_stage(&self) -> Option<&StageConfig> {
        self.stages.first()
    }

    pub fn find_stage(&self, name: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.name.eq_ignore_ascii_case(name))
    }

    /// Sorted fingerprints of the configured materials.
    pub fn material_fingerprints(&self) -> Vec<String> {
        let mut fingerprints: Vec<String> =
            self.materials.iter().map(MaterialConfig::fingerprint).collect();
        fingerprints.sort();
        fingerprints
    }

    /// Whether `pipeline_name` is configured as an upstream dependency material.
    pub fn depends_on(&self, pipeline_name: &str) -> bool {
        self.materials.iter().any(|m| match m {
            MaterialConfig::Dependency { pipeline_name: p, .. } => p.eq_ignore_ascii_case(pipeline_name),
            MaterialConfig::Scm { .. } => false,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    /// Runs automatically once the previous stage passes.
    #[default]
    Success,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    pub jobs: Vec<JobConfig>,
    #[serde(default)]
    pub approval_type: ApprovalType,
    #[serde(default = "default_true")]
    pub fetch_materials: bool,
    #[serde(default)]
    pub clean_working_dir: bool,
    #[serde(default)]
    pub variables: EnvironmentVariables,
}

fn default_true() -> bool {
    true
}

impl StageConfig {
    pub fn new(name: impl Into<String>, jobs: Vec<JobConfig>) -> Self {
        Self {
            name: name.into(),
            jobs,
            approval_type: ApprovalType::Success,
            fetch_materials: true,
            clean_working_dir: false,
            variables: EnvironmentVariables::new(),
        }
    }

    pub fn find_job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|j| j.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactPlan>,
    #[serde(default)]
    pub variables: EnvironmentVariables,
    #[serde(default)]
    pub run_on_all_agents: bool,
    #[serde(default)]
    pub run_instance_count: Option<u32>,
    #[serde(default)]
    pub elastic_profile_id: Option<String>,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
}

impl JobConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resources: Vec::new(),
            tasks: Vec::new(),
            artifacts: Vec::new(),
            variables: EnvironmentVariables::new(),
            run_on_all_agents: false,
            run_instance_count: None,
            elastic_profile_id: None,
            timeout_minutes: None,
        }
    }

    pub fn with_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resources = resources.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.add_plain(name, value);
        self
    }

    pub fn run_on_all_agents(mut self) -> Self {
        self.run_on_all_agents = true;
        self
    }

    pub fn run_instances(mut self, count: u32) -> Self {
        self.run_instance_count = Some(count);
        self
    }

    pub fn with_elastic_profile(mut self, profile_id: impl Into<String>) -> Self {
        self.elastic_profile_id = Some(profile_id.into());
        self
    }

    pub fn is_run_multiple_instance(&self) -> bool {
        self.run_instance_count.is_some()
    }
}

/// Condition under which a task or command runs, given the build result so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunIfConfig {
    Passed,
    Failed,
    Any,
}

impl RunIfConfig {
    pub fn matches(&self, result: JobResult) -> bool {
        match self {
            RunIfConfig::Any => true,
            RunIfConfig::Passed => result == JobResult::Passed,
            RunIfConfig::Failed => result == JobResult::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunIfConfigs(Vec<RunIfConfig>);

impl RunIfConfigs {
    pub fn new(configs: Vec<RunIfConfig>) -> Self {
        Self(configs)
    }

    /// Collapse to the single condition a build command carries.
    pub fn effective(&self) -> RunIfConfig {
        let any = self.0.contains(&RunIfConfig::Any)
            || (self.0.contains(&RunIfConfig::Passed) && self.0.contains(&RunIfConfig::Failed));
        if any {
            RunIfConfig::Any
        } else if self.0.contains(&RunIfConfig::Failed) {
            RunIfConfig::Failed
        } else {
            RunIfConfig::Passed
        }
    }

    pub fn matches(&self, result: JobResult) -> bool {
        self.effective().matches(result)
    }
}

impl Default for RunIfConfigs {
    fn default() -> Self {
        Self(vec![RunIfConfig::Passed])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Exec,
    Ant,
    Rake,
    Fetch,
}

impl TaskKind {
    pub const ALL: [TaskKind; 4] = [TaskKind::Exec, TaskKind::Ant, TaskKind::Rake, TaskKind::Fetch];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Exec => "exec",
            TaskKind::Ant => "ant",
            TaskKind::Rake => "rake",
            TaskKind::Fetch => "fetch",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    #[serde(flatten)]
    pub details: TaskDetails,
    #[serde(default)]
    pub run_if: RunIfConfigs,
    #[serde(default)]
    pub on_cancel: Option<Box<Task>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskDetails {
    Exec {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        working_directory: Option<String>,
    },
    Ant {
        #[serde(default)]
        build_file: Option<String>,
        #[serde(default)]
        target: Option<String>,
        #[serde(default)]
        working_directory: Option<String>,
    },
    Rake {
        #[serde(default)]
        build_file: Option<String>,
        #[serde(default)]
        target: Option<String>,
        #[serde(default)]
        working_directory: Option<String>,
    },
    Fetch(FetchTask),
}

impl Task {
    pub fn new(details: TaskDetails) -> Self {
        Self {
            details,
            run_if: RunIfConfigs::default(),
            on_cancel: None,
        }
    }

    pub fn exec<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(TaskDetails::Exec {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            working_directory: None,
        })
    }

    pub fn fetch(task: FetchTask) -> Self {
        Self::new(TaskDetails::Fetch(task))
    }

    pub fn with_run_if(mut self, configs: Vec<RunIfConfig>) -> Self {
        self.run_if = RunIfConfigs::new(configs);
        self
    }

    pub fn with_on_cancel(mut self, task: Task) -> Self {
        self.on_cancel = Some(Box::new(task));
        self
    }

    pub fn kind(&self) -> TaskKind {
        match self.details {
            TaskDetails::Exec { .. } => TaskKind::Exec,
            TaskDetails::Ant { .. } => TaskKind::Ant,
            TaskDetails::Rake { .. } => TaskKind::Rake,
            TaskDetails::Fetch(_) => TaskKind::Fetch,
        }
    }

    pub fn describe(&self) -> String {
        match &self.details {
            TaskDetails::Exec { command, args, .. } => {
                if args.is_empty() {
                    command.clone()
                } else {
                    format!("{} {}", command, args.join(" "))
                }
            }
            TaskDetails::Ant { build_file, target, .. } => {
                describe_build_tool("ant", build_file.as_deref(), target.as_deref())
            }
            TaskDetails::Rake { build_file, target, .. } => {
                describe_build_tool("rake", build_file.as_deref(), target.as_deref())
            }
            TaskDetails::Fetch(fetch) => fetch.to_string(),
        }
    }
}

fn describe_build_tool(tool: &str, build_file: Option<&str>, target: Option<&str>) -> String {
    let mut parts = vec![tool.to_string()];
    if let Some(file) = build_file {
        parts.push(format!("-f \"{}\"", file));
    }
    if let Some(target) = target {
        parts.push(target.to_string());
    }
    parts.join(" ")
}

/// What a fetch task pulls from the upstream job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchSource {
    SrcFile(String),
    SrcDir(String),
}

impl FetchSource {
    pub fn path(&self) -> &str {
        match self {
            FetchSource::SrcFile(p) | FetchSource::SrcDir(p) => p,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, FetchSource::SrcFile(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchTask {
    /// Ancestor path such as `grandparent/parent`; empty means the current pipeline.
    #[serde(default)]
    pub pipeline: Option<String>,
    pub stage: String,
    pub job: String,
    pub source: FetchSource,
    #[serde(default)]
    pub dest: Option<String>,
}

impl FetchTask {
    pub fn new(
        pipeline: Option<&str>,
        stage: impl Into<String>,
        job: impl Into<String>,
        source: FetchSource,
    ) -> Self {
        Self {
            pipeline: pipeline.filter(|p| !p.is_empty()).map(str::to_string),
            stage: stage.into(),
            job: job.into(),
            source,
            dest: None,
        }
    }

    pub fn with_dest(mut self, dest: impl Into<String>) -> Self {
        self.dest = Some(dest.into());
        self
    }

    /// Ancestor pipelines named by the path, furthest first.
    pub fn ancestor_path(&self) -> Vec<&str> {
        self.pipeline
            .as_deref()
            .map(|p| p.split('/').filter(|s| !s.is_empty()).collect())
            .unwrap_or_default()
    }
}

impl fmt::Display for FetchTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fetch artifact [{}] => [{}] from [{}/{}/{}]",
            self.source.path(),
            self.dest.as_deref().unwrap_or(""),
            self.pipeline.as_deref().unwrap_or(""),
            self.stage,
            self.job
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_stage_is_case_insensitive() {
        let config = PipelineConfig::new(
            "cruise",
            vec![],
            vec![StageConfig::new("Dev", vec![JobConfig::new("unit")])],
        );
        assert!(config.find_stage("dev").is_some());
        assert!(config.find_stage("dev").unwrap().find_job("UNIT").is_some());
        assert!(config.find_stage("ft").is_none());
    }

    #[test]
    fn test_run_if_collapses_to_single_condition() {
        assert_eq!(RunIfConfigs::default().effective(), RunIfConfig::Passed);
        assert_eq!(
            RunIfConfigs::new(vec![RunIfConfig::Passed, RunIfConfig::Failed]).effective(),
            RunIfConfig::Any
        );
        assert_eq!(RunIfConfigs::new(vec![RunIfConfig::Failed]).effective(), RunIfConfig::Failed);
        assert!(RunIfConfig::Any.matches(JobResult::Failed));
        assert!(!RunIfConfig::Passed.matches(JobResult::Failed));
    }

    #[test]
    fn test_fetch_ancestor_path() {
        let task = FetchTask::new(
            Some("uppest/up/down"),
            "stage",
            "job",
            FetchSource::SrcFile("a.txt".into()),
        );
        assert_eq!(task.ancestor_path(), vec!["uppest", "up", "down"]);
        let local = FetchTask::new(Some(""), "stage", "job", FetchSource::SrcDir("lib".into()));
        assert!(local.pipeline.is_none());
        assert!(local.ancestor_path().is_empty());
    }

    #[test]
    fn test_task_deserializes_from_yaml_shape() {
        let json = serde_json::json!({
            "kind": "exec",
            "command": "make",
            "args": ["test"],
            "run_if": ["failed"],
        });
        let task: Task = serde_json::from_value(json).unwrap();
        assert_eq!(task.kind(), TaskKind::Exec);
        assert_eq!(task.run_if.effective(), RunIfConfig::Failed);
        assert_eq!(task.describe(), "make test");
    }
}
