//! Task builders.
//!
//! Every configured task becomes a [`Builder`], which later renders as a
//! [`BuildCommand`] subtree. The [`BuilderFactory`] owns one [`TaskBuilder`]
//! per task kind and is built once.

mod fetch;

pub use fetch::{FetchArtifactBuilder, FetchHandler, FetchTaskBuilder, pipeline_working_dir};

use crate::command::BuildCommand;
use gantry_core::config::{RunIfConfig, RunIfConfigs, Task, TaskDetails, TaskKind};
use gantry_core::instance::Pipeline;
use gantry_core::ports::UpstreamPipelineResolver;
use gantry_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Builder {
    pub kind: TaskKind,
    pub description: String,
    pub run_if: RunIfConfigs,
    pub on_cancel: Option<Box<Builder>>,
    pub action: BuilderAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuilderAction {
    /// Run a process; `working_directory` is relative to the agent work dir.
    Command {
        command: String,
        args: Vec<String>,
        working_directory: String,
    },
    FetchArtifact(FetchArtifactBuilder),
}

impl Builder {
    pub fn new(task: &Task, action: BuilderAction) -> Self {
        Self {
            kind: task.kind(),
            description: task.describe(),
            run_if: task.run_if.clone(),
            on_cancel: None,
            action,
        }
    }

    /// `[gantry] Task: ...` banner followed by the action, gated by the run-if.
    pub fn build_command(&self) -> BuildCommand {
        let action = match &self.action {
            BuilderAction::Command {
                command,
                args,
                working_directory,
            } => BuildCommand::exec(command.clone(), args.clone())
                .with_working_directory(working_directory.clone()),
            BuilderAction::FetchArtifact(fetch) => fetch.build_command(),
        };

        let mut command = BuildCommand::compose(vec![
            BuildCommand::task_banner(&self.description).with_run_if(RunIfConfig::Any),
            action.with_run_if(RunIfConfig::Any),
        ])
        .with_run_if(self.run_if.effective());

        if let Some(on_cancel) = &self.on_cancel {
            command = command.with_on_cancel(on_cancel.build_command());
        }
        command
    }
}

/// Creates the builder for one kind of task.
pub trait TaskBuilder: Send + Sync {
    fn create_builder(
        &self,
        task: &Task,
        pipeline: &Pipeline,
        resolver: &dyn UpstreamPipelineResolver,
    ) -> Result<Builder>;
}

pub struct ExecTaskBuilder;

impl TaskBuilder for ExecTaskBuilder {
    fn create_builder(
        &self,
        task: &Task,
        pipeline: &Pipeline,
        _resolver: &dyn UpstreamPipelineResolver,
    ) -> Result<Builder> {
        let TaskDetails::Exec {
            command,
            args,
            working_directory,
        } = &task.details
        else {
            return Err(mismatched(task, TaskKind::Exec));
        };

        Ok(Builder::new(
            task,
            BuilderAction::Command {
                command: command.clone(),
                args: args.clone(),
                working_directory: pipeline_working_dir(pipeline.name(), working_directory.as_deref()),
            },
        ))
    }
}

/// `ant` and `rake` share a command line shape: `<tool> -f <file> <targets...>`.
pub struct BuildToolTaskBuilder {
    kind: TaskKind,
}

impl BuildToolTaskBuilder {
    pub fn ant() -> Self {
        Self { kind: TaskKind::Ant }
    }

    pub fn rake() -> Self {
        Self { kind: TaskKind::Rake }
    }
}

impl TaskBuilder for BuildToolTaskBuilder {
    fn create_builder(
        &self,
        task: &Task,
        pipeline: &Pipeline,
        _resolver: &dyn UpstreamPipelineResolver,
    ) -> Result<Builder> {
        let (build_file, target, working_directory) = match (&task.details, self.kind) {
            (
                TaskDetails::Ant {
                    build_file,
                    target,
                    working_directory,
                },
                TaskKind::Ant,
            )
            | (
                TaskDetails::Rake {
                    build_file,
                    target,
                    working_directory,
                },
                TaskKind::Rake,
            ) => (build_file, target, working_directory),
            _ => return Err(mismatched(task, self.kind)),
        };

        let mut args = Vec::new();
        if let Some(file) = build_file.as_deref().filter(|f| !f.is_empty()) {
            args.push("-f".to_string());
            args.push(file.to_string());
        }
        if let Some(target) = target {
            args.extend(target.split_whitespace().map(str::to_string));
        }

        Ok(Builder::new(
            task,
            BuilderAction::Command {
                command: self.kind.as_str().to_string(),
                args,
                working_directory: pipeline_working_dir(pipeline.name(), working_directory.as_deref()),
            },
        ))
    }
}

fn mismatched(task: &Task, expected: TaskKind) -> Error {
    Error::Internal(format!(
        "{} builder cannot build a {} task",
        expected,
        task.kind()
    ))
}

/// Immutable task kind to builder map.
pub struct BuilderFactory {
    builders: HashMap<TaskKind, Box<dyn TaskBuilder>>,
}

impl BuilderFactory {
    /// Factory with a builder for every task kind.
    pub fn new() -> Self {
        let builders = TaskKind::ALL
            .into_iter()
            .map(|kind| (kind, default_builder(kind)))
            .collect();
        Self { builders }
    }

    /// Factory restricted to the given builders.
    pub fn with_builders(builders: Vec<(TaskKind, Box<dyn TaskBuilder>)>) -> Self {
        Self {
            builders: builders.into_iter().collect(),
        }
    }

    pub fn builder_for(
        &self,
        task: &Task,
        pipeline: &Pipeline,
        resolver: &dyn UpstreamPipelineResolver,
    ) -> Result<Builder> {
        let kind = task.kind();
        let task_builder = self
            .builders
            .get(&kind)
            .ok_or_else(|| Error::UnknownTaskKind(kind.to_string()))?;

        let mut builder = task_builder.create_builder(task, pipeline, resolver)?;
        builder.run_if = task.run_if.clone();
        if let Some(on_cancel) = &task.on_cancel {
            builder.on_cancel = Some(Box::new(self.builder_for(on_cancel, pipeline, resolver)?));
        }

        debug!(pipeline = %pipeline.name(), kind = %kind, task = %builder.description, "Created builder");
        Ok(builder)
    }

    /// Builders for `tasks`, in declaration order.
    pub fn builders_for_tasks(
        &self,
        tasks: &[Task],
        pipeline: &Pipeline,
        resolver: &dyn UpstreamPipelineResolver,
    ) -> Result<Vec<Builder>> {
        tasks
            .iter()
            .map(|task| self.builder_for(task, pipeline, resolver))
            .collect()
    }
}

impl Default for BuilderFactory {
    fn default() -> Self {
        Self::new()
    }
}

fn default_builder(kind: TaskKind) -> Box<dyn TaskBuilder> {
    match kind {
        TaskKind::Exec => Box::new(ExecTaskBuilder),
        TaskKind::Ant => Box::new(BuildToolTaskBuilder::ant()),
        TaskKind::Rake => Box::new(BuildToolTaskBuilder::rake()),
        TaskKind::Fetch => Box::new(FetchTaskBuilder),
    }
}
