//! Fetch artifact builder and upstream job resolution.

use super::{Builder, BuilderAction, TaskBuilder};
use crate::command::{BuildCommand, Download};
use gantry_core::config::{FetchTask, Task, TaskDetails, TaskKind};
use gantry_core::ids::{JobIdentifier, StageCounter};
use gantry_core::instance::Pipeline;
use gantry_core::material::{BuildCause, DependencyMaterialRevision};
use gantry_core::ports::UpstreamPipelineResolver;
use gantry_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

const CHECKSUM_FILE: &str = "gantry-output/md5.checksum";

/// Directory a pipeline's tasks run in, relative to the agent work dir.
pub fn pipeline_working_dir(pipeline_name: &str, sub_dir: Option<&str>) -> String {
    let base = format!("pipelines/{}", pipeline_name);
    match sub_dir.map(normalize).filter(|d| !d.is_empty()) {
        Some(dir) => format!("{}/{}", base, dir),
        None => base,
    }
}

fn normalize(path: &str) -> String {
    path.replace('\\', "/").trim_matches('/').to_string()
}

fn base_name(path: &str) -> String {
    let path = normalize(path);
    path.rsplit('/').next().unwrap_or_default().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FetchHandler {
    File { src: String, dest: String },
    Dir { src: String, dest: String },
}

impl FetchHandler {
    pub fn dest(&self) -> &str {
        match self {
            FetchHandler::File { dest, .. } | FetchHandler::Dir { dest, .. } => dest,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchArtifactBuilder {
    pub job: JobIdentifier,
    pub src: String,
    pub artifact_locator: String,
    pub checksum_locator: String,
    pub handler: FetchHandler,
}

impl FetchArtifactBuilder {
    pub fn build_command(&self) -> BuildCommand {
        let download = Download {
            url: format!("files/{}", self.artifact_locator),
            dest: self.handler.dest().to_string(),
            checksum_url: Some(format!("files/{}", self.checksum_locator)),
            checksum_path: Some(normalize(&self.src)),
        };
        match self.handler {
            FetchHandler::File { .. } => BuildCommand::download_file(download),
            FetchHandler::Dir { .. } => BuildCommand::download_dir(download),
        }
    }
}

pub struct FetchTaskBuilder;

impl FetchTaskBuilder {
    /// Resolve the job a fetch task pulls from.
    ///
    /// Without a pipeline path (or with the current pipeline's own name) the
    /// target is a stage of this pipeline instance: its actual counter once it
    /// has run, `latest` before. Otherwise the path names an upstream pipeline
    /// reached through dependency materials, possibly several hops away.
    pub fn resolve_job(
        &self,
        fetch: &FetchTask,
        pipeline: &Pipeline,
        resolver: &dyn UpstreamPipelineResolver,
    ) -> Result<JobIdentifier> {
        let path = fetch.ancestor_path();
        let is_current = match path.as_slice() {
            [] => true,
            [only] => only.eq_ignore_ascii_case(pipeline.name()),
            _ => false,
        };

        if is_current {
            let stage_counter = pipeline
                .find_stage(&fetch.stage)
                .map(|stage| StageCounter::Run(stage.counter))
                .unwrap_or(StageCounter::Latest);
            return Ok(JobIdentifier::of(
                pipeline.name(),
                pipeline.counter(),
                pipeline.label(),
                fetch.stage.clone(),
                stage_counter,
                fetch.job.clone(),
            ));
        }

        let revision = match path.split_first() {
            Some((ancestor, [])) => pipeline
                .build_cause
                .dependency_revision_for(ancestor)
                .cloned()
                .ok_or_else(|| Error::NotADependencyMaterial {
                    pipeline: pipeline.name().to_string(),
                    locator: format!("{}/{}/{}", ancestor, fetch.stage, fetch.job),
                })?,
            Some((ancestor, hops)) => self.walk_ancestry(fetch, pipeline, ancestor, hops, resolver)?,
            None => return Err(Error::Internal("empty fetch pipeline path".to_string())),
        };

        let stage_counter = if fetch.stage.eq_ignore_ascii_case(&revision.stage_name) {
            StageCounter::Run(revision.stage_counter)
        } else {
            StageCounter::Latest
        };

        Ok(JobIdentifier::of(
            revision.pipeline_name,
            revision.pipeline_counter,
            revision.pipeline_label,
            fetch.stage.clone(),
            stage_counter,
            fetch.job.clone(),
        ))
    }

    /// Follow `hops` from the nearest upstream outwards, then resolve `ancestor`
    /// from the build cause reached at the end.
    fn walk_ancestry(
        &self,
        fetch: &FetchTask,
        pipeline: &Pipeline,
        ancestor: &str,
        hops: &[&str],
        resolver: &dyn UpstreamPipelineResolver,
    ) -> Result<DependencyMaterialRevision> {
        let unresolved = |name: &str| Error::FetchAncestryUnresolved {
            pipeline: pipeline.name().to_string(),
            task: fetch.to_string(),
            unresolved: name.to_string(),
        };

        let mut cause: BuildCause = pipeline.build_cause.clone();
        for hop in hops.iter().rev() {
            let revision = cause
                .dependency_revision_for(hop)
                .ok_or_else(|| unresolved(*hop))?;
            cause = resolver.build_cause_for(&revision.pipeline_name, revision.pipeline_counter)?;
        }

        cause
            .dependency_revision_for(ancestor)
            .cloned()
            .ok_or_else(|| unresolved(ancestor))
    }
}

impl TaskBuilder for FetchTaskBuilder {
    fn create_builder(
        &self,
        task: &Task,
        pipeline: &Pipeline,
        resolver: &dyn UpstreamPipelineResolver,
    ) -> Result<Builder> {
        let TaskDetails::Fetch(fetch) = &task.details else {
            return Err(Error::Internal(format!(
                "{} builder cannot build a {} task",
                TaskKind::Fetch,
                task.kind()
            )));
        };

        let job = self.resolve_job(fetch, pipeline, resolver)?;
        info!(
            pipeline = %pipeline.name(),
            source = %job.build_locator(),
            "Resolved fetch artifact target"
        );

        let src = normalize(fetch.source.path());
        let dest = format!(
            "{}/{}",
            pipeline_working_dir(pipeline.name(), fetch.dest.as_deref()),
            base_name(&src)
        );
        let (artifact_locator, handler) = if fetch.source.is_file() {
            (
                job.artifact_locator(&src),
                FetchHandler::File { src: src.clone(), dest },
            )
        } else {
            (
                format!("{}.tar.gz", job.artifact_locator(&src)),
                FetchHandler::Dir { src: src.clone(), dest },
            )
        };

        Ok(Builder::new(
            task,
            BuilderAction::FetchArtifact(FetchArtifactBuilder {
                checksum_locator: format!("{}/{}", job.build_locator(), CHECKSUM_FILE),
                job,
                src,
                artifact_locator,
                handler,
            }),
        ))
    }
}
