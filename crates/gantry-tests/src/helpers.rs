//! Recording fakes for the ports the agent and builders depend on.

use async_trait::async_trait;
use gantry_agent::console::{ConsoleUploader, TaggedLine};
use gantry_agent::download::HttpFetcher;
use gantry_agent::error::{DownloadError, MaterialUpdateError, RemoteError};
use gantry_agent::remote::{AgentIdentity, AgentInstruction, BuildRepositoryRemote, PropertyPublisher};
use gantry_agent::updater::MaterialUpdater;
use gantry_core::ids::JobIdentifier;
use gantry_core::instance::{JobResult, JobState};
use gantry_core::material::{BuildCause, MaterialRevision};
use gantry_core::ports::UpstreamPipelineResolver;
use gantry_core::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use url::Url;

/// Remote that records every report as `kind:value`.
#[derive(Default)]
pub struct RecordingRemote {
    reports: Mutex<Vec<String>>,
    cancel_on_ping: AtomicBool,
}

impl RecordingRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next pings answer with a cancel instruction.
    pub fn request_cancel(&self) {
        self.cancel_on_ping.store(true, Ordering::SeqCst);
    }

    pub fn reports(&self) -> Vec<String> {
        self.reports.lock().clone()
    }

    fn record(&self, report: String) {
        self.reports.lock().push(report);
    }
}

#[async_trait]
impl BuildRepositoryRemote for RecordingRemote {
    async fn report_current_status(
        &self,
        _agent: &AgentIdentity,
        _job: &JobIdentifier,
        state: JobState,
    ) -> std::result::Result<(), RemoteError> {
        self.record(format!("status:{}", state));
        Ok(())
    }

    async fn report_completing(
        &self,
        _agent: &AgentIdentity,
        _job: &JobIdentifier,
        result: JobResult,
    ) -> std::result::Result<(), RemoteError> {
        self.record(format!("completing:{}", result));
        Ok(())
    }

    async fn report_completed(
        &self,
        _agent: &AgentIdentity,
        _job: &JobIdentifier,
        result: JobResult,
    ) -> std::result::Result<(), RemoteError> {
        self.record(format!("completed:{}", result));
        Ok(())
    }

    async fn ping(&self, _agent: &AgentIdentity) -> std::result::Result<AgentInstruction, RemoteError> {
        Ok(AgentInstruction {
            should_cancel: self.cancel_on_ping.load(Ordering::SeqCst),
        })
    }
}

/// Console uploader keeping every uploaded line, optionally failing the first uploads.
#[derive(Default)]
pub struct RecordingUploader {
    lines: Mutex<Vec<TaggedLine>>,
    failures_left: AtomicU32,
}

impl RecordingUploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(times: u32) -> Self {
        Self {
            lines: Mutex::new(Vec::new()),
            failures_left: AtomicU32::new(times),
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().iter().map(|l| l.line.clone()).collect()
    }

    pub fn contains(&self, text: &str) -> bool {
        self.lines.lock().iter().any(|l| l.line.contains(text))
    }
}

#[async_trait]
impl ConsoleUploader for RecordingUploader {
    async fn upload(&self, _job: &JobIdentifier, lines: &[TaggedLine]) -> std::result::Result<(), RemoteError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RemoteError::Unreachable("console endpoint down".to_string()));
        }
        self.lines.lock().extend_from_slice(lines);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingProperties {
    properties: Mutex<Vec<(String, String)>>,
    errors: Mutex<Vec<String>>,
}

impl RecordingProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn properties(&self) -> Vec<(String, String)> {
        self.properties.lock().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }
}

#[async_trait]
impl PropertyPublisher for RecordingProperties {
    async fn set_property(&self, _job: &JobIdentifier, name: &str, value: &str) -> std::result::Result<(), RemoteError> {
        self.properties.lock().push((name.to_string(), value.to_string()));
        Ok(())
    }

    async fn report_error_message(
        &self,
        _job: &JobIdentifier,
        message: &str,
        _cause: &str,
    ) -> std::result::Result<(), RemoteError> {
        self.errors.lock().push(message.to_string());
        Ok(())
    }
}

/// Updater that fails a fixed number of times before succeeding.
pub struct ScriptedUpdater {
    failures: u32,
    message: String,
    calls: AtomicU32,
}

impl ScriptedUpdater {
    pub fn failing(failures: u32, message: impl Into<String>) -> Self {
        Self {
            failures,
            message: message.into(),
            calls: AtomicU32::new(0),
        }
    }

    pub fn succeeding() -> Self {
        Self::failing(0, "")
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MaterialUpdater for ScriptedUpdater {
    async fn update(&self, _revision: &MaterialRevision, dest: &Path) -> std::result::Result<(), MaterialUpdateError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(MaterialUpdateError::Failed(self.message.clone()));
        }
        tokio::fs::create_dir_all(dest).await?;
        Ok(())
    }
}

/// Fetcher serving canned bodies by URL; anything else is a 404.
#[derive(Default)]
pub struct StubFetcher {
    bodies: HashMap<String, Vec<u8>>,
}

impl StubFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, url: &str, body: impl Into<Vec<u8>>) -> Self {
        self.bodies.insert(url.to_string(), body.into());
        self
    }
}

#[async_trait]
impl HttpFetcher for StubFetcher {
    async fn fetch(&self, url: &Url) -> std::result::Result<Vec<u8>, DownloadError> {
        self.bodies
            .get(url.as_str())
            .cloned()
            .ok_or_else(|| DownloadError::Status {
                url: url.to_string(),
                status: 404,
            })
    }
}

/// Upstream build causes keyed by pipeline name and counter.
#[derive(Default)]
pub struct MapResolver {
    causes: HashMap<(String, u32), BuildCause>,
}

impl MapResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, pipeline: &str, counter: u32, cause: BuildCause) -> Self {
        self.causes.insert((pipeline.to_string(), counter), cause);
        self
    }
}

impl UpstreamPipelineResolver for MapResolver {
    fn build_cause_for(&self, pipeline_name: &str, pipeline_counter: u32) -> Result<BuildCause> {
        self.causes
            .get(&(pipeline_name.to_string(), pipeline_counter))
            .cloned()
            .ok_or_else(|| Error::Internal(format!("no build cause for {}/{}", pipeline_name, pipeline_counter)))
    }
}
