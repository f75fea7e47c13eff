//! Agent harness wiring the recording fakes into sessions and agents.

use crate::helpers::{RecordingProperties, RecordingRemote, RecordingUploader, StubFetcher};
use gantry_agent::cancel::CancellationToken;
use gantry_agent::config::AgentConfig;
use gantry_agent::console::ConsoleSink;
use gantry_agent::download::HttpFetcher;
use gantry_agent::error::AgentError;
use gantry_agent::retry::{RetryPolicies, RetryPolicy, RetrySettings};
use gantry_agent::updater::{MaterialUpdater, MaterialUpdaterRegistry};
use gantry_agent::{AgentIdentity, AgentServices, BuildAgent, BuildSession, SessionServices};
use gantry_core::ids::{AgentId, JobIdentifier};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use url::Url;

pub const SERVER_URL: &str = "http://gantry.test/go/";

/// Sandbox working directory plus recording collaborators.
///
/// Drop this to remove the working directory.
pub struct AgentHarness {
    pub dir: TempDir,
    pub remote: Arc<RecordingRemote>,
    pub uploader: Arc<RecordingUploader>,
    pub properties: Arc<RecordingProperties>,
    pub fetcher: Arc<dyn HttpFetcher>,
    pub updaters: MaterialUpdaterRegistry,
    pub base_url: Url,
}

impl AgentHarness {
    pub fn new() -> Self {
        crate::init_test_logging();

        Self {
            dir: tempfile::tempdir().expect("Failed to create working directory"),
            remote: Arc::new(RecordingRemote::new()),
            uploader: Arc::new(RecordingUploader::new()),
            properties: Arc::new(RecordingProperties::new()),
            fetcher: Arc::new(StubFetcher::new()),
            updaters: MaterialUpdaterRegistry::new(),
            base_url: Url::parse(SERVER_URL).expect("Invalid test server url"),
        }
    }

    pub fn with_updater(mut self, material_type: &str, updater: Arc<dyn MaterialUpdater>) -> Self {
        self.updaters = self.updaters.with(material_type, updater);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn HttpFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn with_uploader(mut self, uploader: Arc<RecordingUploader>) -> Self {
        self.uploader = uploader;
        self
    }

    pub fn working_dir(&self) -> &Path {
        self.dir.path()
    }

    /// Three attempts, 10 ms apart.
    pub fn retry_policies() -> RetryPolicies {
        RetryPolicies::new(RetryPolicy::new(3, Duration::from_millis(10)))
    }

    pub fn session(&self, job: JobIdentifier, console: Arc<dyn ConsoleSink>, cancel: CancellationToken) -> BuildSession {
        let services = SessionServices {
            remote: self.remote.clone(),
            console,
            fetcher: Arc::clone(&self.fetcher),
            properties: self.properties.clone(),
            updaters: self.updaters.clone(),
            retry: Self::retry_policies(),
        };
        BuildSession::new(
            job,
            AgentIdentity::new(AgentId::new(), "test-agent"),
            self.dir.path().to_path_buf(),
            self.base_url.clone(),
            services,
            cancel,
        )
    }

    pub fn config(&self) -> AgentConfig {
        AgentConfig {
            hostname: "test-agent".to_string(),
            server_url: self.base_url.to_string(),
            working_dir: self.dir.path().to_path_buf(),
            console_batch_size: 5,
            ping_interval_secs: 1,
            material_retry_default: RetrySettings {
                attempts: 3,
                delay_ms: 10,
            },
            ..AgentConfig::default()
        }
    }

    pub fn agent(&self) -> Result<BuildAgent, AgentError> {
        let services = AgentServices {
            remote: self.remote.clone(),
            uploader: self.uploader.clone(),
            fetcher: Arc::clone(&self.fetcher),
            properties: self.properties.clone(),
            updaters: self.updaters.clone(),
        };
        BuildAgent::new(self.config(), services)
    }
}

impl Default for AgentHarness {
    fn default() -> Self {
        Self::new()
    }
}
