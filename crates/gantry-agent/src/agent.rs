//! Main agent implementation.

use crate::cancel::CancellationToken;
use crate::composer::BuildAssignment;
use crate::config::AgentConfig;
use crate::console::{BufferedConsole, ConsoleUploader};
use crate::download::HttpFetcher;
use crate::error::AgentError;
use crate::ping::PingLoop;
use crate::remote::{AgentIdentity, BuildRepositoryRemote, PropertyPublisher};
use crate::session::{BuildSession, SessionServices};
use crate::updater::MaterialUpdaterRegistry;
use crate::work::BuildWork;
use gantry_core::instance::JobResult;
use std::sync::Arc;
use tokio::sync::{Semaphore, watch};
use tracing::{error, info, warn};
use url::Url;

/// Server-facing collaborators shared by every job the agent runs.
#[derive(Clone)]
pub struct AgentServices {
    pub remote: Arc<dyn BuildRepositoryRemote>,
    pub uploader: Arc<dyn ConsoleUploader>,
    pub fetcher: Arc<dyn HttpFetcher>,
    pub properties: Arc<dyn PropertyPublisher>,
    pub updaters: MaterialUpdaterRegistry,
}

/// The build agent. Runs one job at a time.
pub struct BuildAgent {
    config: AgentConfig,
    identity: AgentIdentity,
    base_url: Url,
    services: AgentServices,
    current_job_tx: watch::Sender<Option<CancellationToken>>,
    current_job_rx: watch::Receiver<Option<CancellationToken>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    job_semaphore: Arc<Semaphore>,
}

impl BuildAgent {
    pub fn new(config: AgentConfig, services: AgentServices) -> Result<Self, AgentError> {
        let base_url = config.base_url()?;
        let identity = AgentIdentity::new(config.agent_uuid, config.hostname.clone());
        let (current_job_tx, current_job_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            identity,
            base_url,
            services,
            current_job_tx,
            current_job_rx,
            shutdown_tx,
            shutdown_rx,
            job_semaphore: Arc::new(Semaphore::new(1)),
        })
    }

    /// Start pinging the server.
    pub fn start(&self) {
        info!(agent = %self.identity.uuid, hostname = %self.identity.hostname, "Starting build agent");

        let ping = PingLoop::new(
            self.identity.clone(),
            Arc::clone(&self.services.remote),
            self.config.ping_interval_secs,
            self.current_job_rx.clone(),
        );
        let shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            ping.run(shutdown_rx).await;
        });
    }

    /// Build one assigned job to completion.
    pub async fn execute(&self, assignment: BuildAssignment) -> Result<JobResult, AgentError> {
        if *self.shutdown_rx.borrow() {
            return Err(AgentError::ShuttingDown);
        }
        let permit = self
            .job_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AgentError::ShuttingDown)?;

        let cancel = CancellationToken::new();
        self.current_job_tx.send_replace(Some(cancel.clone()));

        let console = Arc::new(BufferedConsole::new(
            assignment.job.clone(),
            Arc::clone(&self.services.uploader),
            self.config.console_batch_size,
        ));
        let services = SessionServices {
            remote: Arc::clone(&self.services.remote),
            console,
            fetcher: Arc::clone(&self.services.fetcher),
            properties: Arc::clone(&self.services.properties),
            updaters: self.services.updaters.clone(),
            retry: self.config.retry_policies(),
        };
        let session = BuildSession::new(
            assignment.job.clone(),
            self.identity.clone(),
            self.config.working_dir.clone(),
            self.base_url.clone(),
            services,
            cancel,
        );

        let work = BuildWork::new(assignment);
        let result = work.run(&session).await;

        self.current_job_tx.send_replace(None);
        drop(permit);

        match result {
            Ok(JobResult::Passed) => {
                info!(job = %work.job(), "Job passed");
                Ok(JobResult::Passed)
            }
            Ok(result) => {
                warn!(job = %work.job(), result = %result, "Job did not pass");
                Ok(result)
            }
            Err(e) => {
                error!(job = %work.job(), error = %e, "Job execution error");
                Err(e.into())
            }
        }
    }

    /// Cancel the running job, if any.
    pub fn cancel_current(&self) {
        if let Some(token) = self.current_job_rx.borrow().as_ref() {
            info!(agent = %self.identity.uuid, "Cancelling current job");
            token.cancel();
        }
    }

    /// Stop pinging and wait for the running job to finish.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown");
        let _ = self.shutdown_tx.send(true);

        info!("Waiting for in-progress job to complete...");
        let _ = self.job_semaphore.acquire().await;
        self.job_semaphore.close();

        info!(agent = %self.identity.uuid, "Agent shutdown complete");
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn is_busy(&self) -> bool {
        self.current_job_rx.borrow().is_some()
    }
}
