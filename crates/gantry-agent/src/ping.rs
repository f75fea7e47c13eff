//! Ping loop: keeps the server informed and picks up cancel instructions.

use crate::cancel::CancellationToken;
use crate::remote::{AgentIdentity, BuildRepositoryRemote};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Duration, interval};
use tracing::{debug, error, info};

pub struct PingLoop {
    identity: AgentIdentity,
    remote: Arc<dyn BuildRepositoryRemote>,
    interval_secs: u64,
    current_job: watch::Receiver<Option<CancellationToken>>,
}

impl PingLoop {
    pub fn new(
        identity: AgentIdentity,
        remote: Arc<dyn BuildRepositoryRemote>,
        interval_secs: u64,
        current_job: watch::Receiver<Option<CancellationToken>>,
    ) -> Self {
        Self {
            identity,
            remote,
            interval_secs: interval_secs.max(1),
            current_job,
        }
    }

    /// Ping until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));

        info!(
            agent = %self.identity.uuid,
            interval_secs = self.interval_secs,
            "Starting ping loop"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.ping().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Ping loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub(crate) async fn ping(&self) {
        match self.remote.ping(&self.identity).await {
            Ok(instruction) if instruction.should_cancel => {
                let token = self.current_job.borrow().clone();
                match token {
                    Some(token) => {
                        info!(agent = %self.identity.uuid, "Server asked to cancel the running job");
                        token.cancel();
                    }
                    None => debug!(agent = %self.identity.uuid, "Cancel instruction with no job running"),
                }
            }
            Ok(_) => debug!(agent = %self.identity.uuid, "Ping sent"),
            Err(e) => error!(error = %e, "Failed to ping server"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::remote::AgentInstruction;
    use async_trait::async_trait;
    use gantry_core::ids::{AgentId, JobIdentifier};
    use gantry_core::instance::{JobResult, JobState};

    struct CancellingRemote;

    #[async_trait]
    impl BuildRepositoryRemote for CancellingRemote {
        async fn report_current_status(&self, _: &AgentIdentity, _: &JobIdentifier, _: JobState) -> Result<(), RemoteError> {
            Ok(())
        }

        async fn report_completing(&self, _: &AgentIdentity, _: &JobIdentifier, _: JobResult) -> Result<(), RemoteError> {
            Ok(())
        }

        async fn report_completed(&self, _: &AgentIdentity, _: &JobIdentifier, _: JobResult) -> Result<(), RemoteError> {
            Ok(())
        }

        async fn ping(&self, _: &AgentIdentity) -> Result<AgentInstruction, RemoteError> {
            Ok(AgentInstruction::cancel())
        }
    }

    #[tokio::test]
    async fn test_cancel_instruction_cancels_running_job() {
        let token = CancellationToken::new();
        let (_tx, rx) = watch::channel(Some(token.clone()));
        let ping = PingLoop::new(
            AgentIdentity::new(AgentId::new(), "builder-1"),
            Arc::new(CancellingRemote),
            10,
            rx,
        );

        ping.ping().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (_job_tx, job_rx) = watch::channel(None);
        let ping = PingLoop::new(
            AgentIdentity::new(AgentId::new(), "builder-1"),
            Arc::new(CancellingRemote),
            1,
            job_rx,
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move { ping.run(shutdown_rx).await });
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("ping loop should stop")
            .unwrap();
    }
}
