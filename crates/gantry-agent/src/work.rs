//! A unit of agent work: one assignment built in one session.

use crate::composer::{BuildAssignment, BuildComposer};
use crate::error::RemoteError;
use crate::session::BuildSession;
use gantry_core::ids::JobIdentifier;
use gantry_core::instance::JobResult;
use tracing::info;

pub struct BuildWork {
    assignment: BuildAssignment,
}

impl BuildWork {
    pub fn new(assignment: BuildAssignment) -> Self {
        Self { assignment }
    }

    pub fn job(&self) -> &JobIdentifier {
        &self.assignment.job
    }

    pub fn assignment(&self) -> &BuildAssignment {
        &self.assignment
    }

    pub async fn run(&self, session: &BuildSession) -> Result<JobResult, RemoteError> {
        let command = BuildComposer::new(&self.assignment).compose();
        info!(
            job = %self.assignment.job,
            builders = self.assignment.builders.len(),
            materials = self.assignment.materials.len(),
            "Running build work"
        );
        session.build(&command).await
    }
}
