//! Pipeline, stage and job instantiation for Gantry.
//!
//! Everything here is synchronous and free of I/O: the factory works on the
//! configuration tree, a build cause and a [`context::SchedulingContext`].

pub mod context;
pub mod factory;
pub mod job_type;

pub use context::{AgentSummary, ElasticProfileResolver, SchedulingContext};
pub use factory::InstanceFactory;
pub use job_type::{CounterBasedJobNameGenerator, JobType};
