//! Shared test infrastructure for Gantry.
//!
//! Fixtures build configuration trees and build causes; helpers provide
//! recording fakes for every port the agent talks to.
//!
//! # Usage
//!
//! ```ignore
//! use gantry_tests::AgentHarness;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let harness = AgentHarness::new();
//!     // Use harness.session(..), harness.remote, harness.uploader, etc.
//! }
//! ```

pub mod context;
pub mod fixtures;
pub mod helpers;

pub use context::AgentHarness;
pub use fixtures::*;
pub use helpers::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,gantry_scheduler=debug,gantry_agent=debug")),
        )
        .with_test_writer()
        .try_init();
}
