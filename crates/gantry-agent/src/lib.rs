//! Build agent for Gantry.
//!
//! Turns configured tasks into builders, composes them into a command tree
//! and runs that tree in a [`session::BuildSession`], reporting progress to
//! the server.

pub mod agent;
pub mod builders;
pub mod cancel;
pub mod command;
pub mod composer;
pub mod config;
pub mod console;
pub mod download;
pub mod error;
pub mod ping;
pub mod remote;
pub mod retry;
pub mod session;
pub mod updater;
pub mod work;

pub use agent::{AgentServices, BuildAgent};
pub use builders::{Builder, BuilderFactory, TaskBuilder};
pub use cancel::CancellationToken;
pub use command::{BuildCommand, CommandKind};
pub use composer::{BuildAssignment, BuildComposer};
pub use config::AgentConfig;
pub use console::{BufferedConsole, ConsoleSink, ConsoleTag, ConsoleUploader, InMemoryConsole, TaggedLine};
pub use error::{AgentError, ConfigError, DownloadError, MaterialUpdateError, RemoteError};
pub use remote::{AgentIdentity, AgentInstruction, BuildRepositoryRemote, PropertyPublisher};
pub use retry::{RetryPolicies, RetryPolicy};
pub use session::{BuildSession, SessionServices, SessionState};
pub use updater::{MaterialUpdater, MaterialUpdaterRegistry};
pub use work::BuildWork;
