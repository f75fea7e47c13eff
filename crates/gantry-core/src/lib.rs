//! Gantry Core
//!
//! Core domain types, traits, and error handling for Gantry.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used by the scheduler and the agent.

pub mod config;
pub mod error;
pub mod ids;
pub mod instance;
pub mod label;
pub mod material;
pub mod plan;
pub mod ports;

pub use error::{Error, Result};
pub use ids::*;
