//! # Launch Orchestrator
//!
//! Starts a validated fleet batch by batch, holding each batch until every
//! member reports HEALTHY or the batch deadline passes.

pub mod launcher;
pub mod orchestrator;

pub use launcher::{Launcher, ProcessLauncher};
pub use orchestrator::{
    LaunchFailure, LaunchOrchestrator, LaunchReport, LaunchTimings, SkippedAgent,
};
