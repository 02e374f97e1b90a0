//! # localci-engine
//!
//! Runs a single compiled job to completion: workspace or container
//! preparation, script execution with a silence watchdog, artifact
//! extraction, coverage scanning, and guaranteed cleanup.
//!
//! This crate knows nothing about DAGs or wave dispatch — that is
//! `localci-scheduler`, which calls [`engine::JobEngine::run`] once per
//! eligible job and folds the resulting [`localci_core::JobRun`] back into
//! its own state.

#![warn(unused)]

pub mod artifacts;
pub mod cache_lock;
pub mod container;
pub mod coverage;
pub mod engine;
pub mod script;
pub mod sink;
pub mod watchdog;
pub mod workspace;

pub use engine::{JobEngine, JobEngineConfig};
pub use sink::{ConsoleSink, MockSink, Sink, SinkError, SinkErrorKind};
pub use watchdog::{SilenceWatchdog, DEFAULT_SILENCE_WINDOW};

/// localci-engine version.
pub const VERSION: &str = "0.1.0";
