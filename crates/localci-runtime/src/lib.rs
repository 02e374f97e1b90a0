//! # localci-runtime
//!
//! The `docker` CLI seen as a narrow [`runtime::Runtime`] trait: image
//! presence, volumes, container lifecycle, and file copy in and out.
//! Nothing here knows about jobs or pipelines — that's `localci-engine`.

#![warn(unused)]

pub mod docker;
pub mod runtime;

pub use docker::DockerRuntime;
pub use runtime::{BindMount, ContainerRunOutcome, ContainerSpec, Runtime, RuntimeError, RuntimeErrorKind};
