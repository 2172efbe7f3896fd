//! Sandbox containers.
//!
//! Workspace resolution, launch configuration, the engine seam, interactive
//! channels and the orchestrator that ties them together.

mod channel;
mod config;
mod error;
mod orchestrator;
mod runtime;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
mod workspace;

pub use channel::{ChannelReader, ChannelWriter, ExecChannel};
pub use config::{ContainerConfig, validate_image_name};
pub use error::{SandboxError, SandboxResult};
pub use orchestrator::{SandboxLimits, SandboxOrchestrator, slugify};
pub use runtime::{ContainerRuntimeApi, ContainerStats, DockerRuntime, ManagedContainer};
pub use workspace::WorkspaceResolver;
