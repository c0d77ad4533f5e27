//! External collaborator interface for starting, stopping, and probing
//! backend containers/services. Concrete drivers (e.g. the Docker CLI
//! driver in `wakehost-container`) implement this trait; everything in
//! this workspace talks only to the trait (spec's "container-runtime
//! driver" external collaborator, specified only by interface).

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("container {0} not found")]
    NotFound(String),

    #[error("operation on {container} timed out after {secs}s")]
    Timeout { container: String, secs: u64 },

    #[error("driver command failed for {container}: {reason}")]
    CommandFailed { container: String, reason: String },
}

/// Observed run state of a container/service, as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Stopped,
    Unknown,
}

#[async_trait]
pub trait ContainerDriver: Send + Sync {
    async fn start(&self, container: &str) -> Result<(), DriverError>;
    async fn stop(&self, container: &str) -> Result<(), DriverError>;
    async fn restart(&self, container: &str) -> Result<(), DriverError>;
    async fn status(&self, container: &str) -> Result<RunState, DriverError>;
}
