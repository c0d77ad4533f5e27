//! Container driver backed by the `docker` CLI: each command runs with a
//! timeout and a bounded number of retries with backoff, distinguishing a
//! timed-out command from one that merely failed.

use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use wakehost_common::container::{ContainerDriver, DriverError, RunState};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
#[cfg(not(test))]
const RETRY_BACKOFF: Duration = Duration::from_secs(3);
#[cfg(test)]
const RETRY_BACKOFF: Duration = Duration::from_millis(10);
const MAX_ATTEMPTS: u32 = 3;

pub struct DockerDriver {
    binary: String,
}

impl DockerDriver {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }

    #[cfg(test)]
    fn with_binary(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    async fn run(&self, container: &str, args: &[&str]) -> Result<String, DriverError> {
        let mut last_err = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            let mut cmd = Command::new(&self.binary);
            cmd.args(args);

            let outcome = timeout(COMMAND_TIMEOUT, cmd.output()).await;

            match outcome {
                Err(_) => {
                    warn!(container, attempt, "docker command timed out");
                    return Err(DriverError::Timeout {
                        container: container.to_string(),
                        secs: COMMAND_TIMEOUT.as_secs(),
                    });
                }
                Ok(Err(err)) => {
                    last_err = err.to_string();
                }
                Ok(Ok(output)) if output.status.success() => {
                    return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
                }
                Ok(Ok(output)) => {
                    last_err = String::from_utf8_lossy(&output.stderr).trim().to_string();
                }
            }

            if attempt < MAX_ATTEMPTS {
                debug!(container, attempt, error = %last_err, "docker command failed, retrying");
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
        }

        Err(DriverError::CommandFailed {
            container: container.to_string(),
            reason: last_err,
        })
    }
}

impl Default for DockerDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ContainerDriver for DockerDriver {
    async fn start(&self, container: &str) -> Result<(), DriverError> {
        self.run(container, &["start", container]).await.map(|_| ())
    }

    async fn stop(&self, container: &str) -> Result<(), DriverError> {
        self.run(container, &["stop", container]).await.map(|_| ())
    }

    async fn restart(&self, container: &str) -> Result<(), DriverError> {
        self.run(container, &["restart", container]).await.map(|_| ())
    }

    async fn status(&self, container: &str) -> Result<RunState, DriverError> {
        let inspect_args = ["inspect", "--format", "{{.State.Running}}", container];
        match self.run(container, &inspect_args).await {
            Ok(output) if output.trim() == "true" => Ok(RunState::Running),
            Ok(_) => Ok(RunState::Stopped),
            Err(DriverError::CommandFailed { .. }) => Ok(RunState::Unknown),
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_binary_surfaces_command_failed_after_retries() {
        let driver = DockerDriver::with_binary("definitely-not-a-real-binary-xyz");
        let err = driver.start("any-container").await.unwrap_err();
        match err {
            DriverError::CommandFailed { container, .. } => assert_eq!(container, "any-container"),
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn status_with_unknown_binary_reports_unknown_state() {
        let driver = DockerDriver::with_binary("definitely-not-a-real-binary-xyz");
        let state = driver.status("any-container").await.unwrap();
        assert_eq!(state, RunState::Unknown);
    }
}
