use async_trait::async_trait;
use std::process::ExitStatus;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("command {command:?} exited with {status}: {output}")]
    Failed {
        command: String,
        status: ExitStatus,
        output: String,
    },
    #[error("failed to spawn {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Executes shell-style commands.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn exec(&self, command: &str) -> Result<(), ExecError>;
}

/// Runs the command through `sh -c`.
#[derive(Debug, Default)]
pub struct ShellExecutor;

#[async_trait]
impl Executor for ShellExecutor {
    async fn exec(&self, command: &str) -> Result<(), ExecError> {
        debug!(cmd = command, "executing shell command");

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|source| ExecError::Spawn {
                command: command.to_string(),
                source,
            })?;

        if !output.status.success() {
            let mut combined = output.stdout;
            combined.extend_from_slice(&output.stderr);
            return Err(ExecError::Failed {
                command: command.to_string(),
                status: output.status,
                output: String::from_utf8_lossy(&combined).into_owned(),
            });
        }

        Ok(())
    }
}

/// Logs commands instead of executing them. Used by the dry-run mode, where
/// generated configuration is written but nginx is never invoked.
#[derive(Debug, Default)]
pub struct LogExecutor;

#[async_trait]
impl Executor for LogExecutor {
    async fn exec(&self, command: &str) -> Result<(), ExecError> {
        info!(cmd = command, "executing shell command");
        Ok(())
    }
}
