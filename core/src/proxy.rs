use crate::shell::{ExecError, Executor};
use std::sync::Arc;
use tracing::debug;

/// Controls an nginx process through its command line interface.
///
/// Only the local storage backends invoke `reload`; the reconciler never
/// talks to the proxy directly.
#[derive(Clone)]
pub struct Nginx {
    executor: Arc<dyn Executor>,
}

impl Nginx {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    /// Runs nginx in the foreground. Resolves when the process exits.
    pub async fn run(&self) -> Result<(), ExecError> {
        debug!("starting nginx");
        let result = self.executor.exec("nginx -g 'daemon off;'").await;
        debug!("nginx stopped");
        result
    }

    /// Graceful shutdown.
    pub async fn stop(&self) -> Result<(), ExecError> {
        debug!("stopping nginx");
        self.executor.exec("nginx -s quit").await
    }

    /// Reloads the configuration. The config test runs first and its error is
    /// propagated unchanged; a failed test never triggers a reload.
    pub async fn reload(&self) -> Result<(), ExecError> {
        debug!("reloading nginx");
        self.test_config().await?;
        self.executor.exec("nginx -s reload").await
    }

    pub async fn test_config(&self) -> Result<(), ExecError> {
        debug!("testing nginx config");
        self.executor.exec("nginx -t").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingExecutor {
        commands: Mutex<Vec<String>>,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl Executor for RecordingExecutor {
        async fn exec(&self, command: &str) -> Result<(), ExecError> {
            self.commands.lock().unwrap().push(command.to_string());
            if self.fail_on == Some(command) {
                return Err(ExecError::Failed {
                    command: command.to_string(),
                    status: ExitStatus::from_raw(1),
                    output: "boom".into(),
                });
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn reload_tests_config_first() {
        let executor = Arc::new(RecordingExecutor::default());
        let nginx = Nginx::new(executor.clone());

        nginx.reload().await.unwrap();

        let commands = executor.commands.lock().unwrap();
        assert_eq!(*commands, vec!["nginx -t", "nginx -s reload"]);
    }

    #[tokio::test]
    async fn failed_config_test_prevents_reload() {
        let executor = Arc::new(RecordingExecutor {
            fail_on: Some("nginx -t"),
            ..RecordingExecutor::default()
        });
        let nginx = Nginx::new(executor.clone());

        let err = nginx.reload().await.unwrap_err();
        assert!(matches!(err, ExecError::Failed { command, .. } if command == "nginx -t"));

        let commands = executor.commands.lock().unwrap();
        assert_eq!(*commands, vec!["nginx -t"]);
    }
}
