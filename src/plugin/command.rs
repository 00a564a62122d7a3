use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::error::EnumerationError;

/// Captured output of an external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Data source for plugins that shell out to system tools.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, EnumerationError>;
}

/// Runs commands on the host with a C locale and a per-command timeout.
pub struct SystemCommandRunner {
    timeout: Duration,
}

impl SystemCommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemCommandRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, EnumerationError> {
        debug!(program, ?args, "running command");

        let child = Command::new(program)
            .args(args)
            .env("LC_ALL", "C")
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| EnumerationError::CommandTimeout {
                program: program.to_string(),
                seconds: self.timeout.as_secs(),
            })?
            .map_err(|e| EnumerationError::Command {
                program: program.to_string(),
                message: e.to_string(),
            })?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            code: output.status.code(),
        })
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::HashMap;

    /// Answers commands from a table keyed by the full command line.
    #[derive(Default)]
    pub(crate) struct FakeRunner {
        responses: HashMap<String, CommandOutput>,
    }

    impl FakeRunner {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn respond(mut self, cmdline: &str, stdout: &str) -> Self {
            self.responses.insert(
                cmdline.to_string(),
                CommandOutput {
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                    code: Some(0),
                },
            );
            self
        }

        pub(crate) fn fail(mut self, cmdline: &str, code: i32) -> Self {
            self.responses.insert(
                cmdline.to_string(),
                CommandOutput {
                    stdout: String::new(),
                    stderr: "failed".to_string(),
                    code: Some(code),
                },
            );
            self
        }
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, EnumerationError> {
            let cmdline = std::iter::once(program)
                .chain(args.iter().copied())
                .collect::<Vec<_>>()
                .join(" ");
            self.responses
                .get(&cmdline)
                .cloned()
                .ok_or_else(|| EnumerationError::Command {
                    program: program.to_string(),
                    message: format!("not found: {}", cmdline),
                })
        }
    }
}
