//! Running approved commands through the user's shell.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

use crate::exec::cancellation::current_cancellation;

/// Combined result of one subprocess run.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    /// Interleaved stdout+stderr, captured in arrival order per stream.
    pub output: String,
    pub duration: Duration,
    pub cancelled: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.cancelled
    }
}

/// Executes command lines via `$SHELL -c`, falling back to `/bin/sh`.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: PathBuf,
}

impl ShellExecutor {
    /// Resolve the shell from `$SHELL`.
    pub fn from_env() -> Self {
        let shell = std::env::var("SHELL")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/bin/sh"));
        Self { shell }
    }

    pub fn with_shell(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    pub fn shell(&self) -> &Path {
        &self.shell
    }

    /// Run one command line to completion, streaming nothing: the line
    /// editor owns the terminal, so output is captured and printed by the
    /// caller. Honours the scoped cancellation token.
    pub async fn run(
        &self,
        command: &str,
        working_dir: &Path,
        env: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let started = Instant::now();
        debug!(%command, shell = %self.shell.display(), "spawning shell command");

        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .current_dir(working_dir)
            .envs(env)
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {} -c", self.shell.display()))?;

        let mut stdout = child.stdout.take().context("child stdout missing")?;
        let mut stderr = child.stderr.take().context("child stderr missing")?;

        let cancel = current_cancellation();
        let cancelled_fut = async {
            match &cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        let capture = async {
            let mut out_buf = Vec::new();
            let mut err_buf = Vec::new();
            let (out_res, err_res, status) = tokio::join!(
                stdout.read_to_end(&mut out_buf),
                stderr.read_to_end(&mut err_buf),
                child.wait(),
            );
            out_res.context("failed reading stdout")?;
            err_res.context("failed reading stderr")?;
            let status = status.context("failed waiting for child")?;

            let mut combined = String::from_utf8_lossy(&out_buf).into_owned();
            combined.push_str(&String::from_utf8_lossy(&err_buf));
            Ok::<_, anyhow::Error>((status.code().unwrap_or(-1), combined))
        };

        tokio::select! {
            result = capture => {
                let (exit_code, output) = result?;
                Ok(CommandOutput {
                    exit_code,
                    output,
                    duration: started.elapsed(),
                    cancelled: false,
                })
            }
            _ = cancelled_fut => {
                debug!(%command, "command cancelled by user interrupt");
                Ok(CommandOutput {
                    exit_code: 130,
                    output: String::new(),
                    duration: started.elapsed(),
                    cancelled: true,
                })
            }
            _ = tokio::time::sleep(timeout) => {
                anyhow::bail!("command timed out after {timeout:?}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn executor() -> ShellExecutor {
        ShellExecutor::with_shell("/bin/sh")
    }

    #[tokio::test]
    async fn captures_exit_code_and_output() {
        let output = executor()
            .run(
                "echo hello && exit 3",
                Path::new("/tmp"),
                &HashMap::new(),
                Duration::from_secs(10),
            )
            .await
            .unwrap();
        assert_eq!(output.exit_code, 3);
        assert!(output.output.contains("hello"));
        assert!(!output.success());
    }

    #[tokio::test]
    async fn zero_exit_is_success() {
        let output = executor()
            .run("true", Path::new("/tmp"), &HashMap::new(), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(output.success());
    }

    #[tokio::test]
    async fn stderr_is_captured_too() {
        let output = executor()
            .run(
                "echo oops >&2",
                Path::new("/tmp"),
                &HashMap::new(),
                Duration::from_secs(10),
            )
            .await
            .unwrap();
        assert!(output.output.contains("oops"));
    }

    #[tokio::test]
    async fn env_is_passed_through() {
        let mut env = HashMap::new();
        env.insert("DELTA_TEST_VAR".to_string(), "42".to_string());
        let output = executor()
            .run(
                "echo $DELTA_TEST_VAR",
                Path::new("/tmp"),
                &env,
                Duration::from_secs(10),
            )
            .await
            .unwrap();
        assert!(output.output.contains("42"));
    }

    #[tokio::test]
    async fn timeout_aborts_long_commands() {
        let result = executor()
            .run(
                "sleep 30",
                Path::new("/tmp"),
                &HashMap::new(),
                Duration::from_millis(100),
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn cancellation_returns_interrupt_code() {
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let output = crate::exec::with_cancellation(token, async {
            executor()
                .run(
                    "sleep 30",
                    Path::new("/tmp"),
                    &HashMap::new(),
                    Duration::from_secs(60),
                )
                .await
        })
        .await
        .unwrap();
        assert!(output.cancelled);
        assert_eq!(output.exit_code, 130);
    }
}
