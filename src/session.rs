//! Session bootstrap and the interactive loop.
//!
//! The REPL here is deliberately minimal (the line editor proper is a
//! separate concern): read a line, hand it to the facade, repeat. Ctrl-C
//! cancels the in-flight command through the scoped cancellation token
//! rather than killing the session.

use std::io::{BufRead, IsTerminal, Write};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use semver::Version;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use delta_core::commands::{Facade, LineOutcome};
use delta_core::config::paths::ConfigPaths;
use delta_core::config::system::SystemConfig;
use delta_core::exec::with_cancellation;
use delta_core::update::channel::UpdateSettings;
use delta_core::update::history::{UpdateHistory, UpdateType};
use delta_core::update::validate::PostInstallValidator;
use delta_core::update::UpdateEngine;
use delta_core::validation::prompter::{PromptVerdict, SafetyPrompt};
use delta_core::validation::risk::ValidationResult;
use delta_core::validation::TerminalPrompt;

use crate::cli::args::Cli;

const EXIT_INTERRUPT: u8 = 130;

/// Prompt that refuses everything, for non-interactive runs.
struct DenyingPrompt;

impl SafetyPrompt for DenyingPrompt {
    fn prompt(&self, command: &str, _result: &ValidationResult) -> Result<PromptVerdict> {
        eprintln!("delta: refusing risky command in non-interactive mode: {command}");
        Ok(PromptVerdict::Cancel)
    }
}

pub struct Session {
    facade: Facade,
    scheduler_cancel: CancellationToken,
}

pub fn init_tracing(args: &Cli) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(match args.verbose {
            0 => "error",
            1 => "delta=debug,delta_core=debug",
            _ => "trace",
        })
    };

    // Logs go to stderr; the interactive prompt owns stdout.
    let result = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
    if result.is_err() {
        debug!("tracing already initialized");
    }
    Ok(())
}

impl Session {
    pub async fn bootstrap(args: &Cli) -> Result<Session> {
        if let Some(dir) = &args.config_dir {
            std::env::set_var(delta_core::config::ENV_CONFIG_DIR, dir);
        }

        let paths = ConfigPaths::resolve().context("cannot resolve the config directory")?;
        paths
            .ensure_layout()
            .context("config directory is not writable")?;
        let config = SystemConfig::load(&paths.system_config_file())?;

        let update = build_update_engine(&paths)?;

        let prompt: Box<dyn SafetyPrompt> =
            if args.non_interactive || !std::io::stdin().is_terminal() {
                Box::new(DenyingPrompt)
            } else {
                Box::new(TerminalPrompt)
            };

        let facade = Facade::bootstrap(paths, config, prompt, update.clone())?;

        // Out-of-band work: startup update notification and the scheduler
        // tick loop, both owned tasks joined at shutdown via cancellation.
        if !args.no_update_check && update.settings().enabled {
            let engine = update.clone();
            tokio::spawn(async move {
                match engine.check().await {
                    Ok(Some(release)) => {
                        eprintln!(
                            "delta: update {} is available (current {}); run :update install",
                            release.tag,
                            engine.current_version()
                        );
                    }
                    Ok(None) => {}
                    Err(err) => debug!(%err, "startup update check failed"),
                }
            });
        }

        let scheduler_cancel = CancellationToken::new();
        {
            let scheduler = facade.scheduler();
            let engine = update.clone();
            let cancel = scheduler_cancel.clone();
            tokio::spawn(async move {
                scheduler
                    .run_loop(Duration::from_secs(60), cancel, move |entry| {
                        let engine = engine.clone();
                        async move {
                            let success = delta_core::update::engine::install_latest_simple(
                                &engine,
                                UpdateType::Scheduled,
                                "scheduler",
                            )
                            .await
                            .is_ok();
                            (entry, success)
                        }
                    })
                    .await;
            });
        }

        Ok(Session {
            facade,
            scheduler_cancel,
        })
    }

    /// `-c` mode: one line, one exit code.
    pub async fn run_single(&mut self, command: &str) -> Result<ExitCode> {
        let outcome = self.handle_with_interrupt(command).await?;
        Ok(ExitCode::from(exit_code_for(&outcome)))
    }

    /// Interactive (or piped-stdin) loop.
    pub async fn run_repl(&mut self) -> Result<ExitCode> {
        let interactive = std::io::stdin().is_terminal();
        let stdin = std::io::stdin();
        let mut lines = stdin.lock().lines();
        let mut last_code = 0u8;

        loop {
            if interactive {
                print!("delta> ");
                std::io::stdout().flush().ok();
            }
            let Some(line) = lines.next() else {
                break; // EOF
            };
            let line = line.context("failed to read input")?;

            match self.handle_with_interrupt(&line).await? {
                LineOutcome::Exit => break,
                outcome => {
                    last_code = exit_code_for(&outcome);
                    // A failed command does not end the session.
                }
            }
        }
        Ok(ExitCode::from(if interactive { 0 } else { last_code }))
    }

    /// Run one line with Ctrl-C wired to the cancellation scope.
    async fn handle_with_interrupt(&mut self, line: &str) -> Result<LineOutcome> {
        let token = CancellationToken::new();
        let interrupt_token = token.clone();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupt_token.cancel();
            }
        });

        let outcome = with_cancellation(token.clone(), self.facade.handle_line(line)).await;
        interrupt.abort();

        if token.is_cancelled() {
            eprintln!();
            return Ok(LineOutcome::Executed {
                exit_code: i32::from(EXIT_INTERRUPT),
            });
        }
        outcome
    }

    pub async fn shutdown(&mut self) {
        self.scheduler_cancel.cancel();
        // Give the owned tasks a beat to observe cancellation.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn build_update_engine(paths: &ConfigPaths) -> Result<Arc<UpdateEngine>> {
    let settings = UpdateSettings::load(&paths.update_config_file())?;
    let current_version = Version::parse(env!("CARGO_PKG_VERSION"))
        .context("crate version is not valid semver")?;
    let binary_path = std::env::current_exe().context("cannot locate the running binary")?;

    let validator = PostInstallValidator::new(vec![
        paths.system_config_file(),
        paths.update_config_file(),
    ]);

    Ok(Arc::new(UpdateEngine::new(
        settings,
        UpdateHistory::new(paths.update_history_log()),
        Arc::new(validator),
        paths.downloads_dir(),
        paths.backups_dir(),
        binary_path,
        current_version,
    )))
}

fn exit_code_for(outcome: &LineOutcome) -> u8 {
    let code = outcome.exit_code();
    if code == 0 { 0 } else { code.clamp(1, 255) as u8 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denying_prompt_always_cancels() {
        let prompt = DenyingPrompt;
        let verdict = prompt
            .prompt("rm -rf /tmp/x", &ValidationResult::clean())
            .unwrap();
        assert_eq!(verdict, PromptVerdict::Cancel);
    }

    #[test]
    fn exit_codes_map_onto_process_codes() {
        assert_eq!(exit_code_for(&LineOutcome::Empty), 0);
        assert_eq!(exit_code_for(&LineOutcome::Executed { exit_code: 0 }), 0);
        assert_eq!(exit_code_for(&LineOutcome::Executed { exit_code: 130 }), 130);
        // Negative codes clamp into the valid range.
        assert_eq!(exit_code_for(&LineOutcome::Executed { exit_code: -1 }), 1);
        assert_eq!(exit_code_for(&LineOutcome::Denied), 1);
    }
}
