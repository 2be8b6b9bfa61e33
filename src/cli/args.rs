//! Argument parsing.

use clap::Parser;
use std::path::PathBuf;

/// Delta - an interactive shell enhancement layer with command validation,
/// AI-assisted memory, and safe self-update.
#[derive(Debug, Parser)]
#[command(name = "delta", version, about, long_about = None)]
pub struct Cli {
    /// Run a single command (internal `:command` or shell line) and exit.
    #[arg(short = 'c', long = "command", value_name = "CMD")]
    pub command: Option<String>,

    /// Override the configuration directory (also `DELTA_CONFIG_DIR`).
    #[arg(long, value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    /// Skip the startup update notification.
    #[arg(long)]
    pub no_update_check: bool,

    /// Answer safety prompts with Cancel instead of asking (for scripts).
    #[arg(long)]
    pub non_interactive: bool,

    /// Log verbosity: repeat for more (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_command_mode_parses() {
        let cli = Cli::parse_from(["delta", "-c", "ls -la"]);
        assert_eq!(cli.command.as_deref(), Some("ls -la"));
        assert!(!cli.non_interactive);
    }

    #[test]
    fn defaults_are_interactive() {
        let cli = Cli::parse_from(["delta"]);
        assert!(cli.command.is_none());
        assert!(!cli.no_update_check);
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn config_dir_flag_parses() {
        let cli = Cli::parse_from(["delta", "--config-dir", "/tmp/delta-test"]);
        assert_eq!(cli.config_dir.as_deref(), Some(std::path::Path::new("/tmp/delta-test")));
    }
}
