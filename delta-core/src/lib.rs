//! Core library for Delta, an interactive shell-enhancement layer.
//!
//! Delta interposes on the user's command stream: every line is checked for
//! syntax errors and safety hazards before it reaches the shell, approved
//! commands are recorded into an embedding-backed memory for later
//! suggestion, the binary keeps itself up to date with backup and rollback,
//! and declarative task agents automate multi-step workflows.
//!
//! The crate is organised around explicit capability objects wired once at
//! startup (clock, config root, HTTP client, database handle, prompter)
//! rather than process-wide singletons, so every subsystem is testable in
//! isolation.

pub mod agents;
pub mod commands;
pub mod config;
pub mod exec;
pub mod memory;
pub mod update;
pub mod utils;
pub mod validation;

pub use config::paths::ConfigPaths;
pub use config::system::SystemConfig;
pub use validation::risk::{ErrorKind, Finding, RiskLevel, ValidationResult};
