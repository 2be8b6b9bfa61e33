//! The facade: one entry point per input line.
//!
//! Lines beginning with `:` dispatch to the internal command table; anything
//! else goes through validation, the safety prompter, the shell, and finally
//! the command memory. The decision record strictly precedes execution,
//! which strictly precedes the memory record.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, warn};

use crate::agents::recovery::NoSuggestions;
use crate::agents::{AgentRegistry, AgentRunner, PatternLibrary, RunOptions, ShellBackend};
use crate::agents::recovery::LearnedSolutionStore;
use crate::commands::registry::CommandRegistry;
use crate::config::paths::ConfigPaths;
use crate::config::system::SystemConfig;
use crate::exec::shell::ShellExecutor;
use crate::memory::store::{CommandRecord, ImportStrategy};
use crate::memory::{EmbeddingProvider, HashingEmbeddings, HttpEmbeddings, VectorMemoryStore};
use crate::update::history::UpdateType;
use crate::update::scheduler::{Recurrence, ScheduledUpdate, UpdateScheduler};
use crate::update::{engine::install_latest_simple, UpdateEngine, UpdateError};
use crate::validation::cicd::EnvSnapshot;
use crate::validation::decisions::DecisionLog;
use crate::validation::git::UnknownWorktree;
use crate::validation::rules::SafetyRuleSet;
use crate::validation::{SafetyPrompt, SafetyPrompter, ValidationEngine};

/// What happened to one input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    /// Blank input; nothing to do.
    Empty,
    /// An internal command ran with this exit code.
    Internal(i32),
    /// The command was forwarded to the shell.
    Executed { exit_code: i32 },
    /// The prompter (or policy) refused the command.
    Denied,
    /// The user asked to leave.
    Exit,
}

impl LineOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            LineOutcome::Empty | LineOutcome::Exit => 0,
            LineOutcome::Internal(code) => *code,
            LineOutcome::Executed { exit_code } => *exit_code,
            LineOutcome::Denied => 1,
        }
    }
}

pub struct Facade {
    paths: ConfigPaths,
    config: SystemConfig,
    engine: ValidationEngine,
    prompter: SafetyPrompter,
    executor: ShellExecutor,
    registry: CommandRegistry,
    memory: Option<Arc<VectorMemoryStore>>,
    embedder: Arc<dyn EmbeddingProvider>,
    update: Arc<UpdateEngine>,
    scheduler: Arc<UpdateScheduler>,
    agents: Arc<AgentRegistry>,
    runner: Arc<AgentRunner>,
    /// The one-shot degraded-memory warning.
    memory_warned: bool,
}

impl Facade {
    /// Wire the production capability graph. The update engine is built by
    /// the caller because it needs the live binary path and version.
    pub fn bootstrap(
        paths: ConfigPaths,
        config: SystemConfig,
        prompt: Box<dyn SafetyPrompt>,
        update: Arc<UpdateEngine>,
    ) -> Result<Self> {
        paths.ensure_layout()?;

        let rules = SafetyRuleSet::load(&paths.custom_rules_file());
        let engine = ValidationEngine::new(
            config.validation.clone(),
            rules,
            Arc::new(UnknownWorktree),
            EnvSnapshot::from_process_env(),
        );
        let log = DecisionLog::open(&paths.decisions_log())?;
        let prompter = SafetyPrompter::new(config.validation.clone(), log, prompt);

        let executor = match &config.shell {
            Some(shell) => ShellExecutor::with_shell(shell),
            None => ShellExecutor::from_env(),
        };

        let memory = match VectorMemoryStore::open(
            &paths.memory_db_file(),
            config.memory.dimension,
            config.memory.metric,
            config.memory.index_build_interval,
            config.memory.index_max_age_secs,
        ) {
            Ok(store) => Some(Arc::new(store)),
            Err(err) => {
                warn!(%err, "command memory unavailable; continuing without persistence");
                None
            }
        };

        let embedder: Arc<dyn EmbeddingProvider> = if config.memory.prefer_endpoint {
            Arc::new(HttpEmbeddings::new(
                config.memory.endpoint.clone(),
                config.memory.model.clone(),
                config.memory.dimension,
            ))
        } else {
            Arc::new(HashingEmbeddings::new(config.memory.dimension))
        };

        let agents = Arc::new(AgentRegistry::open(
            &paths.agent_store_dir(),
            config.agents.strict_yaml,
        )?);
        let runner = Arc::new(AgentRunner::new(
            config.agents.clone(),
            Arc::new(ShellBackend::new(
                executor.clone(),
                config.agents.container_runtime.clone(),
            )),
            PatternLibrary::load(&paths.error_patterns_file()),
            LearnedSolutionStore::load(&paths.agent_cache_dir().join("learned_solutions.json")),
            Arc::new(NoSuggestions),
            paths.agent_cache_dir(),
        ));

        Ok(Self {
            paths,
            config,
            engine,
            prompter,
            executor,
            registry: CommandRegistry::new(),
            memory,
            embedder,
            update,
            scheduler: Arc::new(UpdateScheduler::new()),
            agents,
            runner,
            memory_warned: false,
        })
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn scheduler(&self) -> Arc<UpdateScheduler> {
        self.scheduler.clone()
    }

    pub fn update_engine(&self) -> Arc<UpdateEngine> {
        self.update.clone()
    }

    /// Process one input line.
    pub async fn handle_line(&mut self, line: &str) -> Result<LineOutcome> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(LineOutcome::Empty);
        }

        if let Some(internal) = trimmed.strip_prefix(':') {
            return self.dispatch_internal(internal).await;
        }

        self.run_external(trimmed).await
    }

    /// Validate → review → execute → remember.
    async fn run_external(&mut self, command: &str) -> Result<LineOutcome> {
        let result = self.engine.validate(command);
        let engine = &self.engine;
        let review = self
            .prompter
            .review(command, &result, |modified| engine.validate(modified))?;

        let approved = match review {
            crate::validation::ReviewOutcome::Approved { command, .. } => command,
            crate::validation::ReviewOutcome::Denied { .. } => {
                return Ok(LineOutcome::Denied);
            }
        };

        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let output = self
            .executor
            .run(
                &approved,
                &cwd,
                &HashMap::new(),
                Duration::from_secs(86_400),
            )
            .await?;
        print!("{}", output.output);

        self.remember(&approved, &cwd, output.exit_code).await;

        Ok(LineOutcome::Executed {
            exit_code: output.exit_code,
        })
    }

    /// Record the executed command into the vector memory. Failures degrade:
    /// they are logged once and never block the session.
    async fn remember(&mut self, command: &str, cwd: &std::path::Path, exit_code: i32) {
        let Some(store) = self.memory.clone() else {
            if !self.memory_warned {
                self.memory_warned = true;
                eprintln!("delta: command memory is unavailable; history will not persist");
            }
            return;
        };

        let embedding = match self.embedder.embed(command).await {
            Ok(embedding) => embedding,
            Err(err) => {
                debug!(%err, "embedding failed; skipping memory record");
                return;
            }
        };

        let record = CommandRecord::new(command, cwd.display().to_string(), exit_code, embedding);
        if let Err(err) = store.upsert(&record) {
            warn!(%err, "failed to record command in memory");
            return;
        }

        if store.index_rebuild_due() {
            let store = store.clone();
            tokio::task::spawn_blocking(move || {
                if let Err(err) = store.rebuild_index() {
                    warn!(%err, "background index rebuild failed");
                }
            });
        }
    }

    async fn dispatch_internal(&mut self, input: &str) -> Result<LineOutcome> {
        if input.trim() == "exit" || input.trim() == "quit" {
            return Ok(LineOutcome::Exit);
        }

        // Command names are 'static, so matching on the name releases the
        // registry borrow before any handler runs.
        let (name, args) = match self.registry.resolve(input) {
            Some((command, args)) => (command.name, args),
            None => {
                eprintln!("delta: unknown command ':{input}' (try :help)");
                return Ok(LineOutcome::Internal(1));
            }
        };

        let code = match name {
            "help" => {
                println!("{}", self.registry.help_text());
                0
            }
            "validation config" => {
                println!("{:#?}", self.engine.config());
                0
            }
            "validation rules" => {
                for rule in self.engine.rules().rules() {
                    println!(
                        "{} [{}]{} — {}",
                        rule.name,
                        rule.risk,
                        if rule.enabled { "" } else { " (disabled)" },
                        rule.description
                    );
                }
                0
            }
            "validation test" => self.cmd_validation_test(args),
            "validation add" => self.cmd_validation_add(args),
            "validation remove" => {
                if self.engine.rules_mut().remove_rule(args.trim()) {
                    println!("removed rule '{}'", args.trim());
                    0
                } else {
                    eprintln!("delta: no rule named '{}'", args.trim());
                    1
                }
            }
            "validation stats" => match self.prompter.decision_log().statistics() {
                Ok(stats) => {
                    println!("{}", stats.format());
                    0
                }
                Err(err) => {
                    eprintln!("delta: {err:#}");
                    1
                }
            },
            "memory stats" => self.cmd_memory_stats(),
            "memory search" => self.cmd_memory_search(args).await,
            "memory export" => self.cmd_memory_export(args),
            "memory import" => self.cmd_memory_import(args),
            "update check" => self.cmd_update_check().await,
            "update install" => self.cmd_update_install().await,
            "update rollback" => self.cmd_update_rollback().await,
            "update history" => self.cmd_update_history(args),
            "update channel" => self.cmd_update_channel(args),
            "update schedule" => self.cmd_update_schedule(args),
            "update status" => {
                println!("update engine: {:?}", self.update.state().await);
                0
            }
            "agent list" => {
                for agent in self.agents.list() {
                    println!(
                        "{} — {} ({} runs, {:.0}% success){}",
                        agent.id,
                        agent.description,
                        agent.run_count,
                        agent.success_rate * 100.0,
                        if agent.enabled { "" } else { " [disabled]" }
                    );
                }
                0
            }
            "agent show" => self.cmd_agent_show(args),
            "agent run" => self.cmd_agent_run(args).await,
            "agent delete" => self.cmd_agent_delete(args),
            "agent discover" => self.cmd_agent_discover(args),
            other => {
                eprintln!("delta: ':{other}' is not implemented");
                1
            }
        };
        Ok(LineOutcome::Internal(code))
    }

    fn cmd_validation_test(&self, args: &str) -> i32 {
        if args.is_empty() {
            eprintln!("usage: :validation test <command>");
            return 1;
        }
        let result = self.engine.validate(args);
        if result.is_empty() {
            println!("ok: no findings (aggregate {})", result.aggregate_risk());
            return 0;
        }
        for finding in result.by_risk_descending() {
            println!("[{}/{}] {}", finding.risk, finding.kind, finding.message);
            if let Some(suggestion) = &finding.suggestion {
                println!("    suggestion: {suggestion}");
            }
        }
        println!(
            "aggregate: {}{}",
            result.aggregate_risk(),
            if result.is_incomplete() { " (incomplete)" } else { "" }
        );
        i32::from(!result.is_valid())
    }

    fn cmd_validation_add(&mut self, args: &str) -> i32 {
        let mut parts = args.splitn(3, ' ');
        let (Some(name), Some(risk), Some(pattern)) = (parts.next(), parts.next(), parts.next())
        else {
            eprintln!("usage: :validation add <name> <low|medium|high|critical> <regex>");
            return 1;
        };
        let Ok(risk) = serde_json::from_value(serde_json::Value::String(risk.to_string())) else {
            eprintln!("delta: unknown risk level '{risk}'");
            return 1;
        };

        let rule = crate::validation::rules::CustomRule {
            name: name.to_string(),
            description: String::new(),
            pattern: pattern.to_string(),
            risk,
            message: format!("matched custom rule '{name}'"),
            suggestion: None,
            educational_note: None,
            enabled: true,
        };

        if let Err(err) = self.engine.rules_mut().add_rule(rule.clone()) {
            eprintln!("delta: {err:#}");
            return 1;
        }

        // Persist so the rule survives restarts.
        match self.append_custom_rule(rule) {
            Ok(()) => {
                println!("added rule '{name}'");
                0
            }
            Err(err) => {
                eprintln!("delta: rule active this session but not saved: {err:#}");
                1
            }
        }
    }

    fn append_custom_rule(&self, rule: crate::validation::rules::CustomRule) -> Result<()> {
        #[derive(Default, serde::Serialize, serde::Deserialize)]
        struct RuleFile {
            #[serde(default)]
            rules: Vec<crate::validation::rules::CustomRule>,
        }

        let path = self.paths.custom_rules_file();
        let mut file: RuleFile = match std::fs::read_to_string(&path) {
            Ok(text) => serde_yaml::from_str(&text)?,
            Err(_) => RuleFile::default(),
        };
        file.rules.retain(|existing| existing.name != rule.name);
        file.rules.push(rule);
        let rendered = serde_yaml::to_string(&file)?;
        crate::utils::fs::atomic_write(&path, rendered.as_bytes())
    }

    fn cmd_memory_stats(&self) -> i32 {
        match &self.memory {
            Some(store) => match store.stats() {
                Ok(stats) => {
                    println!(
                        "{} records, {} bytes on disk, metric {}, dimension {}",
                        stats.record_count,
                        stats.disk_size_bytes,
                        stats.metric.label(),
                        stats.dimension
                    );
                    match stats.last_index_build {
                        Some(at) => println!("index built {at}, {} unindexed", stats.unindexed_inserts),
                        None => println!("index not yet built"),
                    }
                    0
                }
                Err(err) => {
                    eprintln!("delta: {err}");
                    1
                }
            },
            None => {
                eprintln!("delta: memory store unavailable");
                1
            }
        }
    }

    async fn cmd_memory_search(&self, args: &str) -> i32 {
        let Some(store) = &self.memory else {
            eprintln!("delta: memory store unavailable");
            return 1;
        };
        if args.is_empty() {
            eprintln!("usage: :memory search <text>");
            return 1;
        }
        // Cold start: with nothing remembered yet, fall back to the seed
        // command list instead of an empty answer.
        if store.stats().map(|stats| stats.record_count).unwrap_or(0) == 0 {
            let seeds = crate::agents::patterns::CommonCommands::load(
                &self.paths.common_commands_file(),
            );
            println!("no history yet; common commands:");
            for command in seeds.commands.iter().take(10) {
                println!("  {command}");
            }
            return 0;
        }

        let query = match self.embedder.embed(args).await {
            Ok(query) => query,
            Err(err) => {
                eprintln!("delta: embedding failed: {err:#}");
                return 1;
            }
        };
        match store.search(&query, None, 10) {
            Ok(hits) => {
                for hit in hits {
                    println!(
                        "{:.3}  {}  ({}x, {:.0}% ok)",
                        hit.score,
                        hit.record.command,
                        hit.record.frequency,
                        hit.record.success_rate * 100.0
                    );
                }
                0
            }
            Err(err) => {
                eprintln!("delta: {err}");
                1
            }
        }
    }

    fn cmd_memory_export(&self, args: &str) -> i32 {
        let Some(store) = &self.memory else {
            eprintln!("delta: memory store unavailable");
            return 1;
        };
        let path = if args.is_empty() {
            self.paths
                .exports_dir()
                .join(format!("memory-{}.json", Utc::now().format("%Y%m%d%H%M%S")))
        } else {
            PathBuf::from(args)
        };
        match store.export(&path) {
            Ok(count) => {
                println!("exported {count} records to {}", path.display());
                0
            }
            Err(err) => {
                eprintln!("delta: export failed: {err}");
                1
            }
        }
    }

    fn cmd_memory_import(&self, args: &str) -> i32 {
        let Some(store) = &self.memory else {
            eprintln!("delta: memory store unavailable");
            return 1;
        };
        let mut parts = args.split_whitespace();
        let Some(path) = parts.next() else {
            eprintln!("usage: :memory import <path> [replace|merge|keep-newer]");
            return 1;
        };
        let strategy = match parts.next().unwrap_or("merge") {
            "replace" => ImportStrategy::Replace,
            "merge" => ImportStrategy::Merge,
            "keep-newer" => ImportStrategy::KeepNewer,
            other => {
                eprintln!("delta: unknown import strategy '{other}'");
                return 1;
            }
        };
        match store.import(&PathBuf::from(path), strategy) {
            Ok(count) => {
                println!("imported {count} records");
                0
            }
            Err(err) => {
                eprintln!("delta: import failed: {err}");
                1
            }
        }
    }

    async fn cmd_update_check(&self) -> i32 {
        match self.update.check().await {
            Ok(Some(release)) => {
                println!(
                    "update available: {} (current {})",
                    release.tag,
                    self.update.current_version()
                );
                0
            }
            Ok(None) => {
                println!("already up to date ({})", self.update.current_version());
                0
            }
            Err(UpdateError::RateLimited { reset_time }) => {
                eprintln!("delta: rate limited until {reset_time}");
                1
            }
            Err(err) => {
                eprintln!("delta: update check failed: {err}");
                1
            }
        }
    }

    async fn cmd_update_install(&self) -> i32 {
        if !self.update.settings().enabled {
            eprintln!("delta: updates are disabled by policy");
            return 1;
        }
        match install_latest_simple(&*self.update, UpdateType::Manual, "cli").await {
            Ok(record) => {
                println!(
                    "installed {} -> {} in {} ms",
                    record.from_version, record.to_version, record.duration_ms
                );
                0
            }
            Err(UpdateError::UpToDate) => {
                println!("already up to date ({})", self.update.current_version());
                0
            }
            Err(err) => {
                eprintln!("delta: install failed: {err}");
                1
            }
        }
    }

    async fn cmd_update_rollback(&self) -> i32 {
        match self.update.rollback("cli").await {
            Ok(record) => {
                println!("rolled back to {}", record.to_version);
                0
            }
            Err(err) => {
                eprintln!("delta: rollback failed: {err}");
                1
            }
        }
    }

    fn cmd_update_history(&self, args: &str) -> i32 {
        let rendered = if args.trim() == "csv" {
            self.update.history().export_csv()
        } else {
            self.update.history().export_text()
        };
        match rendered {
            Ok(text) => {
                print!("{text}");
                0
            }
            Err(err) => {
                eprintln!("delta: {err:#}");
                1
            }
        }
    }

    fn cmd_update_channel(&self, args: &str) -> i32 {
        if args.is_empty() {
            println!("channel: {}", self.update.settings().channel);
            return 0;
        }
        // Switching persists through the settings file; the engine picks the
        // new channel up on next start.
        match crate::update::channel::ChannelKind::parse(args.trim()) {
            Some(kind) => {
                let mut settings = self.update.settings().clone();
                if let Err(err) = settings.switch_channel(kind) {
                    eprintln!("delta: {err:#}");
                    return 1;
                }
                match settings.save(&self.paths.update_config_file()) {
                    Ok(()) => {
                        println!("channel set to {kind} (takes effect on restart)");
                        0
                    }
                    Err(err) => {
                        eprintln!("delta: {err:#}");
                        1
                    }
                }
            }
            None => {
                eprintln!("delta: unknown channel '{args}'");
                1
            }
        }
    }

    fn cmd_update_schedule(&self, args: &str) -> i32 {
        let mut parts = args.split_whitespace();
        let (Some(version), Some(when)) = (parts.next(), parts.next()) else {
            eprintln!("usage: :update schedule <version> <+duration|@daily|@weekly|@monthly>");
            return 1;
        };

        let entry = if let Some(recurrence) = Recurrence::parse(when) {
            if when.starts_with('@') {
                let first = recurrence.next_after(Utc::now());
                ScheduledUpdate::new(version, first).with_recurrence(recurrence)
            } else {
                // "+2h" style: one shot at now + duration.
                let Ok(delay) = humantime::parse_duration(when.trim_start_matches('+')) else {
                    eprintln!("delta: cannot parse schedule '{when}'");
                    return 1;
                };
                ScheduledUpdate::new(
                    version,
                    Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default(),
                )
            }
        } else {
            eprintln!("delta: cannot parse schedule '{when}'");
            return 1;
        };

        if self.scheduler.schedule(entry) {
            println!("scheduled {version} ({when})");
            0
        } else {
            println!("an identical schedule already exists");
            0
        }
    }

    fn cmd_agent_show(&self, args: &str) -> i32 {
        match self.agents.get(args.trim()) {
            Some(agent) => {
                println!("{agent:#?}");
                0
            }
            None => {
                eprintln!("delta: no agent '{args}'");
                1
            }
        }
    }

    async fn cmd_agent_run(&self, args: &str) -> i32 {
        let mut parts = args.split_whitespace();
        let Some(id) = parts.next() else {
            eprintln!("usage: :agent run <id> [--dry-run]");
            return 1;
        };
        let options = RunOptions {
            dry_run: parts.any(|flag| flag == "--dry-run"),
            ..RunOptions::default()
        };

        let Some(agent) = self.agents.get(id) else {
            eprintln!("delta: no agent '{id}'");
            return 1;
        };

        match self.runner.run(&agent, options).await {
            Ok(result) => {
                print!("{}", result.output);
                if !result.dry_run {
                    if let Err(err) = self.agents.record_run(id, true) {
                        warn!(%err, "failed to update agent aggregates");
                    }
                }
                0
            }
            Err(err) => {
                eprintln!("delta: agent run failed: {err}");
                let _ = self.agents.record_run(id, false);
                1
            }
        }
    }

    fn cmd_agent_delete(&self, args: &str) -> i32 {
        match self.agents.delete(args.trim()) {
            Ok(true) => {
                println!("deleted '{}'", args.trim());
                0
            }
            Ok(false) => {
                eprintln!("delta: no agent '{}'", args.trim());
                1
            }
            Err(err) => {
                eprintln!("delta: {err}");
                1
            }
        }
    }

    fn cmd_agent_discover(&self, args: &str) -> i32 {
        let root = if args.is_empty() {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        } else {
            PathBuf::from(args.trim())
        };
        match self.agents.discover_from_repository(&root) {
            Ok(ids) if ids.is_empty() => {
                println!("no agent declaration file found under {}", root.display());
                0
            }
            Ok(ids) => {
                println!("registered agents: {}", ids.join(", "));
                0
            }
            Err(err) => {
                eprintln!("delta: discovery failed: {err:#}");
                1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::channel::UpdateSettings;
    use crate::update::history::UpdateHistory;
    use crate::update::validate::PostInstallValidator;
    use crate::validation::prompter::PromptVerdict;
    use crate::validation::risk::ValidationResult;
    use semver::Version;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct ScriptedPrompt {
        verdicts: Mutex<Vec<PromptVerdict>>,
    }

    impl crate::validation::SafetyPrompt for ScriptedPrompt {
        fn prompt(&self, _command: &str, _result: &ValidationResult) -> Result<PromptVerdict> {
            Ok(self
                .verdicts
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(PromptVerdict::Cancel))
        }
    }

    fn facade(dir: &TempDir, verdicts: Vec<PromptVerdict>) -> Facade {
        let paths = ConfigPaths::at_root(dir.path().join("config"));
        paths.ensure_layout().unwrap();

        let binary = dir.path().join("delta-bin");
        std::fs::write(&binary, b"binary").unwrap();

        let update = Arc::new(UpdateEngine::new(
            UpdateSettings::default(),
            UpdateHistory::new(paths.update_history_log()),
            Arc::new(PostInstallValidator::new(vec![])),
            paths.downloads_dir(),
            paths.backups_dir(),
            binary,
            Version::new(0, 9, 0),
        ));

        let mut config = SystemConfig::default();
        config.memory.dimension = 32;
        config.shell = Some("/bin/sh".to_string());

        Facade::bootstrap(
            paths,
            config,
            Box::new(ScriptedPrompt {
                verdicts: Mutex::new(verdicts),
            }),
            update,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn blank_line_is_empty() {
        let dir = TempDir::new().unwrap();
        let mut facade = facade(&dir, vec![]);
        assert_eq!(facade.handle_line("   ").await.unwrap(), LineOutcome::Empty);
    }

    #[tokio::test]
    async fn exit_command_exits() {
        let dir = TempDir::new().unwrap();
        let mut facade = facade(&dir, vec![]);
        assert_eq!(facade.handle_line(":exit").await.unwrap(), LineOutcome::Exit);
    }

    #[tokio::test]
    async fn unknown_internal_command_fails() {
        let dir = TempDir::new().unwrap();
        let mut facade = facade(&dir, vec![]);
        assert_eq!(
            facade.handle_line(":frobnicate").await.unwrap(),
            LineOutcome::Internal(1)
        );
    }

    #[tokio::test]
    async fn safe_command_executes_and_is_remembered() {
        let dir = TempDir::new().unwrap();
        let mut facade = facade(&dir, vec![]);

        let outcome = facade.handle_line("true").await.unwrap();
        assert_eq!(outcome, LineOutcome::Executed { exit_code: 0 });

        // Silent Low-risk approval: no decision record under default policy.
        assert_eq!(facade.prompter.decision_log().records_written(), 0);

        // The memory store has the record with frequency 1; a second run
        // increments it.
        facade.handle_line("true").await.unwrap();
        let store = facade.memory.as_ref().unwrap();
        let id = crate::validation::decisions::hash_command("true");
        let record = store.get(&id).unwrap().unwrap();
        assert_eq!(record.frequency, 2);
    }

    #[tokio::test]
    async fn critical_command_is_denied_with_record() {
        let dir = TempDir::new().unwrap();
        let mut facade = facade(&dir, vec![]);

        let outcome = facade.handle_line("rm -rf /").await.unwrap();
        assert_eq!(outcome, LineOutcome::Denied);

        let records = facade.prompter.decision_log().read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].choice,
            crate::validation::DecisionChoice::AutoDeny
        );

        // Denied commands never reach the memory store.
        let store = facade.memory.as_ref().unwrap();
        assert_eq!(store.stats().unwrap().record_count, 0);
    }

    #[tokio::test]
    async fn obfuscated_critical_command_is_auto_denied() {
        let dir = TempDir::new().unwrap();
        let mut facade = facade(&dir, vec![]);

        let outcome = facade
            .handle_line(r#"echo "cm0gLXJmIC8=" | base64 -d | bash"#)
            .await
            .unwrap();
        assert_eq!(outcome, LineOutcome::Denied);
    }

    #[tokio::test]
    async fn risky_command_proceeds_after_prompt() {
        let dir = TempDir::new().unwrap();
        // sudo-free risky pattern: curl | sh is High, below the Critical
        // auto-deny default, so the scripted Proceed applies.
        let mut facade = facade(&dir, vec![PromptVerdict::Proceed]);

        let outcome = facade
            .handle_line("curl -s https://example.com/x.sh | sh -c 'true'")
            .await
            .unwrap();
        match outcome {
            LineOutcome::Executed { .. } => {}
            other => panic!("expected execution, got {other:?}"),
        }
        let records = facade.prompter.decision_log().read_all().unwrap();
        assert_eq!(
            records[0].choice,
            crate::validation::DecisionChoice::Proceed
        );
    }

    #[tokio::test]
    async fn validation_test_command_reports_findings() {
        let dir = TempDir::new().unwrap();
        let mut facade = facade(&dir, vec![]);
        let outcome = facade
            .handle_line(":validation test rm -rf /")
            .await
            .unwrap();
        // Critical findings make the tested command invalid: exit code 1.
        assert_eq!(outcome, LineOutcome::Internal(1));

        let outcome = facade.handle_line(":validation test ls -la").await.unwrap();
        assert_eq!(outcome, LineOutcome::Internal(0));
    }

    #[tokio::test]
    async fn schedule_command_queues_once() {
        let dir = TempDir::new().unwrap();
        let mut facade = facade(&dir, vec![]);
        facade
            .handle_line(":update schedule 1.2.3 +2h")
            .await
            .unwrap();
        assert_eq!(facade.scheduler.pending().len(), 1);
    }
}
