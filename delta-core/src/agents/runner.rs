//! Agent execution.
//!
//! Commands run in order, locally or inside the agent's container. Output is
//! scanned for success and error patterns; an error match enters the
//! recovery loop, which tries learned solutions (best ratio first), then the
//! built-in pattern library, then an optional AI suggestion, re-running the
//! failing command after each candidate. The agent aborts on the first
//! unresolved failure.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tracing::{debug, info, warn};

use crate::agents::container::{build_order, count_cache_tokens, generate_compose, DockerBuildCache};
use crate::agents::patterns::PatternLibrary;
use crate::agents::recovery::{LearnedSolutionStore, RemediationSuggester, SolutionSource};
use crate::agents::{Agent, AgentCommand, AgentError, AgentSettings, ContainerConfig};
use crate::exec::shell::{CommandOutput, ShellExecutor};

/// How a run was requested.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Resolve placeholders and report the plan without spawning anything.
    pub dry_run: bool,
    /// Force container execution off for this run.
    pub no_container: bool,
    /// Extra context overlaid on the agent's own.
    pub extra_context: HashMap<String, String>,
}

/// One agent run, appended to the agent's bounded result buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRunResult {
    pub agent_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub success: bool,
    pub exit_code: i32,
    pub commands_run: usize,
    pub output: String,
    pub errors: Vec<String>,
    pub artifacts: Vec<PathBuf>,
    /// (stage name, duration ms) for waterfall builds.
    pub stage_durations: Vec<(String, u64)>,
    pub dry_run: bool,
}

/// Executes commands either on the host or inside a container. Scripted in
/// tests; production uses the container runtime CLI through the shell.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn run_host(
        &self,
        command: &str,
        working_dir: &Path,
        env: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<CommandOutput>;

    async fn run_container(
        &self,
        config: &ContainerConfig,
        command: &str,
        env: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<CommandOutput>;

    async fn build_stage(&self, compose_file: &Path, stage: &str) -> Result<CommandOutput>;
}

/// Production backend driving `$SHELL` and the configured container runtime.
pub struct ShellBackend {
    executor: ShellExecutor,
    runtime: String,
}

impl ShellBackend {
    pub fn new(executor: ShellExecutor, runtime: impl Into<String>) -> Self {
        Self {
            executor,
            runtime: runtime.into(),
        }
    }
}

#[async_trait]
impl ExecutionBackend for ShellBackend {
    async fn run_host(
        &self,
        command: &str,
        working_dir: &Path,
        env: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        self.executor.run(command, working_dir, env, timeout).await
    }

    async fn run_container(
        &self,
        config: &ContainerConfig,
        command: &str,
        env: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let mut invocation = format!("{} run --rm", self.runtime);
        for volume in &config.volumes {
            invocation.push_str(&format!(" -v {}", shell_words::quote(volume)));
        }
        for network in &config.networks {
            invocation.push_str(&format!(" --network {}", shell_words::quote(network)));
        }
        for (key, value) in config.env.iter().chain(env.iter()) {
            invocation.push_str(&format!(" -e {}", shell_words::quote(&format!("{key}={value}"))));
        }
        invocation.push_str(&format!(
            " {}:{} sh -c {}",
            config.image,
            config.tag,
            shell_words::quote(command)
        ));
        self.executor
            .run(&invocation, Path::new("."), &HashMap::new(), timeout)
            .await
    }

    async fn build_stage(&self, compose_file: &Path, stage: &str) -> Result<CommandOutput> {
        let invocation = format!(
            "{} compose -f {} build {}",
            self.runtime,
            shell_words::quote(&compose_file.display().to_string()),
            shell_words::quote(stage)
        );
        self.executor
            .run(&invocation, Path::new("."), &HashMap::new(), Duration::from_secs(1_800))
            .await
    }
}

pub struct AgentRunner {
    settings: AgentSettings,
    backend: Arc<dyn ExecutionBackend>,
    patterns: PatternLibrary,
    learned: Mutex<LearnedSolutionStore>,
    suggester: Arc<dyn RemediationSuggester>,
    cache_dir: PathBuf,
    /// Per-agent run locks: the same agent never runs twice concurrently.
    agent_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    /// Worker-pool width across all agents.
    pool: Arc<Semaphore>,
    /// Bounded ring buffer of results per agent.
    results: Mutex<HashMap<String, VecDeque<AgentRunResult>>>,
}

impl AgentRunner {
    pub fn new(
        settings: AgentSettings,
        backend: Arc<dyn ExecutionBackend>,
        patterns: PatternLibrary,
        learned: LearnedSolutionStore,
        suggester: Arc<dyn RemediationSuggester>,
        cache_dir: PathBuf,
    ) -> Self {
        let pool = Arc::new(Semaphore::new(settings.max_concurrent.max(1)));
        Self {
            settings,
            backend,
            patterns,
            learned: Mutex::new(learned),
            suggester,
            cache_dir,
            agent_locks: Mutex::new(HashMap::new()),
            pool,
            results: Mutex::new(HashMap::new()),
        }
    }

    /// Recent results for an agent, newest last.
    pub fn results_for(&self, agent_id: &str) -> Vec<AgentRunResult> {
        self.results
            .lock()
            .get(agent_id)
            .map(|buffer| buffer.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Run an agent to completion.
    pub async fn run(&self, agent: &Agent, options: RunOptions) -> Result<AgentRunResult, AgentError> {
        if !agent.enabled {
            return Err(AgentError::Disabled(agent.id.clone()));
        }

        let agent_lock = {
            let mut locks = self.agent_locks.lock();
            locks
                .entry(agent.id.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let Ok(_agent_guard) = agent_lock.try_lock() else {
            return Err(AgentError::AlreadyRunning(agent.id.clone()));
        };
        let _pool_guard = self
            .pool
            .acquire()
            .await
            .map_err(|_| AgentError::Other(anyhow::anyhow!("worker pool closed")))?;

        let started_at = Utc::now();
        let mut result = AgentRunResult {
            agent_id: agent.id.clone(),
            started_at,
            ended_at: started_at,
            success: false,
            exit_code: 0,
            commands_run: 0,
            output: String::new(),
            errors: Vec::new(),
            artifacts: Vec::new(),
            stage_durations: Vec::new(),
            dry_run: options.dry_run,
        };

        let outcome = self.run_inner(agent, &options, &mut result).await;
        result.ended_at = Utc::now();
        result.success = outcome.is_ok();
        if let Err(err) = &outcome {
            result.errors.push(err.to_string());
        }
        self.push_result(result.clone());
        if let Err(err) = self.learned.lock().save() {
            warn!(%err, "failed to persist learned solutions");
        }

        match outcome {
            Ok(()) => Ok(result),
            Err(err) => {
                warn!(agent = %agent.id, %err, "agent run failed");
                Err(err)
            }
        }
    }

    async fn run_inner(
        &self,
        agent: &Agent,
        options: &RunOptions,
        result: &mut AgentRunResult,
    ) -> Result<(), AgentError> {
        let context = self.build_context(agent, options);
        let use_container = self.settings.container_enabled
            && !options.no_container
            && agent.container.is_some();

        // Waterfall stages build before any command runs.
        if use_container {
            if let Some(container) = &agent.container {
                if let Some(waterfall) = &container.waterfall {
                    self.build_waterfall(agent, container, waterfall, options, result)
                        .await?;
                }
            }
        }

        for command in &agent.commands {
            let resolved = resolve_placeholders(&command.command, &context);
            let working_dir = command
                .working_dir
                .as_ref()
                .map(|dir| PathBuf::from(resolve_placeholders(&dir.display().to_string(), &context)))
                .unwrap_or_else(|| PathBuf::from("."));
            let env: HashMap<String, String> = command
                .env
                .iter()
                .map(|(key, value)| (key.clone(), resolve_placeholders(value, &context)))
                .collect();

            if options.dry_run {
                result
                    .output
                    .push_str(&format!("[dry-run] {resolved}\n"));
                result.commands_run += 1;
                continue;
            }

            self.run_command_with_retries(
                agent, command, &resolved, &working_dir, &env, use_container, result,
            )
            .await?;
            result.commands_run += 1;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_command_with_retries(
        &self,
        agent: &Agent,
        spec: &AgentCommand,
        resolved: &str,
        working_dir: &Path,
        env: &HashMap<String, String>,
        use_container: bool,
        result: &mut AgentRunResult,
    ) -> Result<(), AgentError> {
        let timeout = Duration::from_secs(spec.timeout_secs);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let output = self
                .execute(agent, resolved, working_dir, env, use_container, timeout)
                .await
                .map_err(AgentError::Other)?;
            result.output.push_str(&output.output);

            let error_hit = first_matching(&spec.error_patterns, &output.output);
            let failed = !output.success() || error_hit.is_some();

            if !failed {
                for pattern in &spec.success_patterns {
                    if output.output.contains(pattern.as_str()) {
                        debug!(pattern, "success pattern observed");
                    }
                }
                return Ok(());
            }

            if let Some(pattern) = &error_hit {
                result
                    .errors
                    .push(format!("error pattern '{pattern}' in output of '{resolved}'"));
                if self
                    .attempt_recovery(agent, resolved, working_dir, env, use_container, &output, result)
                    .await?
                {
                    return Ok(());
                }
            } else {
                result
                    .errors
                    .push(format!("'{resolved}' exited with {}", output.exit_code));
            }

            if attempts > spec.retry_count {
                return Err(AgentError::CommandFailed {
                    command: resolved.to_string(),
                    exit_code: output.exit_code,
                });
            }
            debug!(attempts, command = resolved, "retrying after delay");
            tokio::time::sleep(Duration::from_secs(spec.retry_delay_secs)).await;
        }
    }

    /// Try recovery candidates for a failed command. Returns true when a
    /// candidate fixed it (the re-run succeeded).
    #[allow(clippy::too_many_arguments)]
    async fn attempt_recovery(
        &self,
        agent: &Agent,
        failing_command: &str,
        working_dir: &Path,
        env: &HashMap<String, String>,
        use_container: bool,
        failed_output: &CommandOutput,
        result: &mut AgentRunResult,
    ) -> Result<bool, AgentError> {
        let directory = working_dir.display().to_string();
        let timeout = Duration::from_secs(120);

        // Learned solutions first (best ratio), then the built-in library,
        // then one AI suggestion.
        let mut candidates: Vec<(String, String, SolutionSource)> = {
            let learned = self.learned.lock();
            learned
                .ranked_for(&failed_output.output)
                .into_iter()
                .map(|entry| (entry.pattern.clone(), entry.solution.clone(), entry.source))
                .collect()
        };
        for solution in self.patterns.matching(&failed_output.output) {
            if !candidates.iter().any(|(_, cmd, _)| cmd == &solution.solution) {
                candidates.push((
                    solution.pattern.clone(),
                    solution.solution.clone(),
                    SolutionSource::System,
                ));
            }
        }
        if candidates.len() < self.settings.max_recovery_attempts {
            if let Some(suggestion) = self
                .suggester
                .suggest(failing_command, &failed_output.output)
                .await
            {
                candidates.push(("ai".to_string(), suggestion, SolutionSource::Ai));
            }
        }
        candidates.truncate(self.settings.max_recovery_attempts);

        for (pattern, solution, source) in candidates {
            info!(%solution, "attempting recovery");
            let fix_output = self
                .execute(agent, &solution, working_dir, env, use_container, timeout)
                .await
                .map_err(AgentError::Other)?;
            result.output.push_str(&fix_output.output);

            let retry = self
                .execute(agent, failing_command, working_dir, env, use_container, timeout)
                .await
                .map_err(AgentError::Other)?;
            result.output.push_str(&retry.output);

            let fixed = retry.success();
            self.learned.lock().record_outcome(
                &pattern, &solution, source, &directory, fixed,
            );
            if fixed {
                info!(%solution, "recovery succeeded");
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn execute(
        &self,
        agent: &Agent,
        command: &str,
        working_dir: &Path,
        env: &HashMap<String, String>,
        use_container: bool,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        if use_container {
            let config = agent
                .container
                .as_ref()
                .context("container execution requested without container config")?;
            self.backend
                .run_container(config, command, env, timeout)
                .await
        } else {
            self.backend
                .run_host(command, working_dir, env, timeout)
                .await
        }
    }

    async fn build_waterfall(
        &self,
        agent: &Agent,
        container: &ContainerConfig,
        waterfall: &crate::agents::WaterfallSpec,
        options: &RunOptions,
        result: &mut AgentRunResult,
    ) -> Result<(), AgentError> {
        // Cycles refuse the build before any stage runs.
        let order = build_order(waterfall)?;

        if options.dry_run {
            result
                .output
                .push_str(&format!("[dry-run] build stages: {}\n", order.join(" -> ")));
            return Ok(());
        }

        let compose =
            generate_compose(container, waterfall).map_err(AgentError::Other)?;
        let compose_path = self.cache_dir.join(format!("{}-compose.yml", agent.id));
        crate::utils::fs::atomic_write(&compose_path, compose.as_bytes())
            .map_err(AgentError::Other)?;
        result.artifacts.push(compose_path.clone());

        let mut total_hits = 0u64;
        let mut total_misses = 0u64;
        for stage in &order {
            let stage_started = std::time::Instant::now();
            let output = self
                .backend
                .build_stage(&compose_path, stage)
                .await
                .map_err(AgentError::Other)?;
            result.output.push_str(&output.output);
            result
                .stage_durations
                .push((stage.clone(), stage_started.elapsed().as_millis() as u64));

            let (hits, misses) = count_cache_tokens(&output.output);
            total_hits += hits;
            total_misses += misses;

            if !output.success() {
                return Err(AgentError::CommandFailed {
                    command: format!("build stage {stage}"),
                    exit_code: output.exit_code,
                });
            }
        }

        let cache_path = self.cache_dir.join("build_cache.json");
        let mut cache = DockerBuildCache::load(&cache_path);
        cache.record_build(&agent.id, &order, total_hits, total_misses);
        if let Err(err) = cache.save(&cache_path) {
            warn!(%err, "failed to persist build cache");
        }
        Ok(())
    }

    fn build_context(&self, agent: &Agent, options: &RunOptions) -> HashMap<String, String> {
        let mut context = HashMap::new();
        if let Some(home) = dirs::home_dir() {
            context.insert("HOME".to_string(), home.display().to_string());
        }
        if let Ok(user) = std::env::var("USER") {
            context.insert("USER".to_string(), user);
        }
        if let Ok(config_dir) = crate::config::paths::ConfigPaths::resolve() {
            context.insert(
                "CONFIG_DIR".to_string(),
                config_dir.root().display().to_string(),
            );
        }
        context.extend(agent.context.clone());
        context.extend(options.extra_context.clone());
        context
    }

    fn push_result(&self, result: AgentRunResult) {
        let mut results = self.results.lock();
        let buffer = results.entry(result.agent_id.clone()).or_default();
        buffer.push_back(result);
        while buffer.len() > self.settings.result_buffer {
            buffer.pop_front();
        }
    }
}

/// Replace `{{key}}` placeholders from the context map.
pub fn resolve_placeholders(text: &str, context: &HashMap<String, String>) -> String {
    let mut resolved = text.to_string();
    for (key, value) in context {
        resolved = resolved.replace(&format!("{{{{{key}}}}}"), value);
    }
    resolved
}

fn first_matching(patterns: &[String], output: &str) -> Option<String> {
    patterns
        .iter()
        .find(|pattern| output.contains(pattern.as_str()))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::recovery::NoSuggestions;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Backend that scripts each host invocation.
    struct ScriptedBackend {
        /// (command substring, exit code, output) matched in order of calls.
        responses: Mutex<Vec<(i32, String)>>,
        calls: Mutex<Vec<String>>,
        build_calls: AtomicUsize,
    }

    impl ScriptedBackend {
        fn new(responses: Vec<(i32, &str)>) -> Self {
            Self {
                responses: Mutex::new(
                    responses
                        .into_iter()
                        .map(|(code, out)| (code, out.to_string()))
                        .collect(),
                ),
                calls: Mutex::new(Vec::new()),
                build_calls: AtomicUsize::new(0),
            }
        }

        fn next_response(&self) -> (i32, String) {
            let mut responses = self.responses.lock();
            if responses.is_empty() {
                (0, String::new())
            } else {
                responses.remove(0)
            }
        }
    }

    #[async_trait]
    impl ExecutionBackend for ScriptedBackend {
        async fn run_host(
            &self,
            command: &str,
            _working_dir: &Path,
            _env: &HashMap<String, String>,
            _timeout: Duration,
        ) -> Result<CommandOutput> {
            self.calls.lock().push(command.to_string());
            let (exit_code, output) = self.next_response();
            Ok(CommandOutput {
                exit_code,
                output,
                duration: Duration::from_millis(1),
                cancelled: false,
            })
        }

        async fn run_container(
            &self,
            _config: &ContainerConfig,
            command: &str,
            env: &HashMap<String, String>,
            timeout: Duration,
        ) -> Result<CommandOutput> {
            self.run_host(command, Path::new("."), env, timeout).await
        }

        async fn build_stage(&self, _compose: &Path, stage: &str) -> Result<CommandOutput> {
            self.build_calls.fetch_add(1, Ordering::SeqCst);
            self.calls.lock().push(format!("build:{stage}"));
            let (exit_code, output) = self.next_response();
            Ok(CommandOutput {
                exit_code,
                output,
                duration: Duration::from_millis(1),
                cancelled: false,
            })
        }
    }

    fn runner(dir: &TempDir, backend: Arc<ScriptedBackend>) -> AgentRunner {
        AgentRunner::new(
            AgentSettings::default(),
            backend,
            PatternLibrary::builtin(),
            LearnedSolutionStore::load(&dir.path().join("learned.json")),
            Arc::new(NoSuggestions),
            dir.path().to_path_buf(),
        )
    }

    fn simple_agent(commands: Vec<AgentCommand>) -> Agent {
        let mut agent = Agent::new("test-agent", "Test");
        agent.commands = commands;
        agent
    }

    #[tokio::test]
    async fn commands_run_in_order_and_result_is_recorded() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::new(vec![(0, "one\n"), (0, "two\n")]));
        let runner = runner(&dir, backend.clone());

        let agent = simple_agent(vec![
            AgentCommand::new("echo one"),
            AgentCommand::new("echo two"),
        ]);
        let result = runner.run(&agent, RunOptions::default()).await.unwrap();

        assert!(result.success);
        assert_eq!(result.commands_run, 2);
        assert_eq!(backend.calls.lock().as_slice(), ["echo one", "echo two"]);
        assert_eq!(runner.results_for("test-agent").len(), 1);
    }

    #[tokio::test]
    async fn failure_aborts_remaining_commands() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::new(vec![(1, "boom\n")]));
        let runner = runner(&dir, backend.clone());

        let agent = simple_agent(vec![
            AgentCommand::new("false"),
            AgentCommand::new("echo never"),
        ]);
        let err = runner.run(&agent, RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, AgentError::CommandFailed { .. }));
        // Recovery found no candidates, so only the failing command ran.
        assert_eq!(backend.calls.lock().len(), 1);

        let results = runner.results_for("test-agent");
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
    }

    #[tokio::test]
    async fn error_pattern_triggers_recovery_and_rerun() {
        let dir = TempDir::new().unwrap();
        // Failing command output matches the builtin "command not found"
        // pattern; the fix runs, then the re-run succeeds.
        let backend = Arc::new(ScriptedBackend::new(vec![
            (127, "sh: widget: command not found\n"),
            (0, "fix applied\n"),
            (0, "widget ok\n"),
        ]));
        let runner = runner(&dir, backend.clone());

        let mut command = AgentCommand::new("widget");
        command.error_patterns = vec!["command not found".to_string()];
        let agent = simple_agent(vec![command]);

        let result = runner.run(&agent, RunOptions::default()).await.unwrap();
        assert!(result.success);
        let calls = backend.calls.lock().clone();
        assert_eq!(calls, ["widget", "hash -r", "widget"]);

        // The outcome was learned.
        let learned = LearnedSolutionStore::load(&dir.path().join("learned.json"));
        assert_eq!(learned.solutions().len(), 1);
        assert_eq!(learned.solutions()[0].success_count, 1);
    }

    #[tokio::test]
    async fn retry_count_reruns_before_failing() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::new(vec![
            (1, "flaky\n"),
            (0, "ok\n"),
        ]));
        let runner = runner(&dir, backend.clone());

        let mut command = AgentCommand::new("flaky-tool");
        command.retry_count = 1;
        command.retry_delay_secs = 0;
        let agent = simple_agent(vec![command]);

        let result = runner.run(&agent, RunOptions::default()).await.unwrap();
        assert!(result.success);
        assert_eq!(backend.calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn dry_run_spawns_nothing() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::new(vec![]));
        let runner = runner(&dir, backend.clone());

        let agent = simple_agent(vec![AgentCommand::new("rm -rf {{HOME}}/scratch")]);
        let options = RunOptions {
            dry_run: true,
            ..RunOptions::default()
        };
        let result = runner.run(&agent, options).await.unwrap();

        assert!(result.dry_run);
        assert!(backend.calls.lock().is_empty());
        assert!(result.output.contains("[dry-run]"));
        // Placeholders resolve even in dry runs.
        assert!(!result.output.contains("{{HOME}}"));
    }

    #[tokio::test]
    async fn disabled_agent_is_refused() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::new(vec![]));
        let runner = runner(&dir, backend);

        let mut agent = simple_agent(vec![AgentCommand::new("echo")]);
        agent.enabled = false;
        let err = runner.run(&agent, RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, AgentError::Disabled(_)));
    }

    #[tokio::test]
    async fn waterfall_builds_in_order_and_records_cache() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::new(vec![
            (0, "Using cache\n"),
            (0, "Running in abc\n"),
            (0, "CACHED\n"),
        ]));
        let mut runner = runner(&dir, backend.clone());
        runner.settings.container_enabled = true;

        let mut agent = simple_agent(vec![]);
        agent.container = Some(ContainerConfig {
            image: "acme/app".to_string(),
            waterfall: Some(crate::agents::WaterfallSpec {
                stages: vec!["base".into(), "app".into(), "test".into()],
                dependencies: [
                    ("app".to_string(), vec!["base".to_string()]),
                    ("test".to_string(), vec!["app".to_string()]),
                ]
                .into_iter()
                .collect(),
            }),
            ..ContainerConfig::default()
        });

        let result = runner.run(&agent, RunOptions::default()).await.unwrap();
        assert_eq!(
            backend.calls.lock().as_slice(),
            ["build:base", "build:app", "build:test"]
        );
        assert_eq!(result.stage_durations.len(), 3);

        let cache = DockerBuildCache::load(&dir.path().join("build_cache.json"));
        let entry = cache.entries.get("test-agent").unwrap();
        assert_eq!(entry.cache_hits, 2);
        assert_eq!(entry.cache_misses, 1);
    }

    #[tokio::test]
    async fn waterfall_cycle_fails_before_building() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::new(vec![]));
        let mut runner = runner(&dir, backend.clone());
        runner.settings.container_enabled = true;

        let mut agent = simple_agent(vec![]);
        agent.container = Some(ContainerConfig {
            image: "acme/app".to_string(),
            waterfall: Some(crate::agents::WaterfallSpec {
                stages: vec!["base".into(), "test".into()],
                dependencies: [
                    ("base".to_string(), vec!["test".to_string()]),
                    ("test".to_string(), vec!["base".to_string()]),
                ]
                .into_iter()
                .collect(),
            }),
            ..ContainerConfig::default()
        });

        let err = runner.run(&agent, RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, AgentError::CycleDetected(_)));
        assert_eq!(backend.build_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn placeholders_resolve_from_context() {
        let mut context = HashMap::new();
        context.insert("port".to_string(), "8080".to_string());
        context.insert("HOME".to_string(), "/home/dev".to_string());
        assert_eq!(
            resolve_placeholders("lsof -ti :{{port}} && ls {{HOME}}", &context),
            "lsof -ti :8080 && ls /home/dev"
        );
        assert_eq!(resolve_placeholders("no placeholders", &context), "no placeholders");
    }
}
