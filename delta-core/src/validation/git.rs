//! Git-aware domain validator.
//!
//! Keyed off the command head `git`. Worktree dirtiness comes from an
//! injected [`WorktreeStatus`] capability; the validator never invokes git
//! itself.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::validation::risk::{ErrorKind, Finding, RiskLevel};

pub const RULE_FORCE_PUSH_PROTECTED: &str = "git.force_push_protected_branch";
pub const RULE_RESET_HARD_DIRTY: &str = "git.reset_hard_dirty_worktree";
pub const RULE_CLEAN_FORCE: &str = "git.clean_force";
pub const RULE_ADD_SENSITIVE: &str = "git.add_sensitive_file";

/// Capability for inspecting the state of the current worktree.
pub trait WorktreeStatus: Send + Sync {
    /// Whether the tree has uncommitted changes.
    fn is_dirty(&self) -> bool;
}

/// Default capability for contexts with no repository information.
pub struct UnknownWorktree;

impl WorktreeStatus for UnknownWorktree {
    fn is_dirty(&self) -> bool {
        false
    }
}

static SENSITIVE_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(^|/)(\.env(\..+)?|id_rsa|id_ed25519|id_ecdsa|.*\.pem|.*\.p12|.*\.key|\.netrc|\.npmrc|credentials(\.json)?|\.aws/credentials|\.htpasswd)$",
    )
    .expect("sensitive path regex")
});

/// Validator for `git` commands.
pub struct GitValidator {
    protected_branches: Vec<String>,
    worktree: Arc<dyn WorktreeStatus>,
}

impl GitValidator {
    pub fn new(protected_branches: Vec<String>, worktree: Arc<dyn WorktreeStatus>) -> Self {
        Self {
            protected_branches,
            worktree,
        }
    }

    /// Check one (already decoded) command line.
    pub fn validate(&self, command: &str) -> Vec<Finding> {
        let tokens = match shell_words::split(command) {
            Ok(tokens) => tokens,
            // Unbalanced quoting is the syntax checker's problem.
            Err(_) => return Vec::new(),
        };

        let Some((sub_idx, subcommand)) = find_git_subcommand(&tokens) else {
            return Vec::new();
        };
        let args = &tokens[sub_idx + 1..];
        let span = span_of(command, subcommand);

        let mut findings = Vec::new();
        match subcommand {
            "push" => {
                if push_is_forced(args) {
                    if let Some(branch) = self.pushed_protected_branch(args) {
                        findings.push(
                            Finding::new(
                                ErrorKind::Git,
                                RiskLevel::High,
                                RULE_FORCE_PUSH_PROTECTED,
                                format!("force push to protected branch '{branch}'"),
                                span,
                            )
                            .with_suggestion("use --force-with-lease on a feature branch, or open a PR")
                            .with_note(
                                "a force push rewrites the remote branch history; anyone who \
                                 pulled the old history now has a diverged clone",
                            ),
                        );
                    }
                }
            }
            "reset" => {
                if args.iter().any(|arg| arg == "--hard") && self.worktree.is_dirty() {
                    findings.push(
                        Finding::new(
                            ErrorKind::Git,
                            RiskLevel::High,
                            RULE_RESET_HARD_DIRTY,
                            "reset --hard with uncommitted changes in the worktree",
                            span,
                        )
                        .with_suggestion("git stash first, or commit the work in progress")
                        .with_note("reset --hard discards uncommitted changes irreversibly"),
                    );
                }
            }
            "clean" => {
                if clean_is_force(args) {
                    findings.push(
                        Finding::new(
                            ErrorKind::Git,
                            RiskLevel::Medium,
                            RULE_CLEAN_FORCE,
                            "git clean with force removes untracked files",
                            span,
                        )
                        .with_suggestion("run git clean -n first to preview what gets deleted"),
                    );
                }
            }
            "add" => {
                for arg in args.iter().filter(|arg| !arg.starts_with('-')) {
                    if SENSITIVE_PATH_RE.is_match(arg) {
                        findings.push(
                            Finding::new(
                                ErrorKind::Git,
                                RiskLevel::Medium,
                                RULE_ADD_SENSITIVE,
                                format!("staging a sensitive-looking file '{arg}'"),
                                span_of(command, arg),
                            )
                            .with_suggestion("add the path to .gitignore instead")
                            .with_note(
                                "credentials committed to history stay retrievable even after \
                                 a later delete",
                            ),
                        );
                    }
                }
            }
            _ => {}
        }
        findings
    }

    fn pushed_protected_branch(&self, args: &[String]) -> Option<String> {
        // Positional args after the remote name are refspecs; match each
        // against the protected set. `git push --force origin main`.
        let positional: Vec<&String> = args.iter().filter(|arg| !arg.starts_with('-')).collect();
        for refspec in positional.iter().skip(1) {
            let branch = refspec
                .rsplit(':')
                .next()
                .unwrap_or(refspec)
                .trim_start_matches('+');
            if self.branch_is_protected(branch) {
                return Some(branch.to_string());
            }
        }
        // Bare `git push --force` targets the current upstream; treat it as
        // protected only when the set contains a literal match for HEAD-ish
        // names is impossible to know here, so stay quiet.
        None
    }

    fn branch_is_protected(&self, branch: &str) -> bool {
        self.protected_branches.iter().any(|pattern| {
            match pattern.strip_suffix('*') {
                Some(prefix) => branch.starts_with(prefix),
                None => branch == pattern,
            }
        })
    }
}

/// Find the git subcommand, skipping global options that may precede it
/// (`-C <dir>`, `-c key=val`, `--git-dir=…`). The first non-option token is
/// the subcommand; later positionals must not be misread as one.
fn find_git_subcommand(tokens: &[String]) -> Option<(usize, &str)> {
    let head = tokens.first()?;
    let base = std::path::Path::new(head.as_str())
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(head);
    if base != "git" {
        return None;
    }

    let mut skip_next = false;
    for (idx, token) in tokens.iter().enumerate().skip(1) {
        if skip_next {
            skip_next = false;
            continue;
        }
        if global_option_takes_value(token) {
            skip_next = true;
            continue;
        }
        if token.starts_with('-') {
            continue;
        }
        return Some((idx, token.as_str()));
    }
    None
}

fn global_option_takes_value(token: &str) -> bool {
    matches!(token, "-C" | "-c" | "--git-dir" | "--work-tree" | "--namespace")
}

fn push_is_forced(args: &[String]) -> bool {
    args.iter().any(|arg| {
        matches!(arg.as_str(), "--force" | "-f")
            || arg.starts_with("--force-with-lease")
            || arg.starts_with("--force-if-includes")
            || short_flag_group_contains(arg, 'f')
    }) || args
        .iter()
        .any(|arg| arg.starts_with('+') && arg.len() > 1 && !arg.starts_with("+-"))
}

fn clean_is_force(args: &[String]) -> bool {
    args.iter().any(|arg| {
        arg == "--force" || short_flag_group_contains(arg, 'f')
    })
}

/// `-fdx` contains 'f'; `--force` is not a short flag group.
fn short_flag_group_contains(arg: &str, target: char) -> bool {
    arg.starts_with('-') && !arg.starts_with("--") && arg.chars().skip(1).any(|c| c == target)
}

fn span_of(command: &str, token: &str) -> std::ops::Range<usize> {
    match command.find(token) {
        Some(start) => start..start + token.len(),
        None => 0..0,
    }
}
