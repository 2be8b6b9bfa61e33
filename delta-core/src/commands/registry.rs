//! Internal command registry.
//!
//! Namespaced `:`-prefixed commands, populated once at startup. Help and
//! completion data derive from the same table.

use indexmap::IndexMap;

/// One internal command.
#[derive(Debug, Clone)]
pub struct InternalCommand {
    /// Namespaced name, e.g. `update install`.
    pub name: &'static str,
    pub summary: &'static str,
    pub usage: &'static str,
}

/// The dispatch table.
pub struct CommandRegistry {
    commands: IndexMap<&'static str, InternalCommand>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            commands: IndexMap::new(),
        };
        for (name, summary, usage) in COMMAND_TABLE {
            registry.commands.insert(
                name,
                InternalCommand {
                    name,
                    summary,
                    usage,
                },
            );
        }
        registry
    }

    /// Resolve input (without the leading `:`) to a command and its
    /// remaining arguments, matching the longest registered name.
    pub fn resolve<'a>(&self, input: &'a str) -> Option<(&InternalCommand, &'a str)> {
        let trimmed = input.trim();
        let mut best: Option<(&InternalCommand, &'a str)> = None;
        for (name, command) in &self.commands {
            if let Some(rest) = trimmed.strip_prefix(name) {
                if rest.is_empty() || rest.starts_with(' ') {
                    let replace = match best {
                        Some((current, _)) => name.len() > current.name.len(),
                        None => true,
                    };
                    if replace {
                        best = Some((command, rest.trim_start()));
                    }
                }
            }
        }
        best
    }

    pub fn commands(&self) -> impl Iterator<Item = &InternalCommand> {
        self.commands.values()
    }

    /// Names starting with `prefix`, for the completer.
    pub fn completions(&self, prefix: &str) -> Vec<&'static str> {
        self.commands
            .keys()
            .filter(|name| name.starts_with(prefix))
            .copied()
            .collect()
    }

    /// Rendered help, one line per command.
    pub fn help_text(&self) -> String {
        let width = self
            .commands
            .keys()
            .map(|name| name.len())
            .max()
            .unwrap_or(0);
        let mut out = String::from("Internal commands:\n");
        for command in self.commands.values() {
            out.push_str(&format!(
                "  :{:width$}  {}\n",
                command.name,
                command.summary,
                width = width
            ));
        }
        out
    }
}

/// (name, summary, usage)
const COMMAND_TABLE: &[(&str, &str, &str)] = &[
    ("help", "show this help", ":help"),
    ("exit", "leave the session", ":exit"),
    ("validation config", "show validation policy", ":validation config"),
    ("validation rules", "list safety rules", ":validation rules"),
    (
        "validation test",
        "validate a command without running it",
        ":validation test <command>",
    ),
    ("validation stats", "decision log statistics", ":validation stats"),
    (
        "validation add",
        "add a custom safety rule",
        ":validation add <name> <low|medium|high|critical> <regex>",
    ),
    (
        "validation remove",
        "remove a custom safety rule",
        ":validation remove <name>",
    ),
    ("memory stats", "memory store statistics", ":memory stats"),
    ("memory search", "search command memory", ":memory search <text>"),
    ("memory export", "export the memory store", ":memory export [path]"),
    (
        "memory import",
        "import a memory snapshot",
        ":memory import <path> [replace|merge|keep-newer]",
    ),
    ("update check", "check for a newer release", ":update check"),
    ("update install", "download and install the latest release", ":update install"),
    ("update rollback", "restore the previous binary", ":update rollback"),
    ("update history", "show update history", ":update history [csv]"),
    ("update channel", "show or switch the release channel", ":update channel [name]"),
    (
        "update schedule",
        "schedule an update",
        ":update schedule <version> <+duration|@daily|@weekly|@monthly>",
    ),
    ("update status", "show the update engine state", ":update status"),
    ("agent list", "list agents", ":agent list"),
    ("agent show", "show one agent", ":agent show <id>"),
    ("agent run", "run an agent", ":agent run <id> [--dry-run]"),
    ("agent delete", "delete an agent", ":agent delete <id>"),
    (
        "agent discover",
        "load agents declared in a repository",
        ":agent discover [path]",
    ),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaced_names_resolve_with_args() {
        let registry = CommandRegistry::new();
        let (command, args) = registry.resolve("update install").unwrap();
        assert_eq!(command.name, "update install");
        assert_eq!(args, "");

        let (command, args) = registry.resolve("memory import /tmp/snap.json merge").unwrap();
        assert_eq!(command.name, "memory import");
        assert_eq!(args, "/tmp/snap.json merge");
    }

    #[test]
    fn longest_name_wins() {
        let registry = CommandRegistry::new();
        // "update" alone is not registered; "update check" is.
        let (command, _) = registry.resolve("update check").unwrap();
        assert_eq!(command.name, "update check");
    }

    #[test]
    fn unknown_commands_do_not_resolve() {
        let registry = CommandRegistry::new();
        assert!(registry.resolve("frobnicate").is_none());
        // Prefix of a name without the word boundary must not match.
        assert!(registry.resolve("update checkout").is_none());
    }

    #[test]
    fn completions_share_the_table() {
        let registry = CommandRegistry::new();
        let updates = registry.completions("update ");
        assert!(updates.contains(&"update install"));
        assert!(updates.contains(&"update rollback"));
        assert!(!updates.contains(&"memory stats"));
    }

    #[test]
    fn help_mentions_every_command() {
        let registry = CommandRegistry::new();
        let help = registry.help_text();
        for command in registry.commands() {
            assert!(help.contains(command.name));
        }
    }
}
