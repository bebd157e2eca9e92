//! REPL implementation
//!
//! This module implements the interactive operator console for Tenant-Forge.

use crate::cli::commands::{self, format_error, Command};
use crate::database::manager::DatabaseManager;
use crate::error::{Result, TenantForgeError};
use rustyline::completion::Completer;
use rustyline::error::ReadlineError;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::history::DefaultHistory;
use rustyline::validate::Validator;
use rustyline::Context;
use rustyline::Helper;
use rustyline::{CompletionType, Config, Editor};
use std::path::PathBuf;
use std::sync::Arc;

const COMMANDS: &[&str] = &[
    "/modules",
    "/register",
    "/migrate",
    "/rollback",
    "/status",
    "/tables",
    "/backup",
    "/restore",
    "/plan",
    "/maintenance",
    "/cleanup",
    "/scan",
    "/health",
    "/metrics",
    "/invalidate",
    "/help",
    "/quit",
    "/exit",
];

/// Command name completer
struct TenantForgeCompleter;

impl Completer for TenantForgeCompleter {
    type Candidate = String;

    fn complete(
        &self,
        line: &str,
        _pos: usize,
        _ctx: &Context<'_>,
    ) -> std::result::Result<(usize, Vec<String>), ReadlineError> {
        // Only the command word completes
        if line.starts_with('/') && !line.contains(' ') {
            let matches: Vec<String> = COMMANDS
                .iter()
                .filter(|cmd| cmd.starts_with(line))
                .map(|s| s.to_string())
                .collect();
            Ok((0, matches))
        } else {
            Ok((0, vec![]))
        }
    }
}

impl Hinter for TenantForgeCompleter {
    type Hint = String;
}

impl Highlighter for TenantForgeCompleter {}

impl Validator for TenantForgeCompleter {}

impl Helper for TenantForgeCompleter {}

fn history_path() -> PathBuf {
    dirs::home_dir()
        .map(|p| p.join(".tenant-forge").join("history"))
        .unwrap_or_else(|| ".tenant-forge-history".into())
}

/// Tenant-Forge REPL
pub struct Repl {
    /// The rustyline editor
    editor: Editor<TenantForgeCompleter, DefaultHistory>,
    /// Whether the REPL should continue running
    running: bool,
    platform: Arc<DatabaseManager>,
}

impl Repl {
    /// Create a new REPL instance
    pub fn new(platform: Arc<DatabaseManager>) -> Result<Self> {
        let config = Config::builder()
            .history_ignore_space(true)
            .completion_type(CompletionType::List)
            .auto_add_history(true)
            .build();

        let mut editor = Editor::<TenantForgeCompleter, DefaultHistory>::with_config(config)
            .map_err(|e| {
                TenantForgeError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("Failed to initialize editor: {}", e),
                ))
            })?;
        editor.set_helper(Some(TenantForgeCompleter));

        if let Err(e) = editor.load_history(&history_path()) {
            tracing::debug!("no history loaded: {}", e);
        }

        Ok(Self {
            editor,
            running: true,
            platform,
        })
    }

    /// Run the REPL loop
    pub async fn run(&mut self) -> Result<()> {
        self.print_welcome().await;

        while self.running {
            match self.editor.readline("tenant-forge> ") {
                Ok(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }

                    match Command::parse(line) {
                        Ok(command) => self.handle_command(command).await,
                        Err(e) => println!("{}", format_error(&e)),
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("^C");
                    continue;
                }
                Err(ReadlineError::Eof) => {
                    println!();
                    self.running = false;
                }
                Err(err) => {
                    println!("Error: {:?}", err);
                    self.running = false;
                }
            }
        }

        self.save_history();
        Ok(())
    }

    fn save_history(&mut self) {
        let path = history_path();
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!("cannot create history directory: {}", e);
                return;
            }
        }
        if let Err(e) = self.editor.save_history(&path) {
            tracing::warn!("cannot save history: {}", e);
        }
    }

    async fn print_welcome(&self) {
        println!();
        println!("Tenant-Forge v{}", env!("CARGO_PKG_VERSION"));
        println!(
            "{} module(s) loaded, migrations from {}",
            self.platform.registry().list().await.len(),
            self.platform.config().migrations_dir.display()
        );
        println!("Type /help for available commands.");
        println!();
    }

    /// Handle a command
    async fn handle_command(&mut self, command: Command) {
        if command.command_type == commands::CommandType::Quit {
            self.running = false;
        }
        match commands::handle_command(&command, &self.platform).await {
            Ok(msg) => println!("{}", msg),
            Err(e) => println!("{}", format_error(&e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completer_lists_matching_commands() {
        let history = DefaultHistory::new();
        let ctx = Context::new(&history);
        let (start, matches) = TenantForgeCompleter.complete("/re", 3, &ctx).unwrap();
        assert_eq!(start, 0);
        assert_eq!(matches.len(), 2);
        assert!(matches.contains(&"/register".to_string()));
        assert!(matches.contains(&"/restore".to_string()));
    }

    #[test]
    fn test_completer_ignores_arguments() {
        let history = DefaultHistory::new();
        let ctx = Context::new(&history);
        let (_, matches) = TenantForgeCompleter.complete("/backup ve", 10, &ctx).unwrap();
        assert!(matches.is_empty());
    }
}
