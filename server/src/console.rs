//! Console command layer.
//!
//! Lines typed on stdin become commands executed between ticks. A detached
//! reader thread feeds raw lines into an unbounded channel so the main loop
//! can poll input without ever blocking. Commands are a tagged sum dispatched
//! against an explicit [`CommandContext`] rather than any global engine
//! handle; the registry stays an ordered vector so iteration order is
//! stable.

use log::{error, info};
use std::io::BufRead;
use std::time::Duration;
use tokio::sync::mpsc;

/// What a command does when it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandAction {
    /// Stop the main loop and shut the server down cleanly.
    Quit,
    /// Report tick statistics.
    Ticks,
}

/// A registered console command and its argument arity.
#[derive(Debug)]
pub struct ConsoleCommand {
    name: &'static str,
    min_args: usize,
    max_args: usize,
    action: CommandAction,
}

/// Loop state handed to commands; commands mutate this, never the loop
/// directly.
#[derive(Debug)]
pub struct CommandContext {
    pub stop: bool,
    pub ticks: u64,
    pub last_tick: Duration,
    pub client_count: usize,
}

/// Ordered command table.
pub struct CommandRegistry {
    commands: Vec<ConsoleCommand>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRegistry {
    pub fn new() -> Self {
        let commands = vec![
            ConsoleCommand {
                name: "quit",
                min_args: 0,
                max_args: 0,
                action: CommandAction::Quit,
            },
            ConsoleCommand {
                name: "ticks",
                min_args: 0,
                max_args: 0,
                action: CommandAction::Ticks,
            },
        ];
        Self { commands }
    }

    /// Parses and executes one input line against the context.
    pub fn dispatch(&self, line: &str, ctx: &mut CommandContext) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        let (name, args) = match line.split_once(' ') {
            Some((name, rest)) => (name, rest),
            None => (line, ""),
        };

        let command = match self.commands.iter().find(|command| command.name == name) {
            Some(command) => command,
            None => {
                info!("Requested command \"{}\" cannot be executed now.", name);
                return;
            }
        };

        let args = split_arguments(args);
        if args.len() < command.min_args {
            info!("Not enough arguments in \"{}\" command.", name);
            return;
        }
        if args.len() > command.max_args {
            info!("Too many arguments in \"{}\" command.", name);
            return;
        }

        match command.action {
            CommandAction::Quit => {
                ctx.stop = true;
            }
            CommandAction::Ticks => {
                info!("Ticks count: {}", ctx.ticks);
                info!(
                    "Ticks timestamp: {:.2}ms",
                    ctx.last_tick.as_secs_f64() * 1000.0
                );
                info!("Connected clients: {}", ctx.client_count);
            }
        }
    }
}

/// Splits an argument string on spaces, honouring double quotes and
/// backslash escapes.
pub fn split_arguments(args: &str) -> Vec<String> {
    let mut slices = Vec::new();
    let mut slice = String::new();
    let mut escaped = false;
    let mut in_quotes = false;

    for c in args.chars() {
        if escaped {
            slice.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            in_quotes = !in_quotes;
        } else if !in_quotes && c == ' ' {
            if !slice.is_empty() {
                slices.push(std::mem::take(&mut slice));
            }
        } else {
            slice.push(c);
        }
    }
    if !slice.is_empty() {
        slices.push(slice);
    }

    slices
}

/// Spawns the stdin reader and returns the channel it feeds.
///
/// Reading stdin is inherently blocking, so it lives on a plain detached
/// thread rather than the runtime; the receiving loop polls with
/// `try_recv` so input never stalls a tick, and the thread dies with the
/// process.
pub fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();

    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    error!("Failed to read console input: {}", err);
                    break;
                }
            }
        }
    });

    rx
}
