//! Operator commands typed on the server's standard input

use crate::fault::ServerFault;
use crate::state::ServerState;
use log::{debug, info, warn};
use std::io::BufRead;
use std::sync::Arc;
use tokio::sync::mpsc;

pub const SHUTDOWN_REASON: &str = "Server is shutting down";
pub const KICK_REASON: &str = "You were kicked from the server.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Disconnect everyone and stop the server
    Quit,
    /// Disconnect the named user
    Kick(String),
    /// Send the line to every connected user as a server message
    Broadcast(String),
    Unknown(String),
}

impl ConsoleCommand {
    /// Parses one console line; blank lines yield `None`
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return None;
        }

        let Some(command) = line.strip_prefix('/') else {
            return Some(ConsoleCommand::Broadcast(line.to_string()));
        };

        let (name, argument) = match command.split_once(' ') {
            Some((name, argument)) => (name, argument.trim()),
            None => (command.trim(), ""),
        };

        match name.to_lowercase().as_str() {
            "quit" => Some(ConsoleCommand::Quit),
            "kick" if !argument.is_empty() => Some(ConsoleCommand::Kick(argument.to_string())),
            _ => Some(ConsoleCommand::Unknown(line.to_string())),
        }
    }

    /// Carries out the command, returning whether the server should stop
    pub async fn execute(self, state: &ServerState) -> bool {
        match self {
            ConsoleCommand::Quit => {
                info!("Shutting down on operator request");
                state.disconnect_all(SHUTDOWN_REASON).await;
                state.shutdown_token().cancel();
                true
            }
            ConsoleCommand::Kick(username) => {
                if state.kick(&username, KICK_REASON).await > 0 {
                    info!("Kicked {}", username);
                }
                false
            }
            ConsoleCommand::Broadcast(text) => {
                let recipients = state.broadcaster().server_message_to_all(&text, None);
                debug!("Console message sent to {} clients", recipients);
                false
            }
            ConsoleCommand::Unknown(line) => {
                warn!("Unknown console command: {}", line);
                false
            }
        }
    }
}

/// Forwards stdin lines into a channel from a dedicated thread
///
/// The thread blocks on stdin; it ends with the process or at end of input.
pub fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Could not read console input: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

/// Executes console lines until `/quit`, end of input, or shutdown
pub async fn run_console(
    state: Arc<ServerState>,
    mut lines: mpsc::UnboundedReceiver<String>,
) -> Result<(), ServerFault> {
    let shutdown = state.shutdown_token().clone();

    loop {
        let line = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            line = lines.recv() => line,
        };

        let Some(line) = line else {
            debug!("Console input closed");
            break;
        };
        if let Some(command) = ConsoleCommand::parse(&line) {
            if command.execute(&state).await {
                break;
            }
        }
    }

    Ok(())
}
