//! Chat input and the display of incoming text

use crate::connection::{InTextMessage, ProtocolEngine};
use log::{debug, warn};
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// How often queued messages are printed
pub const DISPLAY_PERIOD: Duration = Duration::from_millis(50);

pub const QUIT_REASON: &str = "Quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatInput {
    Quit,
    Message(String),
}

impl ChatInput {
    /// Parses a typed line; blank lines and unknown `/` commands yield `None`
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return None;
        }

        if line.starts_with('/') {
            if line == "/quit" {
                return Some(ChatInput::Quit);
            }
            warn!("Unknown command: {}", line);
            return None;
        }

        Some(ChatInput::Message(line.to_string()))
    }
}

/// The line printed for an incoming message
pub fn format_message(message: &InTextMessage) -> String {
    if message.from_server {
        format!("[Server] {}", message.message)
    } else {
        message.message.clone()
    }
}

/// Forwards stdin lines into a channel from a dedicated thread
pub fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Prints incoming text and sends typed lines until the session ends
pub async fn run_chat(engine: Arc<ProtocolEngine>, mut lines: mpsc::UnboundedReceiver<String>) {
    let shutdown = engine.shutdown_token().clone();
    let mut display = tokio::time::interval(DISPLAY_PERIOD);
    let mut input_open = true;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            line = lines.recv(), if input_open => {
                let Some(line) = line else {
                    input_open = false;
                    continue;
                };
                match ChatInput::parse(&line) {
                    Some(ChatInput::Quit) => {
                        engine.disconnect(QUIT_REASON).await;
                        break;
                    }
                    Some(ChatInput::Message(text)) => {
                        if let Err(e) = engine.send_text(&text).await {
                            warn!("Could not send message: {}", e);
                        }
                    }
                    None => {}
                }
            }
            _ = display.tick() => {
                for message in engine.take_text_messages() {
                    println!("{}", format_message(&message));
                }
            }
        }
    }

    for message in engine.take_text_messages() {
        println!("{}", format_message(&message));
    }
    debug!("Chat loop stopped");
}
