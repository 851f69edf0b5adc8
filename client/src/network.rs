//! One client session: connection, file bridge and chat running together

use crate::bridge::PluginBridge;
use crate::chat::run_chat;
use crate::config::ClientConfig;
use crate::connection::{ClientError, ProtocolEngine, SessionEnd};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long helper tasks get to finish after the session ends
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(1);

pub struct Client {
    engine: Arc<ProtocolEngine>,
    reader: OwnedReadHalf,
    bridge: PluginBridge,
}

impl Client {
    pub async fn connect(config: &ClientConfig) -> Result<Self, ClientError> {
        info!("Connecting to {} as {}", config.server, config.username);
        let (engine, reader) = ProtocolEngine::connect(config).await?;

        Ok(Client {
            engine: Arc::new(engine),
            reader,
            bridge: PluginBridge::new(&config.plugin_dir),
        })
    }

    pub fn engine(&self) -> Arc<ProtocolEngine> {
        Arc::clone(&self.engine)
    }

    fn spawn_bridge(&self) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        let bridge = self.bridge.clone();
        tokio::spawn(run_bridge(engine, bridge))
    }

    fn spawn_chat(&self, lines: mpsc::UnboundedReceiver<String>) -> JoinHandle<()> {
        tokio::spawn(run_chat(Arc::clone(&self.engine), lines))
    }

    /// Runs the session until the server or the user ends it
    ///
    /// `chat_lines` feeds typed lines to the chat loop; without it no chat
    /// loop runs.
    pub async fn run(
        self,
        chat_lines: Option<mpsc::UnboundedReceiver<String>>,
    ) -> Result<SessionEnd, ClientError> {
        self.bridge.start_session(self.engine.username())?;

        let mut tasks = vec![self.spawn_bridge()];
        if let Some(lines) = chat_lines {
            tasks.push(self.spawn_chat(lines));
        }

        let Client {
            engine,
            reader,
            bridge,
        } = self;
        let end = engine.run_receiver(reader).await;
        info!("{}", end);

        for task in tasks {
            if tokio::time::timeout(TASK_STOP_TIMEOUT, task).await.is_err() {
                debug!("A client task did not stop in time");
            }
        }
        bridge.end_session();

        Ok(end)
    }
}

/// Moves updates between the external application's files and the server
///
/// Polls at the server-supplied cadence: forwards a pending outgoing update,
/// then hands queued incoming updates over once the application has consumed
/// the previous batch.
pub async fn run_bridge(engine: Arc<ProtocolEngine>, bridge: PluginBridge) {
    let shutdown = engine.shutdown_token().clone();

    loop {
        let outgoing = {
            let bridge = bridge.clone();
            tokio::task::spawn_blocking(move || bridge.take_outgoing())
                .await
                .ok()
                .flatten()
        };
        if let Some(update) = outgoing {
            if let Err(e) = engine.send_state_update(&update).await {
                debug!("Could not forward update: {}", e);
                break;
            }
        }

        if engine.has_relay_updates() && !bridge.incoming_pending() {
            let updates = engine.take_relay_updates();
            let bridge = bridge.clone();
            match tokio::task::spawn_blocking(move || bridge.deliver_incoming(&updates)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!("Could not write incoming updates: {}", e),
                Err(e) => warn!("Incoming update writer failed: {}", e),
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(engine.update_interval()) => {}
        }
    }

    debug!("Bridge loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{
        read_frame, write_frame, ClientMessageKind, ServerMessageKind, SettingsPayload,
        FILE_FORMAT_VERSION, MAX_FRAME_LENGTH,
    };
    use std::fs;

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn test_bridge_forwards_both_directions() {
        let temp = tempfile::tempdir().unwrap();
        let bridge = PluginBridge::new(temp.path());
        bridge.start_session("alice").unwrap();

        let (ours, mut server) = tokio::io::duplex(64 * 1024);
        let (reader, ours) = tokio::io::split(ours);
        let engine = Arc::new(ProtocolEngine::new("alice", Box::new(ours)));

        // Speed the bridge up before it starts polling
        let settings = SettingsPayload {
            update_interval: 10,
            max_queued_updates: 4,
            screenshot_interval: 3000,
        };
        write_frame(&mut server, ServerMessageKind::Settings, &settings.encode().unwrap())
            .await
            .unwrap();
        write_frame(&mut server, ServerMessageKind::StateUpdate, b"remote")
            .await
            .unwrap();
        let receiver = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.run_receiver(reader).await })
        };
        wait_for(|| engine.has_relay_updates()).await;

        let mut out = FILE_FORMAT_VERSION.to_le_bytes().to_vec();
        out.extend_from_slice(b"local");
        fs::write(bridge.out_path(), out).unwrap();

        let bridge_task = tokio::spawn(run_bridge(Arc::clone(&engine), bridge.clone()));

        let frame = read_frame(&mut server, MAX_FRAME_LENGTH).await.unwrap();
        assert_eq!(
            frame.kind::<ClientMessageKind>().unwrap(),
            ClientMessageKind::StateUpdate
        );
        assert_eq!(frame.payload, b"local");

        let in_path = bridge.in_path();
        let mut expected = FILE_FORMAT_VERSION.to_le_bytes().to_vec();
        expected.extend_from_slice(b"remote");
        wait_for(|| fs::read(&in_path).map(|b| b == expected).unwrap_or(false)).await;

        engine.disconnect("Quit").await;
        bridge_task.await.unwrap();
        assert_eq!(receiver.await.unwrap(), SessionEnd::Quit);
    }
}
