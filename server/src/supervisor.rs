//! Accept loop handing new connections to free slots

use crate::fault::ServerFault;
use crate::session::spawn_session;
use crate::slot::TableFull;
use crate::state::{ServerState, DISCONNECT_SEND_TIMEOUT};
use log::{debug, info, warn};
use shared::payload::encode_text;
use shared::{write_frame, ServerMessageKind};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

/// Reason sent to connections arriving while every slot is taken
pub const SERVER_FULL_REASON: &str = "Server is currently full";

/// Consecutive accept failures tolerated before the listener counts as broken
pub const MAX_CONSECUTIVE_ACCEPT_ERRORS: u32 = 32;
/// Pause after a failed accept
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Tracks failed accepts since the last successful one
#[derive(Debug, Default)]
pub struct AcceptErrors {
    consecutive: u32,
}

impl AcceptErrors {
    /// Records a failure, turning it into a fault once the limit is exceeded
    pub fn record(&mut self, error: std::io::Error) -> Result<(), ServerFault> {
        self.consecutive += 1;
        if self.consecutive > MAX_CONSECUTIVE_ACCEPT_ERRORS {
            return Err(ServerFault::Accept(error));
        }
        warn!("Error accepting client: {}", error);
        Ok(())
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }
}

/// Accepts connections until the server shuts down
///
/// Fails once accepting keeps failing with no success in between.
pub async fn accept_loop(state: Arc<ServerState>, listener: TcpListener) -> Result<(), ServerFault> {
    info!("Listening for clients...");
    let shutdown = state.shutdown_token().clone();
    let mut errors = AcceptErrors::default();

    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                errors.reset();
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Could not disable Nagle for {}: {}", addr, e);
                }
                admit(&state, stream, &addr.to_string()).await;
            }
            Err(e) => {
                errors.record(e)?;
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }

    debug!("Accept loop stopped");
    Ok(())
}

/// Claims a slot for `stream` and starts its session, or refuses it
///
/// Returns the claimed slot index.
pub async fn admit<S>(state: &Arc<ServerState>, stream: S, peer: &str) -> Option<usize>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (reader, writer) = tokio::io::split(stream);

    match state
        .slots
        .claim(Box::new(writer), Instant::now(), state.shutdown_token())
        .await
    {
        Ok(claim) => {
            let index = claim.index;
            info!("Accepted client #{} from {}. Handshaking...", index, peer);

            let broadcaster = state.broadcaster();
            broadcaster.handshake(index);
            let join_message = state.settings().join_message;
            if !join_message.is_empty() {
                broadcaster.server_message(index, &join_message);
            }

            spawn_session(Arc::clone(state), claim, reader);
            state.broadcast_settings();
            Some(index)
        }
        Err(TableFull(mut writer)) => {
            info!("Client {} attempted to connect, but server is full.", peer);
            let reason = encode_text(SERVER_FULL_REASON);
            let refusal = write_frame(&mut writer, ServerMessageKind::HandshakeRefusal, &reason);
            match tokio::time::timeout(DISCONNECT_SEND_TIMEOUT, refusal).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Refusal to {} not sent: {}", peer, e),
                Err(_) => debug!("Refusal to {} timed out", peer),
            }
            let _ = writer.shutdown().await;
            None
        }
    }
}
