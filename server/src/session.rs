//! Per-connection receive/dispatch loop and outgoing-queue writer

use crate::fault::spawn_worker;
use crate::slot::{ClientSlot, SlotClaim};
use crate::state::ServerState;
use log::{debug, info, warn};
use shared::payload::decode_text;
use shared::{
    read_frame, ClientHandshake, ClientMessageKind, ProtocolError, RawFrame, MAX_FRAME_LENGTH,
    MAX_SCREENSHOT_BYTES,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

/// Prefix marking a chat line as a command handled by the server
pub const COMMAND_SIGIL: char = '!';

/// Text sent to a newly handshaken user describing who else is online
///
/// `active_clients` counts the new user too.
pub fn occupancy_message(active_clients: usize, other_user: Option<&str>) -> String {
    if active_clients == 2 {
        if let Some(name) = other_user {
            return format!("There is currently 1 other user on this server: {}", name);
        }
    }

    let others = active_clients.saturating_sub(1);
    let mut text = format!("There are currently {} other users on this server.", others);
    if active_clients > 1 {
        text.push_str(" Enter !list to see them.");
    }
    text
}

/// The session of one claimed slot
///
/// Bound to the slot generation it was started with; once that generation
/// is no longer current every handler becomes a no-op.
pub struct ClientSession {
    state: Arc<ServerState>,
    index: usize,
    generation: u64,
    token: CancellationToken,
}

impl ClientSession {
    pub fn new(state: Arc<ServerState>, claim: SlotClaim) -> Self {
        Self {
            state,
            index: claim.index,
            generation: claim.generation,
            token: claim.token,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    fn slot(&self) -> Option<&ClientSlot> {
        self.state
            .slots
            .get(self.index)
            .filter(|slot| slot.is_current(self.generation))
    }

    /// Reads and dispatches frames until the peer leaves or the session is cancelled
    pub async fn run_reader<R>(self, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                frame = read_frame(&mut reader, MAX_FRAME_LENGTH) => frame,
            };

            match frame {
                Ok(frame) => {
                    if let Err(e) = self.handle_frame(frame).await {
                        warn!("Protocol error from client #{}: {}", self.index, e);
                        self.state
                            .disconnect(self.index, self.generation, "Protocol error")
                            .await;
                        break;
                    }
                }
                Err(e) if e.is_disconnect() => {
                    debug!("Client #{} connection ended: {}", self.index, e);
                    if let Some(slot) = self.slot() {
                        slot.mark_connection_lost(self.generation);
                    }
                    break;
                }
                Err(e) => {
                    warn!("Protocol error from client #{}: {}", self.index, e);
                    self.state
                        .disconnect(self.index, self.generation, "Protocol error")
                        .await;
                    break;
                }
            }
        }
        debug!("Client #{} reader stopped", self.index);
    }

    /// Updates liveness and dispatches one frame
    pub async fn handle_frame(&self, frame: RawFrame) -> Result<(), ProtocolError> {
        if self.token.is_cancelled() {
            return Ok(());
        }
        let Some(slot) = self.slot() else {
            return Ok(());
        };
        slot.touch(Instant::now());

        let kind = match frame.kind::<ClientMessageKind>() {
            Ok(kind) => kind,
            Err(ProtocolError::UnknownKind(kind)) => {
                warn!("Client #{} sent unknown message kind {}", self.index, kind);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.handle_message(kind, &frame.payload).await
    }

    /// Applies one message from this session's peer
    pub async fn handle_message(
        &self,
        kind: ClientMessageKind,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        let Some(slot) = self.slot() else {
            return Ok(());
        };

        match kind {
            ClientMessageKind::Handshake => self.handle_handshake(slot, payload).await,
            ClientMessageKind::ConnectionEnd => {
                let reason = decode_text(payload);
                self.state
                    .disconnect(self.index, self.generation, &reason)
                    .await;
                Ok(())
            }
            _ if !slot.is_ready() => {
                debug!("Ignoring {:?} from client #{} before handshake", kind, self.index);
                Ok(())
            }
            ClientMessageKind::StateUpdate => {
                let echo = self.state.settings().relay_updates_to_sender;
                self.state
                    .broadcaster()
                    .relay_state_update(self.index, payload, echo);
                Ok(())
            }
            ClientMessageKind::TextMessage => {
                self.handle_text(slot, &decode_text(payload)).await;
                Ok(())
            }
            ClientMessageKind::WatchPlayer => {
                self.handle_watch(slot, &decode_text(payload));
                Ok(())
            }
            ClientMessageKind::ScreenshotShare => {
                self.handle_screenshot(slot, payload);
                Ok(())
            }
        }
    }

    async fn handle_handshake(&self, slot: &ClientSlot, payload: &[u8]) -> Result<(), ProtocolError> {
        if slot.is_ready() {
            debug!("Ignoring repeated handshake from client #{}", self.index);
            return Ok(());
        }

        let handshake = ClientHandshake::decode(payload)?;
        let username = handshake.username;

        if !self.state.slots.admit(self.index, self.generation, &username) {
            info!("Rejected client due to duplicate username: {}", username);
            self.state
                .disconnect(self.index, self.generation, "Your username is already in use.")
                .await;
            return Ok(());
        }

        info!(
            "{} has joined the server using client version {}",
            username, handshake.version
        );

        let other_user = self
            .state
            .slots
            .ready_indices()
            .into_iter()
            .find(|&index| index != self.index)
            .and_then(|index| self.state.slots.get(index))
            .map(|other| other.username());
        let broadcaster = self.state.broadcaster();
        broadcaster.server_message(
            self.index,
            &occupancy_message(self.state.slots.active_count(), other_user.as_deref()),
        );
        broadcaster.server_message_to_all(
            &format!("User {} has joined the server.", username),
            Some(self.index),
        );
        Ok(())
    }

    async fn handle_text(&self, slot: &ClientSlot, text: &str) {
        let username = slot.username();

        if text.starts_with(COMMAND_SIGIL) {
            match text.trim_end() {
                "!list" => {
                    self.state.broadcaster().user_list(self.index);
                    return;
                }
                "!quit" => {
                    self.state
                        .disconnect(self.index, self.generation, "Requested quit")
                        .await;
                    return;
                }
                _ => {}
            }
        }

        let full_message = self.state.broadcaster().chat(self.index, &username, text);
        info!("{}", full_message);
    }

    fn handle_watch(&self, slot: &ClientSlot, name: &str) {
        if !slot.set_watch_player_name(name) || name.is_empty() || name == slot.username() {
            return;
        }

        let cached = self
            .state
            .slots
            .find_ready_by_username(name, Some(self.index), false)
            .and_then(|target| self.state.slots.get(target))
            .and_then(|target| target.screenshot());
        if let Some(bytes) = cached {
            debug!("Sending cached screenshot of {} to client #{}", name, self.index);
            self.state.broadcaster().send_screenshot(self.index, bytes);
        }
    }

    fn handle_screenshot(&self, slot: &ClientSlot, payload: &[u8]) {
        if payload.len() > MAX_SCREENSHOT_BYTES {
            warn!(
                "Client #{} shared a {} byte screenshot, limit is {}",
                self.index,
                payload.len(),
                MAX_SCREENSHOT_BYTES
            );
            return;
        }

        let username = slot.username();
        let bytes: Arc<[u8]> = Arc::from(payload);
        slot.set_screenshot(Arc::clone(&bytes));

        let announcement = format!("{} has shared a screenshot.", username);
        info!("{}", announcement);
        let broadcaster = self.state.broadcaster();
        broadcaster.text_message_to_all(&announcement, None);
        broadcaster.screenshot_to_watcher(self.index, &username, Arc::clone(&bytes));

        if let Some(sink) = self.state.screenshot_sink() {
            tokio::task::spawn_blocking(move || sink.save(&username, &bytes));
        }
    }
}

/// Flushes the slot's outgoing queue onto the socket until cancelled
pub async fn run_writer(state: Arc<ServerState>, index: usize, generation: u64, token: CancellationToken) {
    let Some(slot) = state.slots.get(index) else {
        return;
    };

    'outer: loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = slot.outgoing_ready() => {}
        }

        for message in slot.take_outgoing() {
            let sent = tokio::select! {
                biased;
                _ = token.cancelled() => break 'outer,
                sent = slot.send_direct(generation, message.kind, &message.payload) => sent,
            };
            if let Err(e) = sent {
                debug!("Client #{} send failed: {}", index, e);
                slot.mark_connection_lost(generation);
                break 'outer;
            }
        }
    }
    debug!("Client #{} writer stopped", index);
}

/// Starts the reader and writer tasks of a freshly claimed slot
pub fn spawn_session<R>(state: Arc<ServerState>, claim: SlotClaim, reader: R)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let faults = Arc::clone(state.faults());
    let index = claim.index;

    let writer = run_writer(
        Arc::clone(&state),
        index,
        claim.generation,
        claim.token.clone(),
    );
    spawn_worker(Arc::clone(&faults), &format!("writer-{}", index), async move {
        writer.await;
        Ok(())
    });

    let session = ClientSession::new(state, claim);
    spawn_worker(faults, &format!("session-{}", index), async move {
        session.run_reader(reader).await;
        Ok(())
    });
}
