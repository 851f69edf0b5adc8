//! Fixed-capacity client slots and their per-connection state
//!
//! This module handles the server-side bookkeeping for connections:
//! - Slot claiming for new connections and reclaiming after disconnects
//! - Liveness timestamps read by the timeout monitor
//! - Watch subscriptions and cached screenshots used for relaying
//! - Bounded outgoing queues flushed by each session's writer task
//!
//! Slots live in an array sized by the configured client limit and are
//! addressed by index. Every claim bumps the slot's generation so that work
//! started for one connection never touches the connection that later
//! reuses the same slot.

use log::{debug, info, warn};
use parking_lot::Mutex;
use shared::{BoundedQueue, OutgoingMessage, ServerMessageKind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Capacity of each slot's outgoing queue before the oldest entries drop
pub const OUTGOING_QUEUE_CAPACITY: usize = 512;

/// Write half of a client connection
pub type SlotWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Handshake progress and the timestamps the timeout monitor inspects
#[derive(Debug, Clone)]
pub struct Liveness {
    pub connection_start: Instant,
    pub last_message: Instant,
    pub received_handshake: bool,
    pub username: String,
}

impl Liveness {
    fn fresh(now: Instant) -> Self {
        Self {
            connection_start: now,
            last_message: now,
            received_handshake: false,
            username: "new user".to_string(),
        }
    }

    /// True once the peer has been silent for longer than `timeout`
    pub fn is_silent(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_message) > timeout
    }

    /// True when the peer never finished its handshake within `timeout`
    pub fn handshake_overdue(&self, now: Instant, timeout: Duration) -> bool {
        !self.received_handshake && now.saturating_duration_since(self.connection_start) > timeout
    }
}

/// Whom this client watches and the last screenshot it shared
#[derive(Debug, Clone, Default)]
pub struct WatchState {
    pub watch_player_name: String,
    pub screenshot: Option<Arc<[u8]>>,
}

#[derive(Debug)]
struct Lifecycle {
    can_be_replaced: bool,
    connected: bool,
    generation: u64,
    session: Option<CancellationToken>,
}

/// What a successful claim hands to the session tasks
#[derive(Debug, Clone)]
pub struct SlotClaim {
    pub index: usize,
    pub generation: u64,
    pub token: CancellationToken,
}

/// Returned by a claim against a full table, carrying the unused writer
pub struct TableFull(pub SlotWriter);

impl std::fmt::Debug for TableFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TableFull")
    }
}

/// State returned when a slot is released back to the free pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reclaimed {
    pub username: String,
    pub received_handshake: bool,
}

/// One connection's lifetime within the fixed slot array
///
/// The write half, the liveness group, and the watch group are guarded
/// separately so that sends, timeout sweeps and screenshot relays never
/// serialize one another.
pub struct ClientSlot {
    index: usize,
    writer: tokio::sync::Mutex<Option<SlotWriter>>,
    lifecycle: Mutex<Lifecycle>,
    liveness: Mutex<Liveness>,
    watch: Mutex<WatchState>,
    outgoing: Mutex<BoundedQueue<OutgoingMessage>>,
    outgoing_ready: Notify,
}

impl ClientSlot {
    fn new(index: usize, now: Instant) -> Self {
        Self {
            index,
            writer: tokio::sync::Mutex::new(None),
            lifecycle: Mutex::new(Lifecycle {
                can_be_replaced: true,
                connected: false,
                generation: 0,
                session: None,
            }),
            liveness: Mutex::new(Liveness::fresh(now)),
            watch: Mutex::new(WatchState::default()),
            outgoing: Mutex::new(BoundedQueue::new(OUTGOING_QUEUE_CAPACITY)),
            outgoing_ready: Notify::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> u64 {
        self.lifecycle.lock().generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.lifecycle.lock().generation == generation
    }

    /// Socket present and not known to be closed
    pub fn is_valid(&self) -> bool {
        self.lifecycle.lock().connected
    }

    /// Valid and past the handshake
    pub fn is_ready(&self) -> bool {
        self.is_valid() && self.liveness.lock().received_handshake
    }

    pub fn can_be_replaced(&self) -> bool {
        self.lifecycle.lock().can_be_replaced
    }

    pub fn username(&self) -> String {
        self.liveness.lock().username.clone()
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness.lock().clone()
    }

    pub fn touch(&self, now: Instant) {
        self.liveness.lock().last_message = now;
    }

    pub fn complete_handshake(&self, username: &str) {
        let mut liveness = self.liveness.lock();
        liveness.username = username.to_string();
        liveness.received_handshake = true;
    }

    /// Records that the transport failed underneath the session
    ///
    /// The slot stays claimed; the timeout monitor reclaims it.
    pub fn mark_connection_lost(&self, generation: u64) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.generation == generation && lifecycle.connected {
            lifecycle.connected = false;
            debug!("Slot {} lost its connection", self.index);
        }
    }

    pub fn enqueue(&self, message: OutgoingMessage) {
        if let Some(dropped) = self.outgoing.lock().push(message) {
            debug!(
                "Slot {} outgoing queue full, dropped {:?}",
                self.index, dropped.kind
            );
        }
        self.outgoing_ready.notify_one();
    }

    pub fn take_outgoing(&self) -> Vec<OutgoingMessage> {
        self.outgoing.lock().drain()
    }

    pub fn outgoing_len(&self) -> usize {
        self.outgoing.lock().len()
    }

    /// Resolves once something has been enqueued since the last drain
    pub async fn outgoing_ready(&self) {
        self.outgoing_ready.notified().await
    }

    pub fn watch_player_name(&self) -> String {
        self.watch.lock().watch_player_name.clone()
    }

    /// Stores the watch target, returning whether it changed
    pub fn set_watch_player_name(&self, name: &str) -> bool {
        let mut watch = self.watch.lock();
        if watch.watch_player_name == name {
            return false;
        }
        watch.watch_player_name = name.to_string();
        true
    }

    pub fn is_watching(&self, username: &str) -> bool {
        self.watch.lock().watch_player_name == username
    }

    pub fn screenshot(&self) -> Option<Arc<[u8]>> {
        self.watch.lock().screenshot.clone()
    }

    pub fn set_screenshot(&self, bytes: Arc<[u8]>) {
        self.watch.lock().screenshot = Some(bytes);
    }

    /// Writes one frame straight to the socket, bypassing the queue
    pub async fn send_direct(
        &self,
        generation: u64,
        kind: ServerMessageKind,
        payload: &[u8],
    ) -> Result<(), shared::ProtocolError> {
        let mut writer = self.writer.lock().await;
        if !self.is_current(generation) {
            return Ok(());
        }
        match writer.as_mut() {
            Some(w) => shared::write_frame(w, kind, payload).await,
            None => Err(shared::ProtocolError::ConnectionClosed),
        }
    }

    /// Stops the session, tells the peer why (best effort), and closes the socket
    pub async fn close(&self, generation: u64, reason: &str, send_timeout: Duration) {
        let token = {
            let lifecycle = self.lifecycle.lock();
            if lifecycle.generation != generation {
                return;
            }
            lifecycle.session.clone()
        };
        if let Some(token) = token {
            token.cancel();
        }

        let Ok(mut writer) = tokio::time::timeout(send_timeout, self.writer.lock()).await else {
            warn!("Slot {}: write path still busy, closing without notice", self.index);
            self.mark_connection_lost(generation);
            return;
        };
        if !self.is_current(generation) {
            return;
        }

        if let Some(mut w) = writer.take() {
            if self.is_valid() {
                let payload = shared::payload::encode_text(reason);
                let send = shared::write_frame(&mut w, ServerMessageKind::ConnectionEnd, &payload);
                match tokio::time::timeout(send_timeout, send).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("Slot {}: disconnect notice not sent: {}", self.index, e),
                    Err(_) => debug!("Slot {}: disconnect notice timed out", self.index),
                }
            }
            let _ = tokio::time::timeout(send_timeout, w.shutdown()).await;
        }

        self.lifecycle.lock().connected = false;
    }

    /// Returns the slot to the free pool; `None` if it was already free
    fn reclaim(&self, generation: u64) -> Option<Reclaimed> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.generation != generation || lifecycle.can_be_replaced {
                return None;
            }
            lifecycle.can_be_replaced = true;
            lifecycle.connected = false;
            lifecycle.session = None;
        }

        {
            let mut watch = self.watch.lock();
            watch.screenshot = None;
            watch.watch_player_name.clear();
        }
        self.outgoing.lock().clear();

        let mut liveness = self.liveness.lock();
        let reclaimed = Reclaimed {
            username: liveness.username.clone(),
            received_handshake: liveness.received_handshake,
        };
        liveness.received_handshake = false;
        Some(reclaimed)
    }
}

/// Fixed-size array of client slots plus the connected-client counter
///
/// The table never grows: its capacity is the configured client limit
/// for the lifetime of the server.
pub struct SlotTable {
    slots: Vec<ClientSlot>,
    active: AtomicUsize,
    admission: Mutex<()>,
}

impl SlotTable {
    pub fn new(capacity: usize) -> Self {
        let now = Instant::now();
        Self {
            slots: (0..capacity).map(|i| ClientSlot::new(i, now)).collect(),
            active: AtomicUsize::new(0),
            admission: Mutex::new(()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of claimed slots, ready or still handshaking
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn get(&self, index: usize) -> Option<&ClientSlot> {
        self.slots.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientSlot> {
        self.slots.iter()
    }

    /// Claims the first free slot for a new connection
    ///
    /// When every slot is taken nothing is mutated and the writer is handed
    /// back so the caller can refuse the connection on it.
    pub async fn claim(
        &self,
        writer: SlotWriter,
        now: Instant,
        parent: &CancellationToken,
    ) -> Result<SlotClaim, TableFull> {
        let claim = self.slots.iter().find_map(|slot| {
            let mut lifecycle = slot.lifecycle.lock();
            if !lifecycle.can_be_replaced || lifecycle.connected {
                return None;
            }

            *slot.liveness.lock() = Liveness::fresh(now);
            *slot.watch.lock() = WatchState::default();
            slot.outgoing.lock().clear();

            let token = parent.child_token();
            lifecycle.can_be_replaced = false;
            lifecycle.connected = true;
            lifecycle.generation += 1;
            lifecycle.session = Some(token.clone());

            Some(SlotClaim {
                index: slot.index,
                generation: lifecycle.generation,
                token,
            })
        });
        let Some(claim) = claim else {
            return Err(TableFull(writer));
        };

        let slot = &self.slots[claim.index];
        *slot.writer.lock().await = Some(writer);

        self.active.fetch_add(1, Ordering::SeqCst);
        info!("Claimed slot {} (generation {})", claim.index, claim.generation);
        Ok(claim)
    }

    /// Releases a closed slot, adjusting the connected-client count once
    pub fn reclaim(&self, index: usize, generation: u64) -> Option<Reclaimed> {
        let reclaimed = self.slots.get(index)?.reclaim(generation)?;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Some(reclaimed)
    }

    /// Indices of slots that completed the handshake
    pub fn ready_indices(&self) -> Vec<usize> {
        self.slots
            .iter()
            .filter(|slot| slot.is_ready())
            .map(|slot| slot.index)
            .collect()
    }

    /// Usernames of every ready slot, in slot order
    pub fn ready_usernames(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter(|slot| slot.is_ready())
            .map(|slot| slot.username())
            .collect()
    }

    /// First ready slot other than `exclude` whose name matches
    pub fn find_ready_by_username(
        &self,
        username: &str,
        exclude: Option<usize>,
        case_insensitive: bool,
    ) -> Option<usize> {
        self.slots
            .iter()
            .filter(|slot| Some(slot.index) != exclude && slot.is_ready())
            .find(|slot| {
                let name = slot.username();
                if case_insensitive {
                    name.to_lowercase() == username.to_lowercase()
                } else {
                    name == username
                }
            })
            .map(|slot| slot.index)
    }

    /// Completes the handshake of `index` under `username`
    ///
    /// Refused when another ready slot already uses the name, ignoring case.
    /// Admissions are serialized so two racing handshakes cannot both win.
    pub fn admit(&self, index: usize, generation: u64, username: &str) -> bool {
        let _admission = self.admission.lock();
        if self.find_ready_by_username(username, Some(index), true).is_some() {
            return false;
        }
        match self.slots.get(index) {
            Some(slot) if slot.is_current(generation) => {
                slot.complete_handshake(username);
                true
            }
            _ => false,
        }
    }

    /// Stops every session and closes the sockets
    ///
    /// A write path still busy after `lock_timeout` is left to its
    /// cancelled writer task.
    pub async fn close_all(&self, lock_timeout: Duration) {
        for slot in &self.slots {
            let mut lifecycle = slot.lifecycle.lock();
            if let Some(token) = lifecycle.session.take() {
                token.cancel();
            }
            lifecycle.connected = false;
        }

        for slot in &self.slots {
            match tokio::time::timeout(lock_timeout, slot.writer.lock()).await {
                Ok(mut writer) => {
                    if let Some(mut w) = writer.take() {
                        let _ = tokio::time::timeout(lock_timeout, w.shutdown()).await;
                    }
                }
                Err(_) => warn!("Slot {}: write path still busy at shutdown", slot.index),
            }
        }
    }
}
