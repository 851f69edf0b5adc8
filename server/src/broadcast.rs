//! Routing rules deciding which slots receive an inbound message
//!
//! | Inbound              | Recipients                    | Sender excluded |
//! |----------------------|-------------------------------|-----------------|
//! | state update         | every ready slot              | unless enabled  |
//! | chat text            | every ready slot              | yes             |
//! | server notice        | every ready slot, or one slot | n/a             |
//! | screenshot           | the one slot watching sender  | n/a             |
//! | settings             | every valid slot              | no              |
//!
//! Delivery only enqueues onto each recipient's outgoing queue; the
//! recipient's writer task puts it on the wire. Each queue is updated on its
//! own, so a broadcast is not atomic across recipients.

use crate::slot::SlotTable;
use log::debug;
use shared::{
    OutgoingMessage, ProtocolError, ServerHandshake, ServerMessageKind, SettingsPayload,
    NET_PROTOCOL_VERSION, PROGRAM_VERSION,
};
use std::sync::Arc;

pub struct Broadcaster<'a> {
    slots: &'a SlotTable,
}

impl<'a> Broadcaster<'a> {
    pub fn new(slots: &'a SlotTable) -> Self {
        Self { slots }
    }

    fn enqueue(&self, index: usize, message: OutgoingMessage) {
        if let Some(slot) = self.slots.get(index) {
            slot.enqueue(message);
        }
    }

    /// Enqueues on every ready slot except `exclude`, returning the recipient count
    fn to_ready(&self, message: &OutgoingMessage, exclude: Option<usize>) -> usize {
        let mut recipients = 0;
        for slot in self.slots.iter() {
            if Some(slot.index()) != exclude && slot.is_ready() {
                slot.enqueue(message.clone());
                recipients += 1;
            }
        }
        recipients
    }

    pub fn handshake(&self, index: usize) {
        let payload = ServerHandshake {
            protocol_version: NET_PROTOCOL_VERSION,
            version: PROGRAM_VERSION.to_string(),
        }
        .encode();
        self.enqueue(index, OutgoingMessage::new(ServerMessageKind::Handshake, payload));
    }

    pub fn server_message(&self, index: usize, text: &str) {
        self.enqueue(index, OutgoingMessage::text(ServerMessageKind::ServerMessage, text));
    }

    pub fn server_message_to_all(&self, text: &str, exclude: Option<usize>) -> usize {
        let message = OutgoingMessage::text(ServerMessageKind::ServerMessage, text);
        self.to_ready(&message, exclude)
    }

    pub fn text_message_to_all(&self, text: &str, exclude: Option<usize>) -> usize {
        let message = OutgoingMessage::text(ServerMessageKind::TextMessage, text);
        self.to_ready(&message, exclude)
    }

    /// Forwards a chat line as `[username] text` to every other ready slot
    pub fn chat(&self, sender: usize, username: &str, text: &str) -> String {
        let full_message = format!("[{}] {}", username, text);
        self.text_message_to_all(&full_message, Some(sender));
        full_message
    }

    /// Relays a state update verbatim to the other ready slots
    pub fn relay_state_update(&self, sender: usize, payload: &[u8], include_sender: bool) -> usize {
        let message = OutgoingMessage::new(ServerMessageKind::StateUpdate, payload);
        let exclude = if include_sender { None } else { Some(sender) };
        let recipients = self.to_ready(&message, exclude);
        debug!(
            "Relayed {} byte update from slot {} to {} slots",
            payload.len(),
            sender,
            recipients
        );
        recipients
    }

    pub fn send_screenshot(&self, index: usize, bytes: Arc<[u8]>) {
        self.enqueue(index, OutgoingMessage::new(ServerMessageKind::ScreenshotShare, bytes));
    }

    /// Hands a screenshot to the first other ready slot watching `username`
    pub fn screenshot_to_watcher(
        &self,
        sender: usize,
        username: &str,
        bytes: Arc<[u8]>,
    ) -> Option<usize> {
        let watcher = self
            .slots
            .iter()
            .filter(|slot| slot.index() != sender && slot.is_ready())
            .find(|slot| slot.is_watching(username))
            .map(|slot| slot.index())?;

        self.send_screenshot(watcher, bytes);
        Some(watcher)
    }

    /// Pushes the settings to every valid slot, handshaken or not
    pub fn settings_to_all(&self, settings: &SettingsPayload) -> Result<usize, ProtocolError> {
        let message = OutgoingMessage::new(ServerMessageKind::Settings, settings.encode()?);
        let mut recipients = 0;
        for slot in self.slots.iter().filter(|slot| slot.is_valid()) {
            slot.enqueue(message.clone());
            recipients += 1;
        }
        Ok(recipients)
    }

    /// Reply to `!list`: every ready username on its own line
    pub fn user_list(&self, index: usize) {
        let mut text = String::from("Connected users:\n");
        for name in self.slots.ready_usernames() {
            text.push_str(&name);
            text.push('\n');
        }
        self.server_message(index, &text);
    }
}

/// Decodes the text carried by a queued message
pub fn message_text(message: &OutgoingMessage) -> String {
    shared::payload::decode_text(&message.payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::SlotWriter;
    use std::time::Instant;
    use tokio::io::sink;
    use tokio_util::sync::CancellationToken;

    async fn table_with(names: &[Option<&str>]) -> SlotTable {
        let table = SlotTable::new(names.len() + 1);
        let root = CancellationToken::new();
        for name in names {
            let writer: SlotWriter = Box::new(sink());
            let claim = table.claim(writer, Instant::now(), &root).await.unwrap();
            if let Some(name) = name {
                table.get(claim.index).unwrap().complete_handshake(name);
            }
        }
        table
    }

    fn kinds(table: &SlotTable, index: usize) -> Vec<ServerMessageKind> {
        table
            .get(index)
            .unwrap()
            .take_outgoing()
            .into_iter()
            .map(|m| m.kind)
            .collect()
    }

    #[tokio::test]
    async fn test_state_update_skips_sender() {
        let table = table_with(&[Some("alice"), Some("bob"), Some("carol"), None]).await;
        let broadcaster = Broadcaster::new(&table);

        let recipients = broadcaster.relay_state_update(0, b"vessel", false);
        assert_eq!(recipients, 2);

        assert!(kinds(&table, 0).is_empty());
        assert_eq!(kinds(&table, 1), vec![ServerMessageKind::StateUpdate]);
        assert_eq!(kinds(&table, 2), vec![ServerMessageKind::StateUpdate]);
        // Not yet handshaken
        assert!(kinds(&table, 3).is_empty());
    }

    #[tokio::test]
    async fn test_state_update_payload_verbatim() {
        let table = table_with(&[Some("alice"), Some("bob")]).await;
        Broadcaster::new(&table).relay_state_update(1, &[0, 1, 2, 255], false);

        let queued = table.get(0).unwrap().take_outgoing();
        assert_eq!(&*queued[0].payload, &[0, 1, 2, 255]);
    }

    #[tokio::test]
    async fn test_state_update_echo_when_enabled() {
        let table = table_with(&[Some("alice"), Some("bob")]).await;
        let recipients = Broadcaster::new(&table).relay_state_update(0, b"x", true);

        assert_eq!(recipients, 2);
        assert_eq!(kinds(&table, 0), vec![ServerMessageKind::StateUpdate]);
    }

    #[tokio::test]
    async fn test_chat_prefixed_and_excludes_sender() {
        let table = table_with(&[Some("alice"), Some("bob")]).await;
        let full = Broadcaster::new(&table).chat(0, "alice", "hello");

        assert_eq!(full, "[alice] hello");
        assert!(table.get(0).unwrap().take_outgoing().is_empty());

        let queued = table.get(1).unwrap().take_outgoing();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].kind, ServerMessageKind::TextMessage);
        assert_eq!(message_text(&queued[0]), "[alice] hello");
    }

    #[tokio::test]
    async fn test_screenshot_goes_to_single_watcher() {
        let table = table_with(&[Some("alice"), Some("bob"), Some("carol")]).await;
        table.get(1).unwrap().set_watch_player_name("alice");

        let bytes: Arc<[u8]> = Arc::from(vec![9u8; 16]);
        let watcher = Broadcaster::new(&table).screenshot_to_watcher(0, "alice", bytes);

        assert_eq!(watcher, Some(1));
        assert_eq!(kinds(&table, 1), vec![ServerMessageKind::ScreenshotShare]);
        assert!(kinds(&table, 0).is_empty());
        assert!(kinds(&table, 2).is_empty());
    }

    #[tokio::test]
    async fn test_screenshot_without_watcher() {
        let table = table_with(&[Some("alice"), Some("bob")]).await;
        let bytes: Arc<[u8]> = Arc::from(vec![1u8]);
        assert_eq!(
            Broadcaster::new(&table).screenshot_to_watcher(0, "alice", bytes),
            None
        );
    }

    #[tokio::test]
    async fn test_settings_reach_unhandshaken_slots() {
        let table = table_with(&[Some("alice"), None]).await;
        let payload = SettingsPayload {
            update_interval: 250,
            max_queued_updates: 2,
            screenshot_interval: 3000,
        };

        let recipients = Broadcaster::new(&table).settings_to_all(&payload).unwrap();
        assert_eq!(recipients, 2);

        let queued = table.get(1).unwrap().take_outgoing();
        assert_eq!(queued[0].kind, ServerMessageKind::Settings);
        assert_eq!(SettingsPayload::decode(&queued[0].payload).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_user_list() {
        let table = table_with(&[Some("alice"), Some("bob"), None]).await;
        Broadcaster::new(&table).user_list(0);

        let queued = table.get(0).unwrap().take_outgoing();
        assert_eq!(queued[0].kind, ServerMessageKind::ServerMessage);
        assert_eq!(message_text(&queued[0]), "Connected users:\nalice\nbob\n");
    }

    #[tokio::test]
    async fn test_handshake_payload() {
        let table = table_with(&[None]).await;
        Broadcaster::new(&table).handshake(0);

        let queued = table.get(0).unwrap().take_outgoing();
        let handshake = ServerHandshake::decode(&queued[0].payload).unwrap();
        assert_eq!(handshake.protocol_version, NET_PROTOCOL_VERSION);
        assert_eq!(handshake.version, PROGRAM_VERSION);
    }
}
