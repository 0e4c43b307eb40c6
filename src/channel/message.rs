//! Messages and the registry holding them.

use crate::{
    channel::{report::ReportRecord, EncodingKey},
    Error, Result,
};
use parking_lot::RwLock;
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};
use tokio::sync::broadcast;

/// Identifies a sending device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Identifies a message of a device; senders number them from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(pub u32);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a message stands in its current round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RoundState {
    /// Created, no round run yet.
    #[default]
    Idle,
    /// Keys for the new window are being searched.
    Forging,
    /// Reports for every key are being fetched.
    Querying,
    /// Reports are committed and being decoded.
    Decoding,
    /// The last round ended without finding the end of the message.
    Continuing {
        /// Highest bit position recovered so far.
        next_start: u32,
    },
    /// The end of the message was found.
    Done,
    /// The last round failed; the message keeps its previous data.
    Failed(String),
    /// The last round was cancelled before committing.
    Cancelled,
}

impl RoundState {
    /// Returns `true` while a round is between forging and committing.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Forging | Self::Querying | Self::Decoding)
    }
}

/// A message being received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub(crate) device: DeviceId,
    pub(crate) id: MessageId,
    pub(crate) keys: Vec<EncodingKey>,
    pub(crate) reports: Vec<ReportRecord>,
    pub(crate) fetched_bits: u32,
    pub(crate) decoded: Option<String>,
    pub(crate) state: RoundState,
}

impl Message {
    /// Creates a message with no keys or reports.
    #[must_use]
    pub fn new(device: DeviceId, id: MessageId) -> Self {
        Self {
            device,
            id,
            keys: Vec::new(),
            reports: Vec::new(),
            fetched_bits: 0,
            decoded: None,
            state: RoundState::Idle,
        }
    }

    /// Device that sent the message.
    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Id of the message on its device.
    #[must_use]
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Keys forged so far, in discovery order.
    #[must_use]
    pub fn keys(&self) -> &[EncodingKey] {
        &self.keys
    }

    /// Reports accumulated over all rounds.
    #[must_use]
    pub fn reports(&self) -> &[ReportRecord] {
        &self.reports
    }

    /// Exclusive upper bound of the forged bit positions.
    #[must_use]
    pub fn fetched_bits(&self) -> u32 {
        self.fetched_bits
    }

    /// Text recovered by the latest decode, if any.
    #[must_use]
    pub fn decoded(&self) -> Option<&str> {
        self.decoded.as_deref()
    }

    /// Where the message stands in its round.
    #[must_use]
    pub fn state(&self) -> &RoundState {
        &self.state
    }

    pub(crate) fn with_state(&self, state: RoundState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }

    /// Appends reports, skipping exact copies of records already held.
    ///
    /// Returns the number of records added.
    pub(crate) fn merge_reports(&mut self, records: Vec<ReportRecord>) -> usize {
        let before = self.reports.len();
        let mut seen: HashSet<ReportRecord> = self.reports.iter().cloned().collect();
        for record in records {
            if seen.insert(record.clone()) {
                self.reports.push(record);
            }
        }
        self.reports.len() - before
    }
}

/// A change in a [`MessageStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    /// A message was inserted or reset.
    Created(MessageId),
    /// A message was replaced by a newer version.
    Updated(MessageId),
    /// Every message was removed.
    Cleared,
}

const EVENT_CAPACITY: usize = 256;

/// In-memory registry of messages, keyed by id.
///
/// Readers get [`Arc`] snapshots; every write swaps in a whole new message, so a snapshot
/// never mixes two versions. Writes for one message are serialized by the
/// [`Fetcher`][crate::channel::Fetcher] running its rounds.
#[derive(Debug)]
pub struct MessageStore {
    messages: RwLock<HashMap<MessageId, Arc<Message>>>,
    events: broadcast::Sender<StoreEvent>,
}

impl MessageStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            messages: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Inserts an empty message, replacing any message with the same id.
    pub fn create(&self, device: DeviceId, id: MessageId) -> Arc<Message> {
        let message = Arc::new(Message::new(device, id));
        self.messages.write().insert(id, Arc::clone(&message));
        self.notify(StoreEvent::Created(id));
        message
    }

    /// Returns a snapshot of message `id`.
    #[must_use]
    pub fn get(&self, id: MessageId) -> Option<Arc<Message>> {
        self.messages.read().get(&id).cloned()
    }

    /// Stores `message`, replacing the previous version.
    pub fn upsert(&self, message: Message) -> Arc<Message> {
        let id = message.id;
        let message = Arc::new(message);
        let created = self
            .messages
            .write()
            .insert(id, Arc::clone(&message))
            .is_none();

        self.notify(if created {
            StoreEvent::Created(id)
        } else {
            StoreEvent::Updated(id)
        });
        message
    }

    /// Replaces `current` with `next` unless the message was replaced or removed since
    /// `current` was read.
    pub(crate) fn swap(&self, current: &Arc<Message>, next: Message) -> Result<Arc<Message>> {
        let id = next.id;
        let next = Arc::new(next);
        {
            let mut messages = self.messages.write();
            match messages.get_mut(&id) {
                Some(slot) if Arc::ptr_eq(slot, current) => *slot = Arc::clone(&next),
                _ => return Err(Error::MessageNotFound(id)),
            }
        }

        self.notify(StoreEvent::Updated(id));
        Ok(next)
    }

    /// Removes every message.
    pub fn clear_all(&self) {
        self.messages.write().clear();
        self.notify(StoreEvent::Cleared);
    }

    /// Ids of all messages, ascending.
    #[must_use]
    pub fn ids(&self) -> Vec<MessageId> {
        let mut ids: Vec<_> = self.messages.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of messages held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    /// Returns `true` if no message is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }

    /// Subscribes to changes made after this call.
    ///
    /// Slow subscribers miss events rather than holding writers back.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: StoreEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE: DeviceId = DeviceId(0xDEAD_BEEF);

    #[test]
    fn create_replaces_existing_message() {
        let store = MessageStore::new();
        let mut message = Message::new(DEVICE, MessageId(0));
        message.fetched_bits = 64;
        message.decoded = Some("old".into());
        store.upsert(message);

        let fresh = store.create(DEVICE, MessageId(0));
        assert_eq!(fresh.fetched_bits(), 0);
        assert_eq!(store.get(MessageId(0)).unwrap().decoded(), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn snapshots_survive_updates() {
        let store = MessageStore::new();
        let before = store.create(DEVICE, MessageId(1));

        let mut next = (*before).clone();
        next.fetched_bits = 8;
        store.upsert(next);

        assert_eq!(before.fetched_bits(), 0);
        assert_eq!(store.get(MessageId(1)).unwrap().fetched_bits(), 8);
    }

    #[test]
    fn swap_refuses_stale_versions() {
        let store = MessageStore::new();
        let first = store.create(DEVICE, MessageId(5));

        let second = store
            .swap(&first, first.with_state(RoundState::Forging))
            .unwrap();
        assert_eq!(store.get(MessageId(5)).unwrap().state(), &RoundState::Forging);

        assert_eq!(
            store.swap(&first, first.with_state(RoundState::Done)),
            Err(Error::MessageNotFound(MessageId(5)))
        );

        store.clear_all();
        assert!(store.swap(&second, second.with_state(RoundState::Done)).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn clear_all_empties_registry() {
        let store = MessageStore::new();
        store.create(DEVICE, MessageId(2));
        store.create(DEVICE, MessageId(0));
        assert_eq!(store.ids(), [MessageId(0), MessageId(2)]);

        store.clear_all();
        assert!(store.is_empty());
        assert!(store.get(MessageId(0)).is_none());
    }

    #[test]
    fn subscribers_see_changes() {
        let store = MessageStore::new();
        let mut events = store.subscribe();

        let message = store.create(DEVICE, MessageId(4));
        store.upsert((*message).clone());
        store.clear_all();

        assert_eq!(events.try_recv().unwrap(), StoreEvent::Created(MessageId(4)));
        assert_eq!(events.try_recv().unwrap(), StoreEvent::Updated(MessageId(4)));
        assert_eq!(events.try_recv().unwrap(), StoreEvent::Cleared);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn duplicate_reports_are_merged_once() {
        let mut message = Message::new(DEVICE, MessageId(0));
        let record = ReportRecord::for_hash("a");

        assert_eq!(message.merge_reports(vec![record.clone(), record.clone()]), 1);
        assert_eq!(message.merge_reports(vec![record, ReportRecord::for_hash("b")]), 1);
        assert_eq!(message.reports().len(), 2);
    }

    #[test]
    fn only_mid_round_states_are_running() {
        let running = [RoundState::Forging, RoundState::Querying, RoundState::Decoding];
        assert!(running.iter().all(RoundState::is_running));

        let settled = [
            RoundState::Idle,
            RoundState::Continuing { next_start: 7 },
            RoundState::Done,
            RoundState::Failed("boom".into()),
            RoundState::Cancelled,
        ];
        assert!(!settled.iter().any(RoundState::is_running));
    }

    #[test]
    fn device_ids_print_as_hex() {
        assert_eq!(DEVICE.to_string(), "0xdeadbeef");
        assert_eq!(MessageId(3).to_string(), "#3");
    }
}
