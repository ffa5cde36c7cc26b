//! In-process broker with the semantics the operations layer depends on:
//! per-entity sequence numbers, peek-lock receives, sessions with exclusive
//! locks, dead-letter sub-queues and topic fan-out to subscriptions.
//!
//! Faults can be injected to exercise partial failures and retry paths.

use super::{MessageReceiver, MessageSender, ServiceBusBackend, SessionReceiver};
use crate::common::{ServiceBusError, ServiceBusResult};
use crate::model::{
    EntityAddress, EntityDescriptor, EntityKind, MessageRecord, MessageState, OutgoingMessage,
};
use crate::operations::directory::EntityDirectory;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

const DEFAULT_TTL: Duration = Duration::from_secs(14 * 24 * 60 * 60);
const LOCK_DURATION: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct Stored {
    record: MessageRecord,
    lock_owner: Option<u64>,
}

#[derive(Debug, Default)]
struct Store {
    requires_session: bool,
    main: BTreeMap<i64, Stored>,
    dead_letter: BTreeMap<i64, Stored>,
    locked_sessions: HashMap<String, u64>,
}

impl Store {
    fn queue(&self, dead_letter: bool) -> &BTreeMap<i64, Stored> {
        if dead_letter { &self.dead_letter } else { &self.main }
    }

    fn queue_mut(&mut self, dead_letter: bool) -> &mut BTreeMap<i64, Stored> {
        if dead_letter {
            &mut self.dead_letter
        } else {
            &mut self.main
        }
    }

    fn descriptor(&self, name: &str, kind: EntityKind, parent: Option<&str>) -> EntityDescriptor {
        EntityDescriptor {
            name: name.to_string(),
            kind,
            parent_topic: parent.map(str::to_string),
            requires_session: self.requires_session,
            active_count: self.main.len() as i64,
            dead_letter_count: self.dead_letter.len() as i64,
            scheduled_count: 0,
            size_bytes: self
                .main
                .values()
                .chain(self.dead_letter.values())
                .map(|m| m.record.body.len() as i64)
                .sum(),
            default_ttl: Some(DEFAULT_TTL),
            lock_duration: Some(LOCK_DURATION),
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    failing_message_ids: HashSet<String>,
    failing_completions: HashSet<i64>,
    failing_peeks: u32,
    peek_error: Option<ServiceBusError>,
    peek_delay: Option<Duration>,
    failing_listings: bool,
}

#[derive(Debug, Default)]
struct BrokerState {
    /// Keyed by the main path of a queue or subscription
    stores: HashMap<String, Store>,
    queues: BTreeSet<String>,
    /// Topic name to its subscription names
    topics: BTreeMap<String, BTreeSet<String>>,
    /// Next sequence number per queue or topic
    sequences: HashMap<String, i64>,
    faults: Faults,
    completed: u64,
    abandoned: u64,
}

impl BrokerState {
    fn store(&self, key: &str) -> ServiceBusResult<&Store> {
        self.stores
            .get(key)
            .ok_or_else(|| ServiceBusError::EntityNotFound(key.to_string()))
    }

    fn store_mut(&mut self, key: &str) -> ServiceBusResult<&mut Store> {
        self.stores
            .get_mut(key)
            .ok_or_else(|| ServiceBusError::EntityNotFound(key.to_string()))
    }

    fn next_sequence(&mut self, entity: &str) -> i64 {
        let next = self.sequences.entry(entity.to_string()).or_insert(1);
        let current = *next;
        *next += 1;
        current
    }

    fn enqueue(&mut self, entity: &str, message: &OutgoingMessage) -> ServiceBusResult<i64> {
        let targets: Vec<String> = if self.queues.contains(entity) {
            vec![entity.to_string()]
        } else if let Some(subscriptions) = self.topics.get(entity) {
            subscriptions
                .iter()
                .map(|sub| EntityAddress::subscription(entity, sub.clone()).path())
                .collect()
        } else {
            return Err(ServiceBusError::transport(
                "send",
                entity,
                "messaging entity could not be found",
            ));
        };

        for key in &targets {
            let store = self.store(key)?;
            if store.requires_session && message.session_id.is_none() {
                return Err(ServiceBusError::transport(
                    "send",
                    entity,
                    "session-enabled entity requires a session id",
                ));
            }
        }

        let sequence = self.next_sequence(entity);
        let record = record_from_outgoing(message, sequence);
        for key in targets {
            let store = self.store_mut(&key)?;
            store.main.insert(
                sequence,
                Stored {
                    record: record.clone(),
                    lock_owner: None,
                },
            );
        }
        Ok(sequence)
    }
}

fn record_from_outgoing(message: &OutgoingMessage, sequence: i64) -> MessageRecord {
    let now = Utc::now();
    MessageRecord {
        message_id: message.message_id.clone(),
        correlation_id: message.correlation_id.clone(),
        content_type: message.content_type.clone(),
        body: message.body.clone(),
        enqueued_time: Some(now),
        scheduled_enqueue_time: message.scheduled_enqueue_time,
        sequence_number: sequence,
        delivery_count: 0,
        session_id: message.session_id.clone(),
        properties: message.properties.clone(),
        subject: message.subject.clone(),
        to: message.to.clone(),
        reply_to: message.reply_to.clone(),
        reply_to_session_id: message.reply_to_session_id.clone(),
        partition_key: message.partition_key.clone(),
        time_to_live: message.time_to_live,
        expires_at: message
            .time_to_live
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| now.checked_add_signed(ttl)),
        lock_token: None,
        locked_until: None,
        dead_letter_source: None,
        dead_letter_reason: None,
        dead_letter_error_description: None,
        state: MessageState::Active,
    }
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-process broker.
///
/// Cloning is cheap and every clone shares the same state, so a test can hold
/// one handle for assertions while the operations layer owns another.
///
/// # Examples
///
/// ```no_run
/// use server::broker::InMemoryBroker;
/// use server::model::OutgoingMessage;
///
/// let broker = InMemoryBroker::new();
/// broker.create_queue("orders", false);
/// broker.enqueue("orders", OutgoingMessage::text("hello")).unwrap();
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    next_receiver_id: Arc<AtomicU64>,
    receive_wait: Duration,
    endpoint: String,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            next_receiver_id: Arc::new(AtomicU64::new(1)),
            receive_wait: Duration::from_millis(20),
            endpoint: "sb://in-memory.servicebus.windows.net/".to_string(),
        }
    }

    /// Caps how long an empty receive waits, regardless of the requested window.
    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn create_queue(&self, name: &str, requires_session: bool) {
        let mut state = lock(&self.state);
        state.queues.insert(name.to_string());
        state.stores.insert(
            name.to_string(),
            Store {
                requires_session,
                ..Default::default()
            },
        );
    }

    pub fn create_topic(&self, name: &str) {
        lock(&self.state)
            .topics
            .entry(name.to_string())
            .or_default();
    }

    pub fn create_subscription(
        &self,
        topic: &str,
        subscription: &str,
        requires_session: bool,
    ) -> ServiceBusResult<()> {
        let mut state = lock(&self.state);
        let subscriptions = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| ServiceBusError::EntityNotFound(topic.to_string()))?;
        subscriptions.insert(subscription.to_string());
        state.stores.insert(
            EntityAddress::subscription(topic, subscription).path(),
            Store {
                requires_session,
                ..Default::default()
            },
        );
        Ok(())
    }

    /// Sets the sequence number the next message sent to `entity` receives.
    pub fn set_next_sequence(&self, entity: &str, sequence: i64) {
        lock(&self.state)
            .sequences
            .insert(entity.to_string(), sequence);
    }

    /// Sends one message directly, bypassing senders. Returns its sequence number.
    pub fn enqueue(&self, entity: &str, message: OutgoingMessage) -> ServiceBusResult<i64> {
        lock(&self.state).enqueue(entity, &message)
    }

    /// Moves a message from the main queue of `address` to its dead-letter sub-queue.
    pub fn dead_letter(
        &self,
        address: &EntityAddress,
        sequence_number: i64,
        reason: &str,
    ) -> ServiceBusResult<()> {
        let mut state = lock(&self.state);
        let store = state.store_mut(&address.main().path())?;
        let mut stored = store
            .main
            .remove(&sequence_number)
            .ok_or_else(|| ServiceBusError::EntityNotFound(format!("message {sequence_number}")))?;
        stored.lock_owner = None;
        stored.record.dead_letter_reason = Some(reason.to_string());
        stored.record.dead_letter_source = Some(address.main().path());
        store.dead_letter.insert(sequence_number, stored);
        Ok(())
    }

    pub fn message_count(&self, address: &EntityAddress) -> usize {
        let state = lock(&self.state);
        state
            .store(&address.main().path())
            .map(|store| store.queue(address.dead_letter).len())
            .unwrap_or(0)
    }

    pub fn sequence_numbers(&self, address: &EntityAddress) -> Vec<i64> {
        let state = lock(&self.state);
        state
            .store(&address.main().path())
            .map(|store| store.queue(address.dead_letter).keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn messages(&self, address: &EntityAddress) -> Vec<MessageRecord> {
        let state = lock(&self.state);
        state
            .store(&address.main().path())
            .map(|store| {
                store
                    .queue(address.dead_letter)
                    .values()
                    .map(|m| m.record.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Messages currently locked by some receiver.
    pub fn locked_count(&self, address: &EntityAddress) -> usize {
        let state = lock(&self.state);
        state
            .store(&address.main().path())
            .map(|store| {
                store
                    .queue(address.dead_letter)
                    .values()
                    .filter(|m| m.lock_owner.is_some())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Sessions currently held by a session receiver.
    pub fn locked_session_count(&self, address: &EntityAddress) -> usize {
        let state = lock(&self.state);
        state
            .store(&address.main().path())
            .map(|store| store.locked_sessions.len())
            .unwrap_or(0)
    }

    /// Total completions performed across all entities.
    pub fn completed_count(&self) -> u64 {
        lock(&self.state).completed
    }

    pub fn abandoned_count(&self) -> u64 {
        lock(&self.state).abandoned
    }

    /// Every send of a batch containing this message id fails.
    pub fn fail_message_id(&self, message_id: &str) {
        lock(&self.state)
            .faults
            .failing_message_ids
            .insert(message_id.to_string());
    }

    /// Completing this sequence number fails even when the lock is held.
    pub fn fail_completion(&self, sequence_number: i64) {
        lock(&self.state)
            .faults
            .failing_completions
            .insert(sequence_number);
    }

    /// The next `count` peeks on any entity fail with a transport error.
    pub fn fail_next_peeks(&self, count: u32) {
        let mut state = lock(&self.state);
        state.faults.failing_peeks = count;
        state.faults.peek_error = None;
    }

    /// Like [`fail_next_peeks`](Self::fail_next_peeks), failing with `error`.
    pub fn fail_next_peeks_with(&self, count: u32, error: ServiceBusError) {
        let mut state = lock(&self.state);
        state.faults.failing_peeks = count;
        state.faults.peek_error = Some(error);
    }

    /// Every peek sleeps for `delay` before touching the store.
    pub fn set_peek_delay(&self, delay: Option<Duration>) {
        lock(&self.state).faults.peek_delay = delay;
    }

    pub fn fail_listings(&self, fail: bool) {
        lock(&self.state).faults.failing_listings = fail;
    }

    fn next_id(&self) -> u64 {
        self.next_receiver_id.fetch_add(1, Ordering::Relaxed)
    }

    fn receiver(&self, address: &EntityAddress, session: Option<String>) -> InMemoryReceiver {
        InMemoryReceiver {
            state: self.state.clone(),
            key: address.main().path(),
            dead_letter: address.dead_letter,
            id: self.next_id(),
            session,
            held: HashSet::new(),
            receive_wait: self.receive_wait,
            closed: false,
        }
    }
}

#[async_trait]
impl ServiceBusBackend for InMemoryBroker {
    async fn create_receiver(
        &self,
        address: &EntityAddress,
    ) -> ServiceBusResult<Box<dyn MessageReceiver>> {
        {
            let state = lock(&self.state);
            if address.subscription.is_none() && state.topics.contains_key(&address.entity) {
                return Err(ServiceBusError::InvalidEntityPath(format!(
                    "{} is a topic; receive from one of its subscriptions",
                    address.entity
                )));
            }
            state.store(&address.main().path())?;
        }
        Ok(Box::new(self.receiver(address, None)))
    }

    async fn accept_next_session(
        &self,
        address: &EntityAddress,
    ) -> ServiceBusResult<Box<dyn SessionReceiver>> {
        let key = address.main().path();
        let id = self.next_id();
        let session_id = {
            let mut state = lock(&self.state);
            let store = state.store_mut(&key)?;
            if !store.requires_session {
                return Err(ServiceBusError::transport(
                    "accept session",
                    &key,
                    "entity is not session-enabled",
                ));
            }
            let available: BTreeSet<String> = store
                .queue(address.dead_letter)
                .values()
                .filter_map(|m| m.record.session_id.clone())
                .filter(|session| !store.locked_sessions.contains_key(session))
                .collect();
            let Some(session_id) = available.into_iter().next() else {
                return Err(ServiceBusError::TransientTimeout(format!(
                    "no sessions available on {key}"
                )));
            };
            store.locked_sessions.insert(session_id.clone(), id);
            session_id
        };

        let mut inner = self.receiver(address, Some(session_id.clone()));
        inner.id = id;
        Ok(Box::new(InMemorySessionReceiver { inner, session_id }))
    }

    async fn create_sender(&self, entity: &str) -> ServiceBusResult<Box<dyn MessageSender>> {
        {
            let state = lock(&self.state);
            if !state.queues.contains(entity) && !state.topics.contains_key(entity) {
                return Err(ServiceBusError::transport(
                    "create sender",
                    entity,
                    "messaging entity could not be found",
                ));
            }
        }
        Ok(Box::new(InMemorySender {
            state: self.state.clone(),
            entity: entity.to_string(),
            closed: false,
        }))
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn close(&self) -> ServiceBusResult<()> {
        Ok(())
    }
}

#[async_trait]
impl EntityDirectory for InMemoryBroker {
    async fn list_queues(&self) -> ServiceBusResult<Vec<EntityDescriptor>> {
        let state = lock(&self.state);
        if state.faults.failing_listings {
            return Err(ServiceBusError::transport("list queues", &self.endpoint, "unauthorized"));
        }
        state
            .queues
            .iter()
            .map(|name| Ok(state.store(name)?.descriptor(name, EntityKind::Queue, None)))
            .collect()
    }

    async fn list_topics(&self) -> ServiceBusResult<Vec<EntityDescriptor>> {
        let state = lock(&self.state);
        if state.faults.failing_listings {
            return Err(ServiceBusError::transport("list topics", &self.endpoint, "unauthorized"));
        }
        Ok(state
            .topics
            .keys()
            .map(|name| EntityDescriptor::named(name.clone(), EntityKind::Topic))
            .collect())
    }

    async fn list_subscriptions(&self, topic: &str) -> ServiceBusResult<Vec<EntityDescriptor>> {
        let state = lock(&self.state);
        if state.faults.failing_listings {
            return Err(ServiceBusError::transport(
                "list subscriptions",
                topic,
                "unauthorized",
            ));
        }
        let subscriptions = state
            .topics
            .get(topic)
            .ok_or_else(|| ServiceBusError::EntityNotFound(topic.to_string()))?;
        subscriptions
            .iter()
            .map(|sub| {
                let key = EntityAddress::subscription(topic, sub.clone()).path();
                Ok(state
                    .store(&key)?
                    .descriptor(sub, EntityKind::Subscription, Some(topic)))
            })
            .collect()
    }
}

/// Peek-lock receiver over one store, optionally restricted to one session.
pub struct InMemoryReceiver {
    state: Arc<Mutex<BrokerState>>,
    key: String,
    dead_letter: bool,
    id: u64,
    session: Option<String>,
    held: HashSet<i64>,
    receive_wait: Duration,
    closed: bool,
}

impl InMemoryReceiver {
    fn ensure_open(&self) -> ServiceBusResult<()> {
        if self.closed {
            Err(ServiceBusError::Disposed("Receiver".to_string()))
        } else {
            Ok(())
        }
    }

    fn matches_session(&self, record: &MessageRecord) -> bool {
        match &self.session {
            Some(session) => record.session_id.as_deref() == Some(session.as_str()),
            None => true,
        }
    }

    fn try_take(&mut self, max_count: u32) -> ServiceBusResult<Vec<MessageRecord>> {
        let mut state = lock(&self.state);
        let id = self.id;
        let session = self.session.clone();
        let store = state.store_mut(&self.key)?;
        let now = Utc::now();
        let mut taken = Vec::new();

        for (sequence, stored) in store.queue_mut(self.dead_letter).iter_mut() {
            if taken.len() >= max_count as usize {
                break;
            }
            if stored.lock_owner.is_some() {
                continue;
            }
            if let Some(session) = &session {
                if stored.record.session_id.as_deref() != Some(session.as_str()) {
                    continue;
                }
            }
            stored.lock_owner = Some(id);
            stored.record.delivery_count += 1;
            let mut record = stored.record.clone();
            record.lock_token = Some(format!("{id}-{sequence}"));
            record.locked_until = chrono::Duration::from_std(LOCK_DURATION)
                .ok()
                .and_then(|d| now.checked_add_signed(d));
            taken.push(record);
        }

        for record in &taken {
            self.held.insert(record.sequence_number);
        }
        Ok(taken)
    }

    fn release(&mut self) {
        let mut state = lock(&self.state);
        if let Some(store) = state.stores.get_mut(&self.key) {
            let queue = store.queue_mut(self.dead_letter);
            for sequence in self.held.drain() {
                if let Some(stored) = queue.get_mut(&sequence) {
                    if stored.lock_owner == Some(self.id) {
                        stored.lock_owner = None;
                    }
                }
            }
            if let Some(session) = &self.session {
                if store.locked_sessions.get(session) == Some(&self.id) {
                    store.locked_sessions.remove(session);
                }
            }
        }
    }
}

impl Drop for InMemoryReceiver {
    fn drop(&mut self) {
        if !self.closed {
            self.release();
        }
    }
}

#[async_trait]
impl MessageReceiver for InMemoryReceiver {
    async fn peek(
        &mut self,
        max_count: u32,
        from_sequence: Option<i64>,
    ) -> ServiceBusResult<Vec<MessageRecord>> {
        self.ensure_open()?;

        let delay = {
            let mut state = lock(&self.state);
            if state.faults.failing_peeks > 0 {
                state.faults.failing_peeks -= 1;
                return Err(state.faults.peek_error.clone().unwrap_or_else(|| {
                    ServiceBusError::transport("peek", &self.key, "connection reset")
                }));
            }
            state.faults.peek_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = lock(&self.state);
        let store = state.store(&self.key)?;
        Ok(store
            .queue(self.dead_letter)
            .range(from_sequence.unwrap_or(i64::MIN)..)
            .map(|(_, stored)| &stored.record)
            .filter(|record| self.matches_session(record))
            .take(max_count as usize)
            .cloned()
            .collect())
    }

    async fn receive(
        &mut self,
        max_count: u32,
        max_wait: Duration,
    ) -> ServiceBusResult<Vec<MessageRecord>> {
        self.ensure_open()?;
        let deadline = Instant::now() + max_wait.min(self.receive_wait);
        loop {
            let taken = self.try_take(max_count)?;
            if !taken.is_empty() || Instant::now() >= deadline {
                return Ok(taken);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn complete(&mut self, sequence_number: i64) -> ServiceBusResult<()> {
        self.ensure_open()?;
        if !self.held.contains(&sequence_number) {
            return Err(ServiceBusError::transport(
                "complete",
                &self.key,
                format!("lock for message {sequence_number} is not held"),
            ));
        }

        let mut state = lock(&self.state);
        if state.faults.failing_completions.contains(&sequence_number) {
            return Err(ServiceBusError::transport(
                "complete",
                &self.key,
                format!("lock for message {sequence_number} was lost"),
            ));
        }
        let store = state.store_mut(&self.key)?;
        store.queue_mut(self.dead_letter).remove(&sequence_number);
        state.completed += 1;
        self.held.remove(&sequence_number);
        Ok(())
    }

    async fn abandon(&mut self, sequence_number: i64) -> ServiceBusResult<()> {
        self.ensure_open()?;
        if !self.held.remove(&sequence_number) {
            return Err(ServiceBusError::transport(
                "abandon",
                &self.key,
                format!("lock for message {sequence_number} is not held"),
            ));
        }

        let mut state = lock(&self.state);
        let dead_letter = self.dead_letter;
        let store = state.store_mut(&self.key)?;
        if let Some(stored) = store.queue_mut(dead_letter).get_mut(&sequence_number) {
            stored.lock_owner = None;
        }
        state.abandoned += 1;
        Ok(())
    }

    async fn close(&mut self) -> ServiceBusResult<()> {
        if !self.closed {
            self.release();
            self.closed = true;
        }
        Ok(())
    }
}

/// Session receiver; dropping or closing it releases the session lock.
pub struct InMemorySessionReceiver {
    inner: InMemoryReceiver,
    session_id: String,
}

#[async_trait]
impl MessageReceiver for InMemorySessionReceiver {
    async fn peek(
        &mut self,
        max_count: u32,
        from_sequence: Option<i64>,
    ) -> ServiceBusResult<Vec<MessageRecord>> {
        self.inner.peek(max_count, from_sequence).await
    }

    async fn receive(
        &mut self,
        max_count: u32,
        max_wait: Duration,
    ) -> ServiceBusResult<Vec<MessageRecord>> {
        self.inner.receive(max_count, max_wait).await
    }

    async fn complete(&mut self, sequence_number: i64) -> ServiceBusResult<()> {
        self.inner.complete(sequence_number).await
    }

    async fn abandon(&mut self, sequence_number: i64) -> ServiceBusResult<()> {
        self.inner.abandon(sequence_number).await
    }

    async fn close(&mut self) -> ServiceBusResult<()> {
        self.inner.close().await
    }
}

#[async_trait]
impl SessionReceiver for InMemorySessionReceiver {
    fn session_id(&self) -> &str {
        &self.session_id
    }
}

pub struct InMemorySender {
    state: Arc<Mutex<BrokerState>>,
    entity: String,
    closed: bool,
}

#[async_trait]
impl MessageSender for InMemorySender {
    async fn send(&mut self, messages: Vec<OutgoingMessage>) -> ServiceBusResult<()> {
        if self.closed {
            return Err(ServiceBusError::Disposed("Sender".to_string()));
        }

        let mut state = lock(&self.state);
        if let Some(rejected) = messages.iter().find(|m| {
            m.message_id
                .as_ref()
                .is_some_and(|id| state.faults.failing_message_ids.contains(id))
        }) {
            return Err(ServiceBusError::transport(
                "send",
                &self.entity,
                format!(
                    "message {} was rejected by the broker",
                    rejected.message_id.as_deref().unwrap_or("unknown")
                ),
            ));
        }

        for message in &messages {
            state.enqueue(&self.entity, message)?;
        }
        Ok(())
    }

    async fn close(&mut self) -> ServiceBusResult<()> {
        self.closed = true;
        Ok(())
    }
}
