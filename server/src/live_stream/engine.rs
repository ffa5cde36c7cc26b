use super::options::LiveStreamOptions;
use super::types::{
    StreamEvent, StreamNotification, StreamRequest, StreamSession, StreamState, StreamStats,
};
use crate::common::{
    Bounded, ServiceBusError, ServiceBusResult, acquire_lock_with_timeout, run_bounded,
};
use crate::consumer::Consumer;
use crate::model::MessageRecord;
use crate::operations::{MessageTransport, PeekRequest};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Lets a stream task publish only while its stream is open.
///
/// Closing waits for an emission already in progress, so once `close`
/// returns nothing more gets through.
struct EmitGate {
    open: StdMutex<bool>,
}

impl EmitGate {
    fn new() -> Self {
        Self {
            open: StdMutex::new(true),
        }
    }

    fn emit(&self, publish: impl FnOnce()) -> bool {
        let open = lock(&self.open);
        if *open {
            publish();
        }
        *open
    }

    fn close(&self) {
        *lock(&self.open) = false;
    }
}

/// State shared between the engine and its stream task.
#[derive(Default)]
struct Shared {
    state: StdMutex<StreamState>,
    streaming: StdMutex<bool>,
    subscribers: StdMutex<Vec<flume::Sender<StreamNotification>>>,
    stats: StdMutex<StreamStats>,
    generation: AtomicU64,
}

impl Shared {
    fn notify(&self, notification: StreamNotification) {
        lock(&self.subscribers).retain(|subscriber| subscriber.send(notification.clone()).is_ok());
    }

    fn set_state(&self, state: StreamState) {
        *lock(&self.state) = state;
    }

    /// Publishes a status change only when the value actually flips.
    fn set_streaming(&self, streaming: bool) {
        let mut current = lock(&self.streaming);
        if *current != streaming {
            *current = streaming;
            self.notify(StreamNotification::StatusChanged(streaming));
        }
    }

    /// Called by a stream task that ended without being stopped.
    fn finish(&self, generation: u64) {
        if self.generation.load(Ordering::Acquire) != generation {
            return;
        }
        let mut state = lock(&self.state);
        if *state == StreamState::Streaming {
            *state = StreamState::Idle;
            drop(state);
            self.set_streaming(false);
        }
    }
}

struct ActiveStream {
    session: StreamSession,
    gate: Arc<EmitGate>,
    task: JoinHandle<()>,
}

/// Background discovery of new messages on one entity at a time.
///
/// In peek mode (the default) the entity is polled for messages newer than the
/// last one seen. In processor mode messages are received and immediately
/// abandoned, so they stay in the entity. Either way every message becomes a
/// [`StreamNotification::Message`] for all subscribers.
///
/// # Examples
///
/// ```no_run
/// use server::live_stream::{LiveStreamEngine, LiveStreamOptions, StreamNotification};
/// use server::operations::MessageTransport;
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// async fn watch(transport: Arc<dyn MessageTransport>) -> server::common::ServiceBusResult<()> {
///     let engine = LiveStreamEngine::new(LiveStreamOptions::default());
///     let events = engine.subscribe();
///     engine
///         .start_queue_stream(transport, "orders", true, &CancellationToken::new())
///         .await?;
///
///     while let Ok(StreamNotification::Message(event)) = events.recv_async().await {
///         println!("{} {}", event.sequence_number(), event.message.body_text());
///     }
///     engine.stop_stream().await
/// }
/// ```
pub struct LiveStreamEngine {
    options: LiveStreamOptions,
    shared: Arc<Shared>,
    active: Mutex<Option<ActiveStream>>,
}

impl LiveStreamEngine {
    pub fn new(options: LiveStreamOptions) -> Self {
        Self {
            options,
            shared: Arc::new(Shared::default()),
            active: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &LiveStreamOptions {
        &self.options
    }

    /// New channel receiving every notification from now on.
    pub fn subscribe(&self) -> flume::Receiver<StreamNotification> {
        let (sender, receiver) = flume::unbounded();
        lock(&self.shared.subscribers).push(sender);
        receiver
    }

    pub fn state(&self) -> StreamState {
        *lock(&self.shared.state)
    }

    pub fn is_streaming(&self) -> bool {
        *lock(&self.shared.streaming)
    }

    pub fn stats(&self) -> StreamStats {
        lock(&self.shared.stats).clone()
    }

    pub async fn current_session(&self) -> Option<StreamSession> {
        let last_seen = self.stats().last_sequence_number;
        self.active.lock().await.as_ref().map(|active| StreamSession {
            last_seen_sequence_number: last_seen,
            ..active.session.clone()
        })
    }

    pub async fn start_queue_stream(
        &self,
        transport: Arc<dyn MessageTransport>,
        queue: &str,
        peek_only: bool,
        cancel: &CancellationToken,
    ) -> ServiceBusResult<()> {
        let request = StreamRequest::queue(queue).with_peek_only(peek_only);
        self.start_stream(transport, request, cancel).await
    }

    pub async fn start_subscription_stream(
        &self,
        transport: Arc<dyn MessageTransport>,
        topic: &str,
        subscription: &str,
        peek_only: bool,
        cancel: &CancellationToken,
    ) -> ServiceBusResult<()> {
        let request = StreamRequest::subscription(topic, subscription).with_peek_only(peek_only);
        self.start_stream(transport, request, cancel).await
    }

    /// Stops any running stream, then starts streaming `request`.
    ///
    /// `cancel` ends the stream as well; it is linked, not consumed.
    pub async fn start_stream(
        &self,
        transport: Arc<dyn MessageTransport>,
        request: StreamRequest,
        cancel: &CancellationToken,
    ) -> ServiceBusResult<()> {
        let mut slot =
            acquire_lock_with_timeout(&self.active, "live stream", self.slot_timeout(), None)
                .await?;
        if let Some(previous) = slot.take() {
            log::info!("Replacing stream on {}", previous.session.entity_name);
            self.shutdown(previous).await;
        }

        self.shared.set_state(StreamState::Starting);
        let consumer = match self.prepare(transport.as_ref(), &request).await {
            Ok(consumer) => consumer,
            Err(e) => {
                log::error!("Failed to start stream on {}: {e}", request.address);
                self.shared.set_state(StreamState::Idle);
                return Err(e);
            }
        };

        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *lock(&self.shared.stats) = StreamStats {
            started_at: Some(Utc::now()),
            ..Default::default()
        };

        let token = cancel.child_token();
        let gate = Arc::new(EmitGate::new());
        let session = StreamSession {
            entity_name: request.address.entity.clone(),
            subscription_name: request.address.subscription.clone(),
            is_session_enabled: request.requires_session,
            last_seen_sequence_number: 0,
            is_peek_only: request.peek_only,
            cancellation: token.clone(),
        };
        let worker = StreamWorker {
            transport,
            request,
            options: self.options.clone(),
            shared: self.shared.clone(),
            gate: gate.clone(),
            cancel: token,
            generation,
        };

        self.shared.set_state(StreamState::Streaming);
        self.shared.set_streaming(true);
        log::info!(
            "Started {} stream on {}",
            if session.is_peek_only { "peek" } else { "processor" },
            worker.request.address
        );
        let task = match consumer {
            Some(consumer) => tokio::spawn(worker.run_processor(consumer)),
            None => tokio::spawn(worker.run_peek()),
        };

        *slot = Some(ActiveStream {
            session,
            gate,
            task,
        });
        Ok(())
    }

    /// Stops the running stream. Does nothing when no stream is running.
    ///
    /// Once this returns no further message notifications are published.
    pub async fn stop_stream(&self) -> ServiceBusResult<()> {
        let mut slot =
            acquire_lock_with_timeout(&self.active, "live stream", self.slot_timeout(), None)
                .await?;
        match slot.take() {
            Some(active) => {
                self.shutdown(active).await;
                Ok(())
            }
            None => {
                log::debug!("Stop requested but no stream is running");
                Ok(())
            }
        }
    }

    async fn prepare(
        &self,
        transport: &dyn MessageTransport,
        request: &StreamRequest,
    ) -> ServiceBusResult<Option<Consumer>> {
        if request.peek_only {
            return Ok(None);
        }
        if request.requires_session {
            return Err(ServiceBusError::ConfigurationError(
                "Processor mode is not available for session-enabled entities".to_string(),
            ));
        }
        Ok(Some(transport.open_consumer(&request.address).await?))
    }

    async fn shutdown(&self, active: ActiveStream) {
        let ActiveStream {
            session,
            gate,
            mut task,
        } = active;

        self.shared.set_state(StreamState::Stopping);
        session.cancellation.cancel();
        gate.close();

        match tokio::time::timeout(self.options.stop_timeout(), &mut task).await {
            Ok(Ok(())) => log::info!("Stopped stream on {}", session.entity_name),
            Ok(Err(e)) => log::error!("Stream task on {} failed: {e}", session.entity_name),
            Err(_) => {
                log::error!(
                    "Stream task on {} did not stop within {:?}, abandoning it",
                    session.entity_name,
                    self.options.stop_timeout()
                );
                task.abort();
            }
        }

        self.shared.set_state(StreamState::Idle);
        self.shared.set_streaming(false);
    }

    fn slot_timeout(&self) -> Duration {
        self.options.stop_timeout() + self.options.receive_timeout()
    }
}

impl Drop for LiveStreamEngine {
    fn drop(&mut self) {
        if let Ok(slot) = self.active.try_lock() {
            if let Some(active) = slot.as_ref() {
                active.session.cancellation.cancel();
                active.gate.close();
            }
        }
    }
}

/// Position of a peek stream.
///
/// Sequence numbers grow per entity, but a session scan only reaches part of
/// the sessions per poll. Session streams therefore track the last sequence
/// number seen in every session separately.
#[derive(Debug, Default)]
struct PeekCursor {
    per_session: bool,
    last_seen: i64,
    sessions: HashMap<String, i64>,
}

impl PeekCursor {
    fn new(stream: &StreamRequest) -> Self {
        Self {
            per_session: stream.requires_session && !stream.address.dead_letter,
            ..Default::default()
        }
    }

    fn request(&self, stream: &StreamRequest, batch_size: u32) -> PeekRequest {
        let request = PeekRequest::new(stream.address.clone(), batch_size)
            .with_sessions(stream.requires_session);
        if self.per_session {
            let starts = self
                .sessions
                .iter()
                .map(|(session, last)| (session.clone(), last.saturating_add(1)))
                .collect();
            request.with_session_cursors(starts)
        } else {
            request.from_sequence(self.last_seen.saturating_add(1))
        }
    }

    /// Records `message`; false when it was already seen.
    fn advance(&mut self, message: &MessageRecord) -> bool {
        let last = match &message.session_id {
            Some(session) if self.per_session => self.sessions.entry(session.clone()).or_default(),
            _ => &mut self.last_seen,
        };
        if message.sequence_number <= *last {
            return false;
        }
        *last = message.sequence_number;
        true
    }
}

/// The task side of one stream.
struct StreamWorker {
    transport: Arc<dyn MessageTransport>,
    request: StreamRequest,
    options: LiveStreamOptions,
    shared: Arc<Shared>,
    gate: Arc<EmitGate>,
    cancel: CancellationToken,
    generation: u64,
}

impl StreamWorker {
    async fn run_peek(self) {
        let batch_size = self.options.batch_size();
        let mut cursor = PeekCursor::new(&self.request);

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let request = cursor.request(&self.request, batch_size);
            let outcome = run_bounded(
                self.transport.peek_messages(&request, &self.cancel),
                self.options.receive_timeout(),
                &self.cancel,
            )
            .await;

            let mut pause = self.options.poll_interval();
            match outcome {
                Bounded::Cancelled => break,
                Bounded::TimedOut => {
                    log::debug!("No new messages on {}", self.request.address);
                }
                Bounded::Completed(Ok(messages)) => {
                    if messages.len() as u32 >= batch_size {
                        pause = Duration::ZERO;
                    }
                    for message in messages {
                        if !cursor.advance(&message) {
                            continue;
                        }
                        if !self.emit(message) {
                            return;
                        }
                    }
                }
                Bounded::Completed(Err(e)) if e.is_cancelled() => break,
                Bounded::Completed(Err(e)) if e.is_transient_timeout() => {}
                Bounded::Completed(Err(e)) => {
                    if !self.handle_error(&e) {
                        return;
                    }
                    pause = self.options.error_backoff();
                }
            }

            if self.pause(pause).await {
                break;
            }
        }

        self.shared.finish(self.generation);
    }

    async fn run_processor(self, consumer: Consumer) {
        let batch_size = self.options.batch_size();

        'stream: loop {
            let outcome = run_bounded(
                consumer.receive_messages_with_timeout(batch_size, self.options.receive_timeout()),
                self.options.receive_timeout() + self.options.stop_timeout(),
                &self.cancel,
            )
            .await;

            match outcome {
                Bounded::Cancelled => break,
                Bounded::TimedOut => {
                    log::debug!("Receive on {} timed out", self.request.address);
                }
                Bounded::Completed(Ok(messages)) => {
                    for message in messages {
                        let sequence = message.sequence_number;
                        let emitted = self.emit(message);
                        if let Err(e) = consumer.abandon_message(sequence).await {
                            log::warn!(
                                "Failed to abandon message {sequence} on {}: {e}",
                                self.request.address
                            );
                        }
                        if !emitted {
                            break 'stream;
                        }
                    }
                }
                Bounded::Completed(Err(e)) => {
                    // Processor errors are reported but never end the stream
                    self.handle_error(&e);
                    if self.pause(self.options.error_backoff()).await {
                        break;
                    }
                }
            }
        }

        if let Err(e) = consumer.dispose().await {
            log::warn!("Failed to close stream receiver on {}: {e}", self.request.address);
        }
        self.shared.finish(self.generation);
    }

    /// Publishes one message; false once the stream was stopped.
    fn emit(&self, message: MessageRecord) -> bool {
        let event = StreamEvent::new(message, &self.request.address);
        let sequence = event.sequence_number();
        self.gate.emit(|| {
            {
                let mut stats = lock(&self.shared.stats);
                stats.emitted += 1;
                stats.last_sequence_number = sequence;
            }
            self.shared.notify(StreamNotification::Message(event));
        })
    }

    /// Reports an error to subscribers. Returns whether polling may go on.
    fn handle_error(&self, error: &ServiceBusError) -> bool {
        let retryable = error.is_retryable();
        if retryable {
            log::warn!("Stream on {} failed, retrying: {error}", self.request.address);
        } else {
            log::error!("Stream on {} failed: {error}", self.request.address);
        }

        self.gate.emit(|| {
            lock(&self.shared.stats).errors += 1;
            self.shared
                .notify(StreamNotification::Error(error.user_message()));
        });

        if !retryable && self.request.peek_only {
            self.shared.finish(self.generation);
            return false;
        }
        true
    }

    /// Sleeps unless cancelled first; true when cancelled.
    async fn pause(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            tokio::task::yield_now().await;
            return self.cancel.is_cancelled();
        }
        tokio::select! {
            () = self.cancel.cancelled() => true,
            () = tokio::time::sleep(duration) => false,
        }
    }
}
