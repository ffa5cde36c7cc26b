//! Paged peeking for standard and session-enabled entities.

use super::OperationOptions;
use crate::broker::{MessageReceiver, ServiceBusBackend, SessionReceiver};
use crate::common::{ServiceBusResult, receive_bounded};
use crate::model::{EntityAddress, MessageRecord};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What to peek and where to start.
#[derive(Debug, Clone, PartialEq)]
pub struct PeekRequest {
    pub address: EntityAddress,
    pub count: u32,
    pub from_sequence: Option<i64>,
    pub requires_session: bool,
    /// Per-session starting points that take precedence over `from_sequence`.
    pub session_cursors: HashMap<String, i64>,
}

impl PeekRequest {
    pub fn new(address: EntityAddress, count: u32) -> Self {
        Self {
            address,
            count,
            from_sequence: None,
            requires_session: false,
            session_cursors: HashMap::new(),
        }
    }

    pub fn from_sequence(mut self, sequence: i64) -> Self {
        self.from_sequence = Some(sequence);
        self
    }

    pub fn with_sessions(mut self, requires_session: bool) -> Self {
        self.requires_session = requires_session;
        self
    }

    pub fn with_session_cursors(mut self, cursors: HashMap<String, i64>) -> Self {
        self.session_cursors = cursors;
        self
    }

    fn start_for_session(&self, session_id: &str) -> Option<i64> {
        self.session_cursors
            .get(session_id)
            .copied()
            .or(self.from_sequence)
    }

    /// Dead-letter sub-queues are never session-enabled, whatever their entity says.
    pub fn uses_sessions(&self) -> bool {
        self.requires_session && !self.address.dead_letter
    }
}

/// Peeks forward from `from` until `count` messages were collected, a page
/// comes back empty, a call times out or the cursor would overflow.
///
/// The result is strictly increasing by sequence number.
pub(crate) async fn peek_forward<R>(
    receiver: &mut R,
    count: u32,
    from: Option<i64>,
    call_timeout: Duration,
    token: &CancellationToken,
) -> ServiceBusResult<Vec<MessageRecord>>
where
    R: MessageReceiver + ?Sized,
{
    let mut collected: Vec<MessageRecord> = Vec::with_capacity(count as usize);
    let mut cursor = from;

    while (collected.len() as u32) < count {
        let remaining = count - collected.len() as u32;
        let page = match receive_bounded(
            receiver.peek(remaining, cursor),
            call_timeout,
            token,
            "peek",
        )
        .await
        {
            Ok(page) => page,
            Err(e) if e.is_transient_timeout() => {
                log::debug!("Peek timed out, returning {} messages", collected.len());
                break;
            }
            Err(e) => return Err(e),
        };

        let before = collected.len();
        for message in page {
            let newer = collected
                .last()
                .is_none_or(|last| message.sequence_number > last.sequence_number);
            if newer {
                collected.push(message);
            }
        }
        let Some(last) = collected.last().map(|m| m.sequence_number) else {
            break;
        };
        if collected.len() == before {
            break;
        }
        match last.checked_add(1) {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    collected.truncate(count as usize);
    Ok(collected)
}

/// Peeks a standard entity (or any dead-letter sub-queue).
pub(crate) async fn peek_standard(
    backend: &dyn ServiceBusBackend,
    request: &PeekRequest,
    options: &OperationOptions,
    token: &CancellationToken,
) -> ServiceBusResult<Vec<MessageRecord>> {
    let mut receiver = backend.create_receiver(&request.address).await?;
    let result = peek_forward(
        receiver.as_mut(),
        request.count,
        request.from_sequence,
        options.operation_timeout(),
        token,
    )
    .await;

    if let Err(e) = receiver.close().await {
        log::warn!("Failed to close peek receiver on {}: {}", request.address, e);
    }
    result
}

/// Peeks across sessions of a session-enabled entity.
///
/// Sessions are accepted one after another and kept open until the end, so
/// the broker hands out a different one each time. The scan stops when a
/// session id repeats, when no session becomes available within the accept
/// timeout, after `max(max_sessions_to_check, count)` sessions, or once
/// `count` messages were collected. Every accepted receiver is closed before
/// returning, on error paths too.
pub(crate) async fn peek_sessions(
    backend: &dyn ServiceBusBackend,
    request: &PeekRequest,
    options: &OperationOptions,
    token: &CancellationToken,
) -> ServiceBusResult<Vec<MessageRecord>> {
    let mut opened: Vec<Box<dyn SessionReceiver>> = Vec::new();
    let mut collected = Vec::new();

    let outcome = collect_from_sessions(
        backend,
        request,
        options,
        token,
        &mut opened,
        &mut collected,
    )
    .await;

    let closes = opened.iter_mut().map(|receiver| async move {
        let session = receiver.session_id().to_string();
        (session, receiver.close().await)
    });
    for (session, closed) in futures::future::join_all(closes).await {
        if let Err(e) = closed {
            log::warn!("Failed to close session '{session}' on {}: {e}", request.address);
        }
    }
    outcome?;

    collected.sort_by_key(|m| m.sequence_number);
    collected.truncate(request.count as usize);
    Ok(collected)
}

async fn collect_from_sessions(
    backend: &dyn ServiceBusBackend,
    request: &PeekRequest,
    options: &OperationOptions,
    token: &CancellationToken,
    opened: &mut Vec<Box<dyn SessionReceiver>>,
    collected: &mut Vec<MessageRecord>,
) -> ServiceBusResult<()> {
    let max_sessions = options.max_sessions_to_check().max(request.count) as usize;
    let mut visited: HashSet<String> = HashSet::new();

    while (collected.len() as u32) < request.count && visited.len() < max_sessions {
        let receiver = match receive_bounded(
            backend.accept_next_session(&request.address),
            options.session_accept_timeout(),
            token,
            "accept session",
        )
        .await
        {
            Ok(receiver) => receiver,
            Err(e) if e.is_transient_timeout() => {
                log::debug!("No more sessions available on {}", request.address);
                break;
            }
            Err(e) => return Err(e),
        };

        let session_id = receiver.session_id().to_string();
        opened.push(receiver);
        if !visited.insert(session_id.clone()) {
            log::debug!("Session '{session_id}' seen twice on {}, stopping", request.address);
            break;
        }

        let Some(receiver) = opened.last_mut() else {
            break;
        };
        let remaining = request.count - collected.len() as u32;
        let messages = peek_forward(
            receiver.as_mut(),
            remaining,
            request.start_for_session(&session_id),
            options.operation_timeout(),
            token,
        )
        .await?;
        log::debug!(
            "Peeked {} messages from session '{session_id}' on {}",
            messages.len(),
            request.address
        );
        collected.extend(messages);
    }

    Ok(())
}
