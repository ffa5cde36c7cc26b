use crate::config::AppConfig;
use anyhow::{Context, Result, bail};
use clap::{Args, Subcommand};
use serde::Serialize;
use server::bulk_operations::BulkOperationResult;
use server::live_stream::{
    LiveStreamEngine, StreamBuffer, StreamEvent, StreamNotification, StreamRequest,
};
use server::model::{EntityAddress, EntityDescriptor, MessageRecord, OutgoingMessage};
use server::operations::{MessageTransport, PeekRequest};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Where a command operates.
#[derive(Debug, Args)]
pub struct EntityArgs {
    /// Queue or topic name, or a path such as `orders/subscriptions/audit`
    pub entity: String,
    /// Subscription of the topic given as entity
    #[arg(long, short)]
    pub subscription: Option<String>,
    /// Target the dead-letter sub-queue
    #[arg(long)]
    pub dead_letter: bool,
}

impl EntityArgs {
    pub fn address(&self) -> Result<EntityAddress> {
        let address = EntityAddress::parse(&self.entity, self.subscription.as_deref())?;
        Ok(if self.dead_letter {
            address.with_dead_letter(true)
        } else {
            address
        })
    }
}

#[derive(Debug, Subcommand)]
pub enum ListTarget {
    Queues,
    Topics,
    Subscriptions { topic: String },
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Check that the connection can be used
    Validate,
    /// List queues, topics or the subscriptions of a topic
    #[command(subcommand)]
    List(ListTarget),
    /// Show messages without locking them
    Peek {
        #[command(flatten)]
        target: EntityArgs,
        #[arg(long, short)]
        count: Option<u32>,
        /// First sequence number to show
        #[arg(long)]
        from: Option<i64>,
        /// Peek across the sessions of a session-enabled entity
        #[arg(long)]
        sessions: bool,
    },
    /// Send one message to a queue or topic
    Send {
        entity: String,
        body: String,
        #[arg(long)]
        session_id: Option<String>,
        #[arg(long)]
        message_id: Option<String>,
        /// Application property as key=value, repeatable
        #[arg(long = "property", value_parser = parse_property)]
        properties: Vec<(String, String)>,
    },
    /// Remove every message from an entity
    Purge {
        #[command(flatten)]
        target: EntityArgs,
        /// Confirm the purge
        #[arg(long)]
        yes: bool,
    },
    /// Remove messages by sequence number
    Delete {
        #[command(flatten)]
        target: EntityArgs,
        #[arg(required = true)]
        sequence_numbers: Vec<i64>,
    },
    /// Copy peeked messages to another queue or topic
    Resend {
        #[command(flatten)]
        target: EntityArgs,
        /// Destination queue or topic
        #[arg(long)]
        to: String,
        #[arg(long, short)]
        count: Option<u32>,
        /// Only these sequence numbers, repeatable
        #[arg(long = "sequence")]
        sequences: Vec<i64>,
    },
    /// Move dead-lettered messages back to their entity
    Resubmit {
        #[command(flatten)]
        target: EntityArgs,
        #[arg(long, short)]
        count: Option<u32>,
        #[arg(long = "sequence")]
        sequences: Vec<i64>,
    },
    /// Print new messages as they arrive
    Stream {
        #[command(flatten)]
        target: EntityArgs,
        #[arg(long)]
        sessions: bool,
        /// Receive and abandon instead of peeking
        #[arg(long)]
        process: bool,
        /// Only print messages containing this text
        #[arg(long)]
        filter: Option<String>,
        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },
}

fn parse_property(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

pub struct CommandContext<'a> {
    pub transport: Arc<dyn MessageTransport>,
    pub config: &'a AppConfig,
    pub cancel: CancellationToken,
    pub json: bool,
}

impl CommandContext<'_> {
    fn print<T: Serialize>(&self, value: &T, text: impl FnOnce() -> String) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            println!("{}", text());
        }
        Ok(())
    }

    async fn select_messages(
        &self,
        address: &EntityAddress,
        count: Option<u32>,
        sequences: &[i64],
    ) -> Result<Vec<MessageRecord>> {
        let request = PeekRequest::new(address.clone(), count.unwrap_or(self.config.page_size()));
        let mut messages = self
            .transport
            .peek_messages(&request, &self.cancel)
            .await
            .with_context(|| format!("Could not peek {address}"))?;
        if !sequences.is_empty() {
            messages.retain(|m| sequences.contains(&m.sequence_number));
        }
        Ok(messages)
    }
}

pub async fn run(command: Command, ctx: &CommandContext<'_>) -> Result<()> {
    match command {
        Command::Validate => {
            let validation = ctx.transport.validate_connection().await;
            ctx.print(&validation, || match &validation.error {
                None => format!(
                    "Connection OK ({})",
                    validation.endpoint.as_deref().unwrap_or("unknown endpoint")
                ),
                Some(error) => format!("Connection failed: {error}"),
            })?;
            if !validation.valid {
                bail!("connection validation failed");
            }
            Ok(())
        }
        Command::List(target) => {
            let entities = match &target {
                ListTarget::Queues => ctx.transport.list_queues().await?,
                ListTarget::Topics => ctx.transport.list_topics().await?,
                ListTarget::Subscriptions { topic } => {
                    ctx.transport.list_subscriptions(topic).await?
                }
            };
            ctx.print(&entities, || format_entities(&entities))
        }
        Command::Peek {
            target,
            count,
            from,
            sessions,
        } => {
            let mut request =
                PeekRequest::new(target.address()?, count.unwrap_or(ctx.config.page_size()))
                    .with_sessions(sessions);
            if let Some(from) = from {
                request = request.from_sequence(from);
            }
            let messages = ctx.transport.peek_messages(&request, &ctx.cancel).await?;
            ctx.print(&messages, || format_messages(&messages))
        }
        Command::Send {
            entity,
            body,
            session_id,
            message_id,
            properties,
        } => {
            let mut message = OutgoingMessage::text(&body);
            if let Some(session_id) = session_id {
                message = message.with_session_id(session_id);
            }
            if let Some(message_id) = message_id {
                message = message.with_message_id(message_id);
            }
            for (key, value) in properties {
                message = message.with_property(key, value);
            }
            ctx.transport.send_message(&entity, message).await?;
            println!("Sent 1 message to {entity}");
            Ok(())
        }
        Command::Purge { target, yes } => {
            let address = target.address()?;
            if !yes {
                bail!("purging {address} removes every message; pass --yes to confirm");
            }
            let removed = ctx.transport.purge_messages(&address, &ctx.cancel).await?;
            ctx.print(&removed, || format!("Purged {removed} messages from {address}"))
        }
        Command::Delete {
            target,
            sequence_numbers,
        } => {
            let address = target.address()?;
            let result = ctx
                .transport
                .delete_messages_detailed(&address, &sequence_numbers, &ctx.cancel)
                .await?;
            ctx.print(&result, || format_result("Deleted", &result))
        }
        Command::Resend {
            target,
            to,
            count,
            sequences,
        } => {
            let messages = ctx
                .select_messages(&target.address()?, count, &sequences)
                .await?;
            if messages.is_empty() {
                println!("No messages to resend");
                return Ok(());
            }
            let result = ctx
                .transport
                .resend_messages_detailed(&to, &messages, &ctx.cancel)
                .await?;
            ctx.print(&result, || format_result("Resent", &result))
        }
        Command::Resubmit {
            target,
            count,
            sequences,
        } => {
            let address = target.address()?.main();
            let dead_letter = address.clone().with_dead_letter(true);
            let messages = ctx.select_messages(&dead_letter, count, &sequences).await?;
            if messages.is_empty() {
                println!("No dead-lettered messages to resubmit");
                return Ok(());
            }
            let result = ctx
                .transport
                .resubmit_dead_letter_messages_detailed(&address, &messages, &ctx.cancel)
                .await?;
            ctx.print(&result, || format_result("Resubmitted", &result))
        }
        Command::Stream {
            target,
            sessions,
            process,
            filter,
            duration,
        } => {
            let request = StreamRequest {
                address: target.address()?,
                requires_session: sessions,
                peek_only: !process,
            };
            stream(ctx, request, filter, duration.map(Duration::from_secs)).await
        }
    }
}

async fn stream(
    ctx: &CommandContext<'_>,
    request: StreamRequest,
    filter: Option<String>,
    duration: Option<Duration>,
) -> Result<()> {
    let engine = LiveStreamEngine::new(ctx.config.stream().clone());
    let buffer = StreamBuffer::from_options(ctx.config.stream());
    if let Some(filter) = filter {
        buffer.set_filter(filter);
    }

    let batches = buffer.subscribe_batches();
    let status = engine.subscribe();
    let feed = ctx.cancel.child_token();
    let feeder = buffer.attach(engine.subscribe(), feed.clone());
    engine
        .start_stream(ctx.transport.clone(), request, &ctx.cancel)
        .await?;

    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = ctx.cancel.cancelled() => break,
            () = &mut deadline => break,
            batch = batches.recv_async() => match batch {
                Ok(events) => print_events(ctx, &buffer.filter(), &events)?,
                Err(_) => break,
            },
            notification = status.recv_async() => {
                if stream_stopped(notification.ok()) {
                    log::warn!("Stream ended");
                    break;
                }
            }
        }
    }

    engine.stop_stream().await?;
    feed.cancel();
    if let Err(e) = feeder.await {
        log::warn!("Stream buffer task failed: {e}");
    }
    while let Ok(events) = batches.try_recv() {
        print_events(ctx, &buffer.filter(), &events)?;
    }
    let stats = engine.stats();
    log::info!(
        "Stream finished: {} messages, {} errors",
        stats.emitted,
        stats.errors
    );
    Ok(())
}

/// A closed channel means the engine is gone.
fn stream_stopped(notification: Option<StreamNotification>) -> bool {
    matches!(
        notification,
        None | Some(StreamNotification::StatusChanged(false))
    )
}

fn print_events(ctx: &CommandContext<'_>, filter: &str, events: &[StreamEvent]) -> Result<()> {
    for event in events.iter().filter(|event| event.matches(filter)) {
        if ctx.json {
            println!("{}", serde_json::to_string(event)?);
        } else {
            println!(
                "{} #{} {} {}",
                event.received_at.format("%H:%M:%S"),
                event.sequence_number(),
                event.message.message_id_or_unknown(),
                event.message.body_text()
            );
        }
    }
    Ok(())
}

fn format_entities(entities: &[EntityDescriptor]) -> String {
    if entities.is_empty() {
        return "No entities found".to_string();
    }
    entities
        .iter()
        .map(|entity| {
            format!(
                "{:<40} {:<12} active={:<6} dlq={:<6}{}",
                entity.name,
                entity.kind,
                entity.active_count,
                entity.dead_letter_count,
                if entity.requires_session { " sessions" } else { "" }
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_messages(messages: &[MessageRecord]) -> String {
    if messages.is_empty() {
        return "No messages".to_string();
    }
    messages
        .iter()
        .map(|message| {
            format!(
                "#{:<8} {:<36} {}",
                message.sequence_number,
                message.message_id_or_unknown(),
                message.body_text()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_result(verb: &str, result: &BulkOperationResult) -> String {
    let mut text = format!(
        "{verb} {} of {} messages",
        result.successful, result.total_requested
    );
    if result.not_found > 0 {
        text.push_str(&format!(", {} not found", result.not_found));
    }
    for detail in &result.error_details {
        text.push_str(&format!("\n  {detail}"));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok};

    #[test]
    fn stream_loop_stops_when_the_engine_does() {
        assert!(stream_stopped(Some(StreamNotification::StatusChanged(false))));
        assert!(stream_stopped(None));
        assert!(!stream_stopped(Some(StreamNotification::StatusChanged(true))));
        assert!(!stream_stopped(Some(StreamNotification::Error(
            "connection reset".to_string()
        ))));
    }

    #[test]
    fn properties_need_a_key() {
        assert_eq!(
            assert_ok!(parse_property("region=eu=west")),
            ("region".to_string(), "eu=west".to_string())
        );
        assert_err!(parse_property("=value"));
        assert_err!(parse_property("novalue"));
    }

    #[test]
    fn dead_letter_flag_targets_the_sub_queue() {
        let args = EntityArgs {
            entity: "orders".to_string(),
            subscription: Some("audit".to_string()),
            dead_letter: true,
        };
        let address = assert_ok!(args.address());
        assert_eq!(address.path(), "orders/Subscriptions/audit/$DeadLetterQueue");
    }
}
