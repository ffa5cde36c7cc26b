//! Live discovery of new messages on a queue or subscription.
//!
//! [`LiveStreamEngine`] runs one stream at a time in a background task and
//! publishes [`StreamNotification`]s to every subscriber. [`StreamBuffer`]
//! batches those notifications into a bounded window for display.

pub mod buffer;
pub mod engine;
pub mod options;
pub mod types;

pub use buffer::StreamBuffer;
pub use engine::LiveStreamEngine;
pub use options::LiveStreamOptions;
pub use types::{
    StreamEvent, StreamNotification, StreamRequest, StreamSession, StreamState, StreamStats,
};
