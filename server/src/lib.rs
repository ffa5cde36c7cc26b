//! # Busscope Server Library
//!
//! Operations layer for inspecting and managing Azure Service Bus entities,
//! plus a live streaming engine that surfaces new messages as they arrive.
//!
//! ## Modules
//!
//! - [`auth`] - Connection string parsing, SAS signing and Azure AD token providers
//! - [`broker`] - Backend seam with the Azure adapter (and an in-memory broker
//!   under the `test-utils` feature)
//! - [`bulk_operations`] - Purge, delete, resend and dead-letter resubmission
//! - [`common`] - Errors, cancellation helpers and lock guards
//! - [`consumer`] - Receiving and settling messages on one entity
//! - [`live_stream`] - Background peek or processor streaming
//! - [`model`] - Entities, addresses and message records
//! - [`operations`] - The [`operations::MessageTransport`] facade, its implementations and the client pool
//! - [`producer`] - Sending messages to a queue or topic

pub mod auth;
pub mod broker;
pub mod bulk_operations;
pub mod common;
pub mod consumer;
pub mod live_stream;
pub mod model;
pub mod operations;
pub mod producer;
