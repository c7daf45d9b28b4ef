//! Weft is a multi-party orchestration node: organizations exchange
//! messages, data and tokens over a shared ordering ledger, and every
//! participant derives an identical, totally-ordered view of what happened.
//!
//! Outbound messages are staged, grouped into hashed batches per
//! (namespace, author, group), pinned to the ledger with per-context nonces,
//! and shipped over shared storage or point-to-point data exchange. Inbound,
//! the aggregator consumes pins in ledger order and confirms a message only
//! once its batch, data and every predecessor on its contexts have arrived,
//! so all nodes converge on the same delivery stream, which subscriptions
//! then fan out to consumers with acks and offsets.

pub(crate) mod aggregator;
pub mod api;
pub(crate) mod batch;
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub(crate) mod events;
pub(crate) mod http;
pub mod logging;
pub(crate) mod operations;
pub mod plugins;
pub(crate) mod storage;
pub(crate) mod subscriptions;
pub mod types;
pub(crate) mod utilities;
pub(crate) mod websocket;

pub use crate::api::WeftApi;
pub use crate::config::Configuration;
pub use crate::core::{Node, NodeHandle, NodeStarter, ShutdownHandle};
pub use crate::error::CoreError;
