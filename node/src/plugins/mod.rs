//! Plugin contracts. Each plugin kind is a capability set selected by name at
//! startup; the node coordinates across plugins only through the event log,
//! never plugin-to-plugin.

use std::sync::Arc;

use thiserror::Error;

pub(crate) mod blockchain;
pub(crate) mod data_exchange;
pub(crate) mod identity;
pub(crate) mod memory;
pub(crate) mod shared_storage;
pub mod tokens;

pub(crate) use blockchain::{BatchPin, BatchPinEvent, BlockchainPlugin, PinnedContext};
pub(crate) use data_exchange::{BatchEnvelope, BatchMeta, DataExchangePlugin};
pub(crate) use identity::{Identity, IdentityPlugin};
pub(crate) use shared_storage::SharedStoragePlugin;
pub(crate) use tokens::{TokenApprovalSpec, TokenPoolSpec, TokenTransferSpec, TokensPlugin};

pub(crate) type PluginResult<T> = Result<T, PluginError>;

#[derive(Error, Debug)]
pub(crate) enum PluginError {
    /// Transient; the caller may retry with the same idempotency key.
    #[error("Plugin target unavailable: {0}")]
    Unavailable(String),
    /// Permanent; retrying the same request will not help.
    #[error("Plugin target rejected request: {0}")]
    Rejected(String),
}

impl PluginError {
    pub(crate) fn retryable(&self) -> bool {
        matches!(self, PluginError::Unavailable(_))
    }
}

/// Authoritative answer to "what happened to this submission", used by the
/// reconciliation sweep for operations stuck in Pending.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum OpPollStatus {
    /// The plugin has no record of the idempotency key.
    Unknown,
    Pending,
    Succeeded { output: Option<serde_json::Value> },
    Failed { error: String },
}

/// The full set of plugins a node runs with, registered by name.
#[derive(Clone)]
pub(crate) struct PluginRegistry {
    pub blockchain: Arc<dyn BlockchainPlugin>,
    pub data_exchange: Arc<dyn DataExchangePlugin>,
    pub shared_storage: Arc<dyn SharedStoragePlugin>,
    pub tokens: Arc<dyn TokensPlugin>,
    pub identity: Arc<dyn IdentityPlugin>,
}
