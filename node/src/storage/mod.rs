//! Persistence contract. The database is the only authoritative mutator of
//! shared state; every multi-step workflow runs inside one transaction via
//! [`Persistence::with_txn`], and registered post-commit listeners receive the
//! committed change summary for wakeup signalling.

use thiserror::Error;

use crate::types::message::MessageRecord;
use crate::types::{
    Batch, BatchRecord, Data, Event, Group, MessageState, Operation, Pin, PinState, Subscription,
    Transaction,
};
use crate::utilities::hash::HashType;
use crate::utilities::EntityId;

pub(crate) mod filter;
pub(crate) mod sqlite;

pub(crate) use filter::{Filter, FilterValue, Query, SortDir};

pub(crate) type StorageResult<T> = Result<T, StorageError>;

#[derive(Error, Debug)]
pub(crate) enum StorageError {
    #[error("Row exists with a different id: {0}")]
    IdMismatch(String),
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

/// Offset streams. One row per consumer that tracks its own position in the
/// event log.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum OffsetType {
    Aggregator,
    Subscription,
}

impl OffsetType {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            OffsetType::Aggregator => "aggregator",
            OffsetType::Subscription => "subscription",
        }
    }
}

/// A message insert that a batch dispatcher may care about.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct StagedMessage {
    pub namespace: String,
    pub author: String,
    pub group: Option<HashType>,
    pub private: bool,
}

/// Summary of a committed transaction, handed to post-commit listeners.
#[derive(Debug, Clone, Default)]
pub(crate) struct ChangeSet {
    pub events: Vec<Event>,
    pub staged_messages: Vec<StagedMessage>,
    pub sealed_batches: Vec<EntityId>,
}

impl ChangeSet {
    pub(crate) fn is_empty(&self) -> bool {
        self.events.is_empty() && self.staged_messages.is_empty() && self.sealed_batches.is_empty()
    }
}

pub(crate) type PostCommitListener = Box<dyn Fn(&ChangeSet) + Send + Sync>;

/// The storage handle shared by every component task. The mutex makes the
/// database the serialization point; a holder runs at most one transaction.
pub(crate) type SharedStore = std::sync::Arc<tokio::sync::Mutex<Box<dyn Persistence>>>;

pub(crate) type TxnWork<'a> = Box<dyn FnOnce(&mut dyn StorageTxn) -> StorageResult<()> + 'a>;

pub(crate) trait Persistence: Send {
    /// Runs `work` inside one transaction. An `Err` rolls everything back;
    /// on commit, listeners observe the change set.
    fn with_txn(&mut self, work: TxnWork<'_>) -> StorageResult<ChangeSet>;

    fn add_post_commit_listener(&mut self, listener: PostCommitListener);
}

/// Value-returning convenience over [`Persistence::with_txn`].
pub(crate) fn txn<T>(
    store: &mut dyn Persistence,
    work: impl FnOnce(&mut dyn StorageTxn) -> StorageResult<T>,
) -> StorageResult<T> {
    let mut out = None;
    store.with_txn(Box::new(|t| {
        out = Some(work(t)?);
        Ok(())
    }))?;
    Ok(out.expect("Transaction closure did not run"))
}

/// All persisted-entity operations available inside a transaction.
pub(crate) trait StorageTxn {
    // -- messages -----------------------------------------------------------

    /// Insert, or no-op when an identical row (same id and hash) exists.
    /// A row with the same id but a different hash is an id mismatch.
    fn upsert_message(&mut self, record: &MessageRecord) -> StorageResult<()>;
    fn get_message(&mut self, namespace: &str, id: &str) -> StorageResult<Option<MessageRecord>>;
    fn query_messages(&mut self, query: &Query) -> StorageResult<Vec<MessageRecord>>;
    fn update_message_state(
        &mut self,
        namespace: &str,
        id: &str,
        state: MessageState,
        batch: Option<&EntityId>,
    ) -> StorageResult<()>;

    // -- data / blobs -------------------------------------------------------

    fn upsert_data(&mut self, data: &Data) -> StorageResult<()>;
    fn get_data(&mut self, namespace: &str, id: &str) -> StorageResult<Option<Data>>;
    fn insert_blob(&mut self, hash: &HashType, size: u64) -> StorageResult<()>;
    fn has_blob(&mut self, hash: &HashType) -> StorageResult<bool>;

    // -- groups -------------------------------------------------------------

    fn upsert_group(&mut self, group: &Group) -> StorageResult<()>;
    fn get_group(&mut self, hash: &HashType) -> StorageResult<Option<Group>>;

    // -- batches ------------------------------------------------------------

    fn upsert_batch(&mut self, record: &BatchRecord) -> StorageResult<()>;
    fn get_batch(&mut self, namespace: &str, id: &str) -> StorageResult<Option<BatchRecord>>;
    fn find_open_batch(
        &mut self,
        namespace: &str,
        author: &str,
        group: Option<&HashType>,
        private: bool,
    ) -> StorageResult<Option<Batch>>;

    // -- transactions -------------------------------------------------------

    fn upsert_transaction(&mut self, tx: &Transaction) -> StorageResult<()>;
    fn get_transaction(&mut self, namespace: &str, id: &str) -> StorageResult<Option<Transaction>>;
    fn add_blockchain_id(
        &mut self,
        namespace: &str,
        tx_id: &str,
        blockchain_id: &str,
    ) -> StorageResult<()>;

    // -- operations ---------------------------------------------------------

    fn insert_operation(&mut self, op: &Operation) -> StorageResult<()>;
    fn get_operation(&mut self, namespace: &str, id: &str) -> StorageResult<Option<Operation>>;
    fn find_succeeded_operation(
        &mut self,
        namespace: &str,
        idempotency_key: &str,
    ) -> StorageResult<Option<Operation>>;
    fn update_operation(&mut self, op: &Operation) -> StorageResult<()>;
    fn query_operations(&mut self, query: &Query) -> StorageResult<Vec<Operation>>;

    // -- pins ---------------------------------------------------------------

    /// Keyed by (context, signer, nonce). A row created at seal has no
    /// sequence; observing the pin on-chain fills it in.
    fn upsert_pin(&mut self, pin: &Pin) -> StorageResult<()>;
    fn query_pins(&mut self, query: &Query) -> StorageResult<Vec<Pin>>;
    fn pins_for_batch(&mut self, namespace: &str, batch_id: &str) -> StorageResult<Vec<Pin>>;
    fn update_pin_state(
        &mut self,
        context: &HashType,
        signer: &str,
        nonce: u64,
        state: PinState,
    ) -> StorageResult<()>;
    fn lowest_waiting_pin(
        &mut self,
        namespace: &str,
        context: &HashType,
    ) -> StorageResult<Option<i64>>;

    // -- ordering counters --------------------------------------------------

    /// Allocation side: returns the next nonce for (context, author),
    /// starting at 0, incrementing the stored counter.
    fn next_nonce(&mut self, context: &HashType, author: &str) -> StorageResult<u64>;
    /// Consumption side: the nonce the aggregator expects next.
    fn get_next_pin(&mut self, context: &HashType, author: &str) -> StorageResult<u64>;
    fn set_next_pin(&mut self, context: &HashType, author: &str, nonce: u64) -> StorageResult<()>;

    // -- events -------------------------------------------------------------

    /// Assigns the sequence and returns the stored event.
    fn insert_event(&mut self, event: Event) -> StorageResult<Event>;
    fn query_events(&mut self, query: &Query) -> StorageResult<Vec<Event>>;
    fn max_event_sequence(&mut self) -> StorageResult<i64>;

    // -- offsets ------------------------------------------------------------

    fn get_offset(&mut self, otype: OffsetType, name: &str) -> StorageResult<Option<i64>>;
    fn upsert_offset(&mut self, otype: OffsetType, name: &str, current: i64) -> StorageResult<()>;

    // -- subscriptions ------------------------------------------------------

    fn upsert_subscription(&mut self, sub: &Subscription) -> StorageResult<()>;
    fn get_subscription(
        &mut self,
        namespace: &str,
        name: &str,
    ) -> StorageResult<Option<Subscription>>;
    fn list_subscriptions(&mut self, namespace: &str) -> StorageResult<Vec<Subscription>>;
    fn delete_subscription(&mut self, namespace: &str, id: &str) -> StorageResult<()>;
}
