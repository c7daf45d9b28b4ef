//! Core persisted entities. All of them are namespace-scoped and, where a
//! `hash` field exists, content-addressed over the canonical encoding.

pub mod batch;
pub mod data;
pub mod event;
pub mod group;
pub mod message;
pub mod operation;
pub mod pin;
pub mod subscription;
pub mod transaction;

pub use batch::{Batch, BatchPayload, BatchRecord, BatchType, TxRef};
pub use data::{BlobRef, Data};
pub use event::{Event, EventType};
pub use group::{Group, Member};
pub use message::{DataRef, Message, MessageHeader, MessageRecord, MessageState, MessageType};
pub use operation::{OpStatus, OpType, Operation};
pub use pin::{Pin, PinState};
pub use subscription::{FirstEvent, Subscription, SubscriptionFilter, SubscriptionOptions};
pub use transaction::{Transaction, TransactionType};

pub(crate) use pin::context_hash;

pub use crate::utilities::hash::HashType;
pub use crate::utilities::EntityId;
