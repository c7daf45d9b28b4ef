use crate::types::{Batch, Group, Pin};
use crate::utilities::hash::HashType;

pub(crate) mod assembler;
pub(crate) mod manager;
pub(crate) mod sender;

pub(crate) use assembler::MessageAssembler;
pub(crate) use manager::BatchManager;
pub(crate) use sender::BatchSender;

/// The grouping key for outbound batching: all messages of one dispatcher
/// share namespace, author, privacy class and (for private) the group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct DispatchKey {
    pub namespace: String,
    pub author: String,
    pub group: Option<HashType>,
    pub private: bool,
}

/// A batch that just went through seal, on its way to the type's sender.
#[derive(Debug, Clone)]
pub(crate) struct SealedBatch {
    pub batch: Batch,
    pub pins: Vec<Pin>,
    pub group_definition: Option<Group>,
}
