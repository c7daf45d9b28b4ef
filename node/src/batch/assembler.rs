//! Message assembler: accepts outbound messages, resolves their data
//! references, and stages them for the batch manager. The staged insert's
//! post-commit change set is what wakes the owning dispatcher.

use crate::api::types::{DataInput, SubmitRequest};
use crate::error::CoreError;
use crate::plugins::PluginRegistry;
use crate::storage::{txn, SharedStore, StorageTxn};
use crate::types::{
    BlobRef, Data, DataRef, Group, Message, MessageHeader, MessageRecord,
};
use crate::utilities::time::now_millis;

pub(crate) struct MessageAssembler {
    store: SharedStore,
    plugins: PluginRegistry,
    local_node: String,
}

impl MessageAssembler {
    pub(crate) fn new(store: SharedStore, plugins: PluginRegistry, local_node: &str) -> Self {
        Self {
            store,
            plugins,
            local_node: local_node.to_string(),
        }
    }

    pub(crate) async fn submit(&self, request: SubmitRequest) -> Result<Message, CoreError> {
        if request.topics.is_empty() {
            return Err(CoreError::InvalidInput(
                "A message must carry at least one topic".to_string(),
            ));
        }

        let private = request.message_type.is_private();
        if private && request.group.is_none() {
            return Err(CoreError::InvalidInput(
                "Private messages require a group".to_string(),
            ));
        }
        if !private && request.group.is_some() {
            return Err(CoreError::InvalidInput(
                "Broadcast messages cannot carry a group".to_string(),
            ));
        }

        let local = self
            .plugins
            .identity
            .is_local_author(&request.author)
            .await
            .map_err(|e| CoreError::RemoteUnavailable(e.to_string()))?;
        if !local {
            return Err(CoreError::Unauthorized(request.author.clone()));
        }

        let group = match &request.group {
            Some(input) => {
                let group = Group::new(input.name.clone(), input.members.clone());
                if !group.has_node(&self.local_node) {
                    return Err(CoreError::InvalidInput(format!(
                        "Local node {} is not a member of the group",
                        self.local_node
                    )));
                }
                Some(group)
            }
            None => None,
        };
        let group_hash = group
            .as_ref()
            .map(|g| g.hash())
            .transpose()
            .map_err(CoreError::Internal)?;

        let header = MessageHeader {
            namespace: request.namespace.clone(),
            author: request.author.clone(),
            group: group_hash,
            topics: request.topics.clone(),
            tag: request.tag.clone(),
            message_type: request.message_type,
            created: now_millis(),
            cid: request.cid.clone(),
        };

        let mut store = self.store.lock().await;
        let message = txn(store.as_mut(), |t| {
            let mut refs = Vec::with_capacity(request.data.len());
            for input in &request.data {
                let data_ref = resolve_data(t, &request.namespace, input)?;
                refs.push(data_ref);
            }

            if let Some(group) = &group {
                t.upsert_group(group)?;
            }

            let message =
                Message::new(header.clone(), refs).map_err(crate::storage::StorageError::Internal)?;
            t.upsert_message(&MessageRecord::staged(message.clone()))?;
            Ok(message)
        })
        .map_err(|e| match e {
            crate::storage::StorageError::Internal(inner) => match inner.downcast::<CoreError>() {
                Ok(core) => core,
                Err(other) => CoreError::Internal(other),
            },
            other => CoreError::Internal(other.into()),
        })?;

        log::debug!(
            "Staged message {} on topics {:?} for author {}",
            message.id,
            message.header.topics,
            message.header.author
        );
        Ok(message)
    }
}

fn resolve_data(
    t: &mut dyn StorageTxn,
    namespace: &str,
    input: &DataInput,
) -> crate::storage::StorageResult<DataRef> {
    let data = match input {
        DataInput::Value(value) => {
            let data = Data::inline(namespace, value.clone())?;
            t.upsert_data(&data)?;
            data
        }
        DataInput::Ref { id } => t.get_data(namespace, id)?.ok_or_else(|| {
            crate::storage::StorageError::Internal(
                CoreError::InvalidRef(format!("Data not found: {id}")).into(),
            )
        })?,
        DataInput::Blob { hash, size } => {
            if !t.has_blob(hash)? {
                return Err(crate::storage::StorageError::Internal(
                    CoreError::InvalidRef(format!("Blob not staged locally: {hash}")).into(),
                ));
            }
            let data = Data::blob(
                namespace,
                BlobRef {
                    hash: *hash,
                    size: *size,
                    public_ref: None,
                },
            );
            t.upsert_data(&data)?;
            data
        }
    };
    Ok(DataRef {
        id: data.id.clone(),
        hash: data.hash,
    })
}
