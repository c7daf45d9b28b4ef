//! Operation runner: every durable side-effect goes through here. Enforces
//! at-most-once per idempotency key, classifies plugin failures, retries
//! transient ones with exponential backoff, and records every transition.

use serde::Deserialize;

use crate::config::OperationConfig;
use crate::error::CoreError;
use crate::events::EventIngress;
use crate::plugins::{
    BatchEnvelope, BatchMeta, BatchPin, PinnedContext, PluginError, PluginRegistry, PluginResult,
};
use crate::storage::{txn, SharedStore, StorageTxn};
use crate::types::{BatchRecord, OpStatus, OpType, Operation};
use crate::utilities::encoding::Encode;
use crate::utilities::hash::HashType;
use crate::utilities::time::now_millis;
use crate::utilities::EntityId;

use super::Backoff;

/// What a dispatched plugin call reported.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DispatchOutcome {
    Complete(Option<serde_json::Value>),
    /// Accepted; terminal status will arrive via plugin callback or
    /// reconciliation.
    Pending,
}

#[derive(Clone)]
pub(crate) struct OperationRunner {
    store: SharedStore,
    plugins: PluginRegistry,
    ingress: EventIngress,
    config: OperationConfig,
}

impl OperationRunner {
    pub(crate) fn new(
        store: SharedStore,
        plugins: PluginRegistry,
        ingress: EventIngress,
        config: OperationConfig,
    ) -> Self {
        Self {
            store,
            plugins,
            ingress,
            config,
        }
    }

    fn plugin_name(&self, op_type: OpType) -> &str {
        match op_type {
            OpType::SharedStorageUploadBatch => self.plugins.shared_storage.name(),
            OpType::DataExchangeSendBatch | OpType::DataExchangeSendBlob => {
                self.plugins.data_exchange.name()
            }
            OpType::BlockchainPinBatch | OpType::BlockchainNetworkAction => {
                self.plugins.blockchain.name()
            }
            OpType::TokenCreatePool
            | OpType::TokenMint
            | OpType::TokenBurn
            | OpType::TokenTransfer
            | OpType::TokenApproval => self.plugins.tokens.name(),
        }
    }

    /// Run one operation to a terminal state (or Pending for asynchronous
    /// plugins). Returns the stored output of a previous Succeeded run with
    /// the same idempotency key without touching the plugin.
    pub(crate) async fn run(
        &self,
        namespace: &str,
        tx: &EntityId,
        op_type: OpType,
        input: serde_json::Value,
    ) -> Result<Operation, CoreError> {
        let plugin = self.plugin_name(op_type).to_string();
        let mut op = Operation::new(namespace, tx, op_type, &plugin, input);
        let key = op.idempotency_key().map_err(CoreError::Internal)?;

        {
            let mut store = self.store.lock().await;
            let previous = txn(store.as_mut(), |t| {
                if let Some(previous) = t.find_succeeded_operation(namespace, &key)? {
                    return Ok(Some(previous));
                }
                t.insert_operation(&op)?;
                Ok(None)
            })
            .map_err(|e| CoreError::Internal(e.into()))?;
            if let Some(previous) = previous {
                log::debug!(
                    "Operation short-circuited by idempotency key {key}: {}",
                    previous.id
                );
                return Ok(previous);
            }
        }

        let mut backoff = Backoff::new(
            self.config.retry_initial_ms,
            self.config.retry_multiplier,
            self.config.retry_max_ms,
        );

        loop {
            op.status = OpStatus::Pending;
            op.updated = now_millis();
            self.persist(&op).await?;

            match self.dispatch(&op, &key).await {
                Ok(DispatchOutcome::Complete(output)) => {
                    self.ingress
                        .operation_update(
                            namespace,
                            &op.id,
                            OpStatus::Succeeded,
                            output,
                            None,
                            None,
                        )
                        .await?;
                    return self.load(namespace, &op.id).await;
                }
                Ok(DispatchOutcome::Pending) => {
                    log::debug!("Operation {} accepted, awaiting plugin callback", op.id);
                    return Ok(op);
                }
                Err(err) if err.retryable() && op.retry_count + 1 < self.config.max_attempts => {
                    op.retry_count += 1;
                    op.error = Some(err.to_string());
                    op.updated = now_millis();
                    self.persist(&op).await?;

                    let delay = backoff.next_delay();
                    log::warn!(
                        "Operation {} attempt {} failed ({err}), retrying in {delay:?}",
                        op.id,
                        op.retry_count
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    self.ingress
                        .operation_update(
                            namespace,
                            &op.id,
                            OpStatus::Failed,
                            None,
                            Some(err.to_string()),
                            None,
                        )
                        .await?;
                    return Err(match err {
                        PluginError::Unavailable(msg) => CoreError::RemoteUnavailable(msg),
                        PluginError::Rejected(msg) => CoreError::RemoteRejected(msg),
                    });
                }
            }
        }
    }

    /// Manual retry of a Failed operation: a new row with a new id but the
    /// same idempotency key, which the plugin may use to short-circuit.
    pub(crate) async fn retry(
        &self,
        namespace: &str,
        op_id: &EntityId,
    ) -> Result<Operation, CoreError> {
        let previous = self.load(namespace, op_id).await?;
        if previous.status != OpStatus::Failed {
            return Err(CoreError::Conflict(format!(
                "Operation {op_id} is {} and cannot be retried",
                previous.status.as_str()
            )));
        }
        self.run(
            namespace,
            &previous.tx,
            previous.op_type,
            previous.input.clone(),
        )
        .await
    }

    async fn persist(&self, op: &Operation) -> Result<(), CoreError> {
        let mut store = self.store.lock().await;
        txn(store.as_mut(), |t| t.update_operation(op))
            .map_err(|e| CoreError::Internal(e.into()))
    }

    async fn load(&self, namespace: &str, op_id: &EntityId) -> Result<Operation, CoreError> {
        let mut store = self.store.lock().await;
        txn(store.as_mut(), |t| t.get_operation(namespace, op_id))
            .map_err(|e| CoreError::Internal(e.into()))?
            .ok_or_else(|| CoreError::NotFound(format!("Operation {op_id}")))
    }

    async fn load_batch(&self, namespace: &str, batch_id: &str) -> PluginResult<BatchRecord> {
        let mut store = self.store.lock().await;
        txn(store.as_mut(), |t| t.get_batch(namespace, batch_id))
            .map_err(|e| PluginError::Rejected(format!("Storage error loading batch: {e}")))?
            .ok_or_else(|| PluginError::Rejected(format!("Batch not found: {batch_id}")))
    }

    /// Map an operation to the concrete plugin call. No storage locks are
    /// held across the plugin invocation.
    async fn dispatch(&self, op: &Operation, key: &str) -> PluginResult<DispatchOutcome> {
        match op.op_type {
            OpType::SharedStorageUploadBatch => {
                let input: BatchOpInput = parse_input(&op.input)?;
                let record = self.load_batch(&op.namespace, &input.batch_id).await?;
                let payload = record
                    .batch
                    .payload
                    .encode()
                    .map_err(|e| PluginError::Rejected(e.to_string()))?;
                let payload_ref = self.plugins.shared_storage.upload_data(&payload).await?;
                Ok(DispatchOutcome::Complete(Some(
                    serde_json::json!({ "payload_ref": payload_ref }),
                )))
            }
            OpType::DataExchangeSendBatch => {
                let input: SendBatchInput = parse_input(&op.input)?;
                let record = self.load_batch(&op.namespace, &input.batch_id).await?;
                let envelope = batch_envelope(&record, input.group_definition.clone())
                    .map_err(|e| PluginError::Rejected(e.to_string()))?;
                self.plugins
                    .data_exchange
                    .send_batch(&input.peer, &envelope, key)
                    .await?;
                Ok(DispatchOutcome::Complete(None))
            }
            OpType::DataExchangeSendBlob => {
                let input: SendBlobInput = parse_input(&op.input)?;
                self.plugins
                    .data_exchange
                    .transfer_blob(&input.peer, &input.hash, key)
                    .await?;
                Ok(DispatchOutcome::Complete(None))
            }
            OpType::BlockchainPinBatch => {
                let input: PinBatchInput = parse_input(&op.input)?;
                let record = self.load_batch(&op.namespace, &input.batch_id).await?;

                let pins = {
                    let mut store = self.store.lock().await;
                    txn(store.as_mut(), |t| {
                        t.pins_for_batch(&op.namespace, &input.batch_id)
                    })
                    .map_err(|e| PluginError::Rejected(format!("Storage error loading pins: {e}")))?
                };
                let contexts = pins
                    .iter()
                    .map(|pin| PinnedContext {
                        context: pin.context,
                        nonce: pin.nonce,
                    })
                    .collect();

                let signing_key = self
                    .plugins
                    .identity
                    .signing_key_for(&record.batch.author)
                    .await?
                    .ok_or_else(|| {
                        PluginError::Rejected(format!(
                            "No signing key for author {}",
                            record.batch.author
                        ))
                    })?;

                let pin = BatchPin {
                    namespace: op.namespace.clone(),
                    batch_id: input.batch_id.clone(),
                    batch_hash: record.batch.hash,
                    payload_ref: input.payload_ref.clone(),
                    contexts,
                };
                self.plugins
                    .blockchain
                    .submit_batch_pin(&pin, &signing_key, key)
                    .await?;
                Ok(DispatchOutcome::Complete(None))
            }
            OpType::BlockchainNetworkAction => {
                let input: NetworkActionInput = parse_input(&op.input)?;
                let signing_key = self
                    .plugins
                    .identity
                    .signing_key_for(&input.author)
                    .await?
                    .ok_or_else(|| {
                        PluginError::Rejected(format!("No signing key for author {}", input.author))
                    })?;
                self.plugins
                    .blockchain
                    .submit_network_action(&input.action, &signing_key, key)
                    .await?;
                Ok(DispatchOutcome::Complete(None))
            }
            OpType::TokenCreatePool => {
                let spec = parse_input(&op.input)?;
                self.plugins.tokens.create_pool(&spec, key).await?;
                Ok(DispatchOutcome::Complete(None))
            }
            OpType::TokenMint => {
                let spec = parse_input(&op.input)?;
                self.plugins.tokens.mint_tokens(&spec, key).await?;
                Ok(DispatchOutcome::Complete(None))
            }
            OpType::TokenBurn => {
                let spec = parse_input(&op.input)?;
                self.plugins.tokens.burn_tokens(&spec, key).await?;
                Ok(DispatchOutcome::Complete(None))
            }
            OpType::TokenTransfer => {
                let spec = parse_input(&op.input)?;
                self.plugins.tokens.transfer_tokens(&spec, key).await?;
                Ok(DispatchOutcome::Complete(None))
            }
            OpType::TokenApproval => {
                let spec = parse_input(&op.input)?;
                self.plugins.tokens.tokens_approval(&spec, key).await?;
                Ok(DispatchOutcome::Complete(None))
            }
        }
    }
}

fn parse_input<'a, T: Deserialize<'a>>(input: &'a serde_json::Value) -> PluginResult<T> {
    T::deserialize(input).map_err(|e| PluginError::Rejected(format!("Bad operation input: {e}")))
}

pub(crate) fn batch_envelope(
    record: &BatchRecord,
    group_definition: Option<crate::types::Group>,
) -> anyhow::Result<BatchEnvelope> {
    let batch = &record.batch;
    Ok(BatchEnvelope {
        meta: BatchMeta {
            id: batch.id.clone(),
            namespace: batch.namespace.clone(),
            author: batch.author.clone(),
            group: batch.group,
            group_definition,
            batch_type: batch.batch_type,
            hash: batch.hash,
            created: batch.created,
            tx: batch.tx.clone(),
        },
        payload: batch.payload.encode()?,
    })
}

#[derive(Deserialize)]
struct BatchOpInput {
    batch_id: EntityId,
}

#[derive(Deserialize)]
struct SendBatchInput {
    batch_id: EntityId,
    peer: String,
    #[serde(default)]
    group_definition: Option<crate::types::Group>,
}

#[derive(Deserialize)]
struct SendBlobInput {
    peer: String,
    hash: HashType,
}

#[derive(Deserialize)]
struct PinBatchInput {
    batch_id: EntityId,
    #[serde(default)]
    payload_ref: Option<String>,
}

#[derive(Deserialize)]
struct NetworkActionInput {
    author: String,
    action: String,
}
