//! Event ingress: the typed callback surface plugins deliver into. Every
//! callback persists its plugin-specific state change together with the event
//! row in a single transaction, which makes ingress the sole allocator of the
//! event sequence, so a reader that observes an event always observes its
//! effects.

use crate::error::CoreError;
use crate::plugins::{BatchEnvelope, BatchPinEvent};
use crate::storage::{txn, SharedStore, StorageTxn};
use crate::types::message::MessageRecord;
use crate::types::{
    Batch, BatchRecord, Event, EventType, MessageState, OpStatus, Pin, PinState,
};
use crate::utilities::encoding::Decode;
use crate::utilities::hash::{ContentHasher, HashType, Hasher};
use crate::utilities::EntityId;

#[derive(Clone)]
pub(crate) struct EventIngress {
    store: SharedStore,
}

impl EventIngress {
    pub(crate) fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// A batch pin landed on the ordering ledger. Persists one pin row per
    /// context entry; each carries the sequence of the event row written in
    /// the same transaction, so pin order equals event order.
    pub(crate) async fn batch_pin_complete(
        &self,
        pin_event: &BatchPinEvent,
    ) -> Result<(), CoreError> {
        log::debug!(
            "Batch pin observed on ledger: batch={} signer={} contexts={}",
            pin_event.pin.batch_id,
            pin_event.signer,
            pin_event.pin.contexts.len()
        );

        let mut store = self.store.lock().await;
        txn(store.as_mut(), |t| {
            let event = Event::new(
                &pin_event.pin.namespace,
                EventType::BatchPinComplete,
                &pin_event.pin.batch_id,
            );
            let event = t.insert_event(event)?;

            for (index, entry) in pin_event.pin.contexts.iter().enumerate() {
                let mut pin = Pin::new(
                    &pin_event.pin.namespace,
                    &pin_event.pin.batch_id,
                    entry.context,
                    &pin_event.signer,
                    entry.nonce,
                    index as u64,
                );
                pin.sequence = Some(event.sequence);
                pin.payload_ref = pin_event.pin.payload_ref.clone();
                pin.batch_hash = Some(pin_event.pin.batch_hash);
                t.upsert_pin(&pin)?;
            }

            // Record the ledger transaction hash against our own submission.
            if let Some(batch) = t.get_batch(&pin_event.pin.namespace, &pin_event.pin.batch_id)? {
                if let Some(tx_ref) = &batch.batch.tx {
                    t.add_blockchain_id(
                        &pin_event.pin.namespace,
                        &tx_ref.id,
                        &pin_event.transaction_hash,
                    )?;
                }
            }
            Ok(())
        })
        .map_err(|e| CoreError::Internal(e.into()))?;
        Ok(())
    }

    /// A batch payload arrived, over data exchange or fetched from shared
    /// storage. Verifies the content hash before anything is persisted.
    pub(crate) async fn batch_payload_arrived(
        &self,
        envelope: &BatchEnvelope,
    ) -> Result<(), CoreError> {
        let computed = HashType::new(Hasher::digest(&envelope.payload));
        if computed != envelope.meta.hash {
            return Err(CoreError::IntegrityViolation(format!(
                "Batch {} payload hash mismatch: expected {} got {computed}",
                envelope.meta.id, envelope.meta.hash
            )));
        }

        let payload = crate::types::BatchPayload::decode(&envelope.payload)
            .map_err(|e| CoreError::InvalidInput(format!("Undecodable batch payload: {e}")))?;
        for message in &payload.messages {
            if !message
                .verify_hash()
                .map_err(CoreError::Internal)?
            {
                return Err(CoreError::IntegrityViolation(format!(
                    "Message {} in batch {} fails hash verification",
                    message.id, envelope.meta.id
                )));
            }
        }

        let meta = envelope.meta.clone();
        log::debug!(
            "Batch payload arrived: batch={} messages={} data={}",
            meta.id,
            payload.messages.len(),
            payload.data.len()
        );

        let mut store = self.store.lock().await;
        txn(store.as_mut(), |t| {
            if let Some(group) = &meta.group_definition {
                t.upsert_group(group)?;
            }

            let batch = Batch {
                id: meta.id.clone(),
                namespace: meta.namespace.clone(),
                author: meta.author.clone(),
                group: meta.group,
                batch_type: meta.batch_type,
                payload: payload.clone(),
                hash: meta.hash,
                created: meta.created,
                tx: meta.tx.clone(),
            };
            t.upsert_batch(&BatchRecord {
                batch,
                sealed: true,
            })?;

            for data in &payload.data {
                t.upsert_data(data)?;
            }
            for message in &payload.messages {
                t.upsert_message(&MessageRecord {
                    message: message.clone(),
                    state: MessageState::Sent,
                    batch: Some(meta.id.clone()),
                })?;
            }

            t.insert_event(Event::new(
                &meta.namespace,
                EventType::MessageArrived,
                &meta.id,
            ))?;
            Ok(())
        })
        .map_err(|e| CoreError::Internal(e.into()))?;
        Ok(())
    }

    /// A blob became locally available.
    pub(crate) async fn blob_received(
        &self,
        namespace: &str,
        hash: &HashType,
        size: u64,
    ) -> Result<(), CoreError> {
        log::debug!("Blob received: {hash} ({size} bytes)");
        let mut store = self.store.lock().await;
        txn(store.as_mut(), |t| {
            t.insert_blob(hash, size)?;
            t.insert_event(Event::new(namespace, EventType::BlobReceived, &hash.hex()))?;
            Ok(())
        })
        .map_err(|e| CoreError::Internal(e.into()))?;
        Ok(())
    }

    /// A plugin reported the terminal state of a long-running submission.
    pub(crate) async fn operation_update(
        &self,
        namespace: &str,
        op_id: &EntityId,
        status: OpStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
        blockchain_id: Option<String>,
    ) -> Result<(), CoreError> {
        let mut store = self.store.lock().await;
        txn(store.as_mut(), |t| {
            let Some(mut op) = t.get_operation(namespace, op_id)? else {
                log::warn!("Operation update for unknown operation: {op_id}");
                return Ok(());
            };
            if op.status == status {
                return Ok(());
            }
            if !op.status.can_transition_to(status) {
                log::warn!(
                    "Dropping non-monotonic operation transition {} -> {} for {op_id}",
                    op.status.as_str(),
                    status.as_str()
                );
                return Ok(());
            }

            op.status = status;
            op.output = output.clone();
            op.error = error.clone();
            op.updated = crate::utilities::time::now_millis();
            t.update_operation(&op)?;

            if let Some(chain_id) = &blockchain_id {
                t.add_blockchain_id(namespace, &op.tx, chain_id)?;
            }

            match status {
                OpStatus::Succeeded => {
                    t.insert_event(
                        Event::new(namespace, EventType::OperationSucceeded, op_id)
                            .with_tx(&op.tx),
                    )?;
                }
                OpStatus::Failed => {
                    t.insert_event(
                        Event::new(namespace, EventType::OperationFailed, op_id).with_tx(&op.tx),
                    )?;
                }
                _ => {}
            }
            Ok(())
        })
        .map_err(|e| CoreError::Internal(e.into()))?;
        Ok(())
    }

    /// Token plugin confirmations; the node records the fact without
    /// interpreting pool or transfer semantics.
    pub(crate) async fn token_event(
        &self,
        namespace: &str,
        event_type: EventType,
        reference: &EntityId,
        tx: Option<&EntityId>,
    ) -> Result<(), CoreError> {
        debug_assert!(matches!(
            event_type,
            EventType::TokenPoolConfirmed
                | EventType::TokenTransferConfirmed
                | EventType::TokenApprovalConfirmed
        ));
        let mut store = self.store.lock().await;
        txn(store.as_mut(), |t| {
            let mut event = Event::new(namespace, event_type, reference);
            if let Some(tx_id) = tx {
                event = event.with_tx(tx_id);
            }
            t.insert_event(event)?;
            Ok(())
        })
        .map_err(|e| CoreError::Internal(e.into()))?;
        Ok(())
    }

    /// Quarantine a pin that failed an integrity check, emitting an event for
    /// operator attention. The aggregator skips past it to preserve liveness.
    pub(crate) async fn quarantine_pin(
        &self,
        pin: &Pin,
        reason: &str,
    ) -> Result<(), CoreError> {
        log::error!(
            "Quarantining pin (context={} signer={} nonce={}): {reason}",
            pin.context,
            pin.signer,
            pin.nonce
        );
        let mut store = self.store.lock().await;
        txn(store.as_mut(), |t| {
            t.update_pin_state(&pin.context, &pin.signer, pin.nonce, PinState::Quarantined)?;
            t.insert_event(
                Event::new(&pin.namespace, EventType::PinQuarantined, &pin.batch)
                    .with_topic(&pin.context.hex()),
            )?;
            Ok(())
        })
        .map_err(|e| CoreError::Internal(e.into()))?;
        Ok(())
    }
}
