//! Aggregator: turns the on-chain pin order plus local data availability into
//! delivered messages. A single pump task scans waiting pins in ledger order;
//! a pin whose message is not yet deliverable stays waiting and is revisited
//! once its missing piece arrives (payload, blob, predecessor nonce or
//! correlated message). Readiness failures are never errors, just "not yet".

use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::sync::mpsc;

use crate::config::AggregatorConfig;
use crate::core::shutdown::Shutdown;
use crate::events::EventIngress;
use crate::plugins::{BatchEnvelope, BatchMeta, PluginRegistry};
use crate::storage::{
    txn, Filter, OffsetType, Query, SharedStore, SortDir, StorageTxn,
};
use crate::types::{
    Batch, BatchType, Event, EventType, Message, MessageState, Pin, PinState,
};
use crate::utilities::hash::{ContentHasher, HashType, Hasher};
use crate::utilities::time::now_millis;

const OFFSET_NAME: &str = "pins";

/// What happened to one examined pin.
#[derive(Debug, PartialEq)]
enum PinOutcome {
    Delivered,
    /// Not ready; left waiting for a later pass.
    Parked,
    /// Consumed without delivery: duplicate, rejected or quarantined.
    Skipped,
}

pub(crate) struct Aggregator {
    config: AggregatorConfig,
    store: SharedStore,
    plugins: PluginRegistry,
    ingress: EventIngress,
    local_node: String,
    wake_rx: mpsc::Receiver<()>,
    /// De-dup for payload/blob re-requests so a parked context does not spam
    /// the transfer plugins on every pass.
    requested_batches: LruCache<String, ()>,
    requested_blobs: LruCache<String, ()>,
}

impl Aggregator {
    pub(crate) fn new(
        config: AggregatorConfig,
        store: SharedStore,
        plugins: PluginRegistry,
        ingress: EventIngress,
        local_node: &str,
        wake_rx: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            config,
            store,
            plugins,
            ingress,
            local_node: local_node.to_string(),
            wake_rx,
            requested_batches: LruCache::new(NonZeroUsize::new(1000).expect("non-zero")),
            requested_blobs: LruCache::new(NonZeroUsize::new(1000).expect("non-zero")),
        }
    }

    pub(crate) async fn run(mut self, mut shutdown: Shutdown) {
        // Catch up on anything that landed while we were down.
        self.pump_until_idle().await;

        loop {
            tokio::select! {
                _ = shutdown.shutdown_signal_rcv.recv() => {
                    log::info!("Shutting down aggregator");
                    break;
                }
                wake = self.wake_rx.recv() => {
                    if wake.is_none() {
                        break;
                    }
                    self.pump_until_idle().await;
                }
            }
        }
    }

    pub(crate) async fn pump_until_idle(&mut self) {
        loop {
            match self.pump().await {
                Ok(true) => continue,
                Ok(false) => return,
                Err(err) => {
                    log::error!("Aggregator pump failed: {err}");
                    return;
                }
            }
        }
    }

    /// One pass over waiting pins in ledger order. Returns whether anything
    /// was consumed (so the caller loops until a pass makes no progress).
    async fn pump(&mut self) -> anyhow::Result<bool> {
        let page_size = self.config.read_page_size;
        let lookback = self.config.rewind_lookback as i64;

        let (offset, scan_from) = {
            let mut store = self.store.lock().await;
            txn(store.as_mut(), |t| {
                let offset = t.get_offset(OffsetType::Aggregator, OFFSET_NAME)?.unwrap_or(0);

                // Parked pins sit below the offset; rescan from the lowest of
                // them, bounded by the lookback window.
                let lowest = t
                    .query_pins(
                        &Query::new()
                            .filter(Filter::And(vec![
                                Filter::Eq("state", PinState::Waiting.as_str().into()),
                                Filter::NotNull("sequence"),
                            ]))
                            .sort("sequence", SortDir::Asc)
                            .limit(1),
                    )?
                    .first()
                    .and_then(|p| p.sequence);

                let floor = offset.saturating_sub(lookback);
                let scan_from = match lowest {
                    Some(lowest) if lowest - 1 < offset => (lowest - 1).max(floor),
                    _ => offset,
                };
                Ok((offset, scan_from))
            })?
        };

        let mut cursor = scan_from;
        let mut progressed = false;
        let mut max_seen = offset;
        loop {
            let pins = {
                let mut store = self.store.lock().await;
                txn(store.as_mut(), |t| {
                    t.query_pins(
                        &Query::new()
                            .filter(Filter::And(vec![
                                Filter::Eq("state", PinState::Waiting.as_str().into()),
                                Filter::Gt("sequence", cursor.into()),
                            ]))
                            .sort("sequence", SortDir::Asc)
                            .sort("batch_index", SortDir::Asc)
                            .limit(page_size),
                    )
                })?
            };
            if pins.is_empty() {
                break;
            }
            let full_page = pins.len() == page_size;

            for pin in &pins {
                let sequence = pin.sequence.unwrap_or(cursor);
                cursor = cursor.max(sequence);
                match self.process_pin(pin, offset).await {
                    Ok(PinOutcome::Delivered) | Ok(PinOutcome::Skipped) => {
                        progressed = true;
                        max_seen = max_seen.max(sequence);
                    }
                    Ok(PinOutcome::Parked) => {
                        max_seen = max_seen.max(sequence);
                    }
                    Err(err) => {
                        log::error!(
                            "Failed to process pin (context={} nonce={}): {err}",
                            pin.context,
                            pin.nonce
                        );
                    }
                }
            }

            // Parked pins do not stop the scan; the cursor moves past them
            // and the next pass rewinds to the lowest one still waiting.
            if !full_page {
                break;
            }
        }

        if max_seen > offset {
            let mut store = self.store.lock().await;
            txn(store.as_mut(), |t| {
                t.upsert_offset(OffsetType::Aggregator, OFFSET_NAME, max_seen)
            })?;
        }
        Ok(progressed)
    }

    async fn process_pin(&mut self, pin: &Pin, offset: i64) -> anyhow::Result<PinOutcome> {
        // (a) The batch payload must be locally present.
        let batch = {
            let mut store = self.store.lock().await;
            txn(store.as_mut(), |t| t.get_batch(&pin.namespace, &pin.batch))?
        };
        let Some(record) = batch else {
            self.request_payload(pin).await;
            return Ok(PinOutcome::Parked);
        };
        let batch = record.batch;

        if let Some(expected) = pin.batch_hash {
            if batch.hash != expected {
                self.ingress
                    .quarantine_pin(pin, "Stored batch hash does not match the pinned hash")
                    .await?;
                return Ok(PinOutcome::Skipped);
            }
        }
        if batch.payload.messages.is_empty() {
            self.request_payload(pin).await;
            return Ok(PinOutcome::Parked);
        }

        // Signer must resolve, and for private groups must be a member node.
        let signer_identity = self
            .plugins
            .identity
            .resolve_signing_key(&pin.signer)
            .await
            .map_err(|e| anyhow::anyhow!("Identity resolution failed: {e}"))?;
        let Some(signer_identity) = signer_identity else {
            self.ingress
                .quarantine_pin(pin, "Pin signer does not resolve to a known identity")
                .await?;
            return Ok(PinOutcome::Skipped);
        };
        if batch.batch_type == BatchType::Private {
            let group = match batch.group.as_ref() {
                Some(hash) => {
                    let mut store = self.store.lock().await;
                    txn(store.as_mut(), |t| t.get_group(hash))?
                }
                None => None,
            };
            match group {
                Some(group) if group.has_node(&signer_identity.node) => {}
                Some(_) => {
                    self.ingress
                        .quarantine_pin(pin, "Pin signer is not a member of the batch group")
                        .await?;
                    return Ok(PinOutcome::Skipped);
                }
                None => return Ok(PinOutcome::Parked),
            }
        }

        // Map this pin back to its (message, topic) slot in the payload.
        let Some((message, _topic_index)) = locate_message(&batch, pin.batch_index) else {
            self.ingress
                .quarantine_pin(pin, "Pin index does not map to a payload message")
                .await?;
            return Ok(PinOutcome::Skipped);
        };
        let message = message.clone();
        let author = message.header.author.clone();

        // All pins this message carries, across every topic.
        let message_pins = self.pins_of_message(&batch, &message, pin).await?;
        let Some(message_pins) = message_pins else {
            return Ok(PinOutcome::Parked);
        };

        // (c) Every context must be exactly at this message's nonce.
        let mut store = self.store.lock().await;
        enum NonceCheck {
            Ready,
            Behind,
            AlreadyDelivered,
        }
        let nonce_check = txn(store.as_mut(), |t| {
            let mut check = NonceCheck::Ready;
            for p in &message_pins {
                let expected = t.get_next_pin(&p.context, &author)?;
                if expected > p.nonce {
                    check = NonceCheck::AlreadyDelivered;
                    break;
                }
                if expected < p.nonce {
                    check = NonceCheck::Behind;
                    break;
                }
            }
            Ok(check)
        })?;
        drop(store);

        match nonce_check {
            NonceCheck::Ready => {}
            NonceCheck::AlreadyDelivered => {
                // The message was delivered through another pin row; this one
                // is a leftover and just gets consumed.
                let mut store = self.store.lock().await;
                txn(store.as_mut(), |t| {
                    t.update_pin_state(&pin.context, &pin.signer, pin.nonce, PinState::Dispatched)
                })?;
                return Ok(PinOutcome::Skipped);
            }
            NonceCheck::Behind => {
                // A predecessor on some context has not been delivered. A gap
                // that has aged past the lookback window blocks liveness and
                // is quarantined instead.
                let aged_out = pin
                    .sequence
                    .is_some_and(|s| s <= offset.saturating_sub(self.config.rewind_lookback as i64));
                if aged_out {
                    self.ingress
                        .quarantine_pin(pin, "Nonce gap aged past the rewind lookback")
                        .await?;
                    return Ok(PinOutcome::Skipped);
                }
                return Ok(PinOutcome::Parked);
            }
        }

        // (b) Data rows and their blobs must be locally present and honest.
        let data_state = self.check_data(&batch, &message).await?;
        match data_state {
            DataState::Ready => {}
            DataState::MissingBlob(blob) => {
                self.request_blob(&author, &blob).await;
                return Ok(PinOutcome::Parked);
            }
            DataState::Corrupt(reason) => {
                self.reject(&message, &message_pins, &author, offset, &reason)
                    .await?;
                return Ok(PinOutcome::Skipped);
            }
        }

        // (d) A correlated predecessor must exist and be settled, within grace.
        if let Some(cid) = &message.header.cid {
            let prior = {
                let mut store = self.store.lock().await;
                txn(store.as_mut(), |t| t.get_message(&message.header.namespace, cid))?
            };
            match prior {
                Some(prior)
                    if matches!(
                        prior.state,
                        MessageState::Confirmed | MessageState::Rejected
                    ) => {}
                Some(_) => return Ok(PinOutcome::Parked),
                None => {
                    let grace_over =
                        now_millis() > message.header.created + self.config.cid_grace_ms;
                    if !grace_over {
                        return Ok(PinOutcome::Parked);
                    }
                    // The chain predecessor never reached this node; deliver
                    // rather than block the context forever.
                    log::warn!(
                        "Message {} correlates to unknown message {cid}; grace expired",
                        message.id
                    );
                }
            }
        }

        self.deliver(&batch, &message, &message_pins, &author, offset)
            .await?;
        Ok(PinOutcome::Delivered)
    }

    /// All pin rows belonging to one message of a batch, one per topic.
    /// `None` when some of them have not been observed on-chain yet.
    async fn pins_of_message(
        &mut self,
        batch: &Batch,
        message: &Message,
        seen: &Pin,
    ) -> anyhow::Result<Option<Vec<Pin>>> {
        let range = message_pin_range(batch, &message.id)
            .ok_or_else(|| anyhow::anyhow!("Message {} not in its own batch", message.id))?;

        let mut store = self.store.lock().await;
        let pins = txn(store.as_mut(), |t| t.pins_for_batch(&seen.namespace, &batch.id))?;
        let mut of_message: Vec<Pin> = pins
            .into_iter()
            .filter(|p| range.contains(&p.batch_index))
            .collect();
        of_message.sort_by_key(|p| p.batch_index);

        if of_message.len() as u64 != range.end - range.start
            || of_message.iter().any(|p| p.sequence.is_none())
        {
            return Ok(None);
        }
        Ok(Some(of_message))
    }

    async fn check_data(&mut self, batch: &Batch, message: &Message) -> anyhow::Result<DataState> {
        let mut store = self.store.lock().await;
        let namespace = message.header.namespace.clone();
        let state = txn(store.as_mut(), |t| {
            for data_ref in &message.data {
                let Some(data) = t.get_data(&namespace, &data_ref.id)? else {
                    return Ok(DataState::Corrupt(format!(
                        "Data {} missing from batch {}",
                        data_ref.id, batch.id
                    )));
                };
                if data.hash != data_ref.hash {
                    return Ok(DataState::Corrupt(format!(
                        "Data {} hash does not match the message reference",
                        data.id
                    )));
                }
                if let Some(blob) = &data.blob {
                    if !t.has_blob(&blob.hash)? {
                        return Ok(DataState::MissingBlob(blob.hash));
                    }
                }
            }
            Ok(DataState::Ready)
        })?;
        Ok(state)
    }

    /// Commit delivery: message confirmed, nonces advanced, pins consumed and
    /// the stream offset persisted, all in one transaction.
    async fn deliver(
        &mut self,
        batch: &Batch,
        message: &Message,
        message_pins: &[Pin],
        author: &str,
        offset: i64,
    ) -> anyhow::Result<()> {
        let mut store = self.store.lock().await;
        txn(store.as_mut(), |t| {
            t.update_message_state(
                &message.header.namespace,
                &message.id,
                MessageState::Confirmed,
                Some(&batch.id),
            )?;

            let mut event = Event::new(
                &message.header.namespace,
                EventType::MessageConfirmed,
                &message.id,
            );
            if let Some(topic) = message.header.topics.first() {
                event = event.with_topic(topic);
            }
            if let Some(tx) = &batch.tx {
                event = event.with_tx(&tx.id);
            }
            t.insert_event(event)?;

            let mut max_sequence = offset;
            for p in message_pins {
                t.set_next_pin(&p.context, author, p.nonce + 1)?;
                t.update_pin_state(&p.context, &p.signer, p.nonce, PinState::Dispatched)?;
                if let Some(s) = p.sequence {
                    max_sequence = max_sequence.max(s);
                }
            }
            t.upsert_offset(OffsetType::Aggregator, OFFSET_NAME, max_sequence)?;
            Ok(())
        })?;

        log::info!(
            "Delivered message {} (author={author}, batch={})",
            message.id,
            batch.id
        );
        Ok(())
    }

    /// Terminal rejection: the nonce is still consumed so the stream moves on.
    async fn reject(
        &mut self,
        message: &Message,
        message_pins: &[Pin],
        author: &str,
        offset: i64,
        reason: &str,
    ) -> anyhow::Result<()> {
        log::error!("Rejecting message {}: {reason}", message.id);
        let mut store = self.store.lock().await;
        txn(store.as_mut(), |t| {
            t.update_message_state(
                &message.header.namespace,
                &message.id,
                MessageState::Rejected,
                None,
            )?;
            t.insert_event(Event::new(
                &message.header.namespace,
                EventType::MessageRejected,
                &message.id,
            ))?;

            let mut max_sequence = offset;
            for p in message_pins {
                t.set_next_pin(&p.context, author, p.nonce + 1)?;
                t.update_pin_state(&p.context, &p.signer, p.nonce, PinState::Dispatched)?;
                if let Some(s) = p.sequence {
                    max_sequence = max_sequence.max(s);
                }
            }
            t.upsert_offset(OffsetType::Aggregator, OFFSET_NAME, max_sequence)?;
            Ok(())
        })?;
        Ok(())
    }

    /// Fetch a missing batch payload: broadcast pulls from shared storage,
    /// private asks the originating node to resend. De-duplicated per batch.
    async fn request_payload(&mut self, pin: &Pin) {
        if self.requested_batches.put(pin.batch.clone(), ()).is_some() {
            return;
        }

        if let Some(payload_ref) = &pin.payload_ref {
            match self.plugins.shared_storage.download_data(payload_ref).await {
                Ok(bytes) => {
                    if let Err(err) = self.ingest_downloaded(pin, bytes).await {
                        log::error!("Failed to ingest downloaded batch {}: {err}", pin.batch);
                    }
                }
                Err(err) => {
                    log::warn!("Shared storage fetch of {payload_ref} failed: {err}");
                    self.requested_batches.pop(&pin.batch);
                }
            }
            return;
        }

        // Private: find the signer's node and ask for a resend.
        let node = match self.plugins.identity.resolve_signing_key(&pin.signer).await {
            Ok(Some(identity)) => identity.node,
            _ => {
                log::warn!("Cannot request batch {}: unresolvable signer", pin.batch);
                return;
            }
        };
        if let Err(err) = self
            .plugins
            .data_exchange
            .request_batch(&node, &pin.namespace, &pin.batch)
            .await
        {
            log::warn!("Batch resend request to {node} failed: {err}");
            self.requested_batches.pop(&pin.batch);
        }
    }

    async fn ingest_downloaded(&self, pin: &Pin, bytes: Vec<u8>) -> anyhow::Result<()> {
        let computed = HashType::new(Hasher::digest(&bytes));
        if let Some(expected) = pin.batch_hash {
            if computed != expected {
                self.ingress
                    .quarantine_pin(pin, "Downloaded payload does not match the pinned hash")
                    .await?;
                return Ok(());
            }
        }

        let author = self
            .plugins
            .identity
            .author_for_key(&pin.signer)
            .await
            .map_err(|e| anyhow::anyhow!("Identity resolution failed: {e}"))?
            .ok_or_else(|| anyhow::anyhow!("No author registered for signer {}", pin.signer))?;

        let envelope = BatchEnvelope {
            meta: BatchMeta {
                id: pin.batch.clone(),
                namespace: pin.namespace.clone(),
                author,
                group: None,
                group_definition: None,
                batch_type: BatchType::Broadcast,
                hash: computed,
                created: now_millis(),
                tx: None,
            },
            payload: bytes,
        };
        self.ingress.batch_payload_arrived(&envelope).await?;
        Ok(())
    }

    async fn request_blob(&mut self, author: &str, hash: &HashType) {
        if self.requested_blobs.put(hash.hex(), ()).is_some() {
            return;
        }
        let node = match self.plugins.identity.node_for_author(author).await {
            Ok(Some(node)) if node != self.local_node => node,
            _ => return,
        };
        if let Err(err) = self.plugins.data_exchange.request_blob(&node, hash).await {
            log::warn!("Blob request to {node} for {hash} failed: {err}");
            self.requested_blobs.pop(&hash.hex());
        }
    }
}

enum DataState {
    Ready,
    MissingBlob(HashType),
    Corrupt(String),
}

/// The flattened (message, topic) pin index range a message occupies.
fn message_pin_range(batch: &Batch, message_id: &str) -> Option<std::ops::Range<u64>> {
    let mut start = 0u64;
    for message in &batch.payload.messages {
        let width = message.header.topics.len() as u64;
        if message.id == message_id {
            return Some(start..start + width);
        }
        start += width;
    }
    None
}

/// The message and topic a flattened pin index points at.
fn locate_message(batch: &Batch, batch_index: u64) -> Option<(&Message, usize)> {
    let mut start = 0u64;
    for message in &batch.payload.messages {
        let width = message.header.topics.len() as u64;
        if batch_index < start + width {
            return Some((message, (batch_index - start) as usize));
        }
        start += width;
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::message::new_header;
    use crate::types::MessageType;

    fn batch_with_topics(topic_sets: Vec<Vec<&str>>) -> Batch {
        let mut batch = Batch::open("ns1", "did:org/alice", None, BatchType::Broadcast);
        for topics in topic_sets {
            let header = new_header(
                "ns1",
                "did:org/alice",
                MessageType::Broadcast,
                topics.into_iter().map(String::from).collect(),
            );
            batch
                .payload
                .messages
                .push(Message::new(header, vec![]).unwrap());
        }
        batch.recompute_hash().unwrap();
        batch
    }

    #[test]
    fn test_locate_message_flattened() {
        let batch = batch_with_topics(vec![vec!["a", "b"], vec!["c"]]);
        let m0 = batch.payload.messages[0].id.clone();
        let m1 = batch.payload.messages[1].id.clone();

        assert_eq!(locate_message(&batch, 0).unwrap().0.id, m0);
        assert_eq!(locate_message(&batch, 1).unwrap().0.id, m0);
        assert_eq!(locate_message(&batch, 1).unwrap().1, 1);
        assert_eq!(locate_message(&batch, 2).unwrap().0.id, m1);
        assert!(locate_message(&batch, 3).is_none());
    }

    #[test]
    fn test_message_pin_range() {
        let batch = batch_with_topics(vec![vec!["a", "b"], vec!["c"]]);
        let m0 = batch.payload.messages[0].id.clone();
        let m1 = batch.payload.messages[1].id.clone();

        assert_eq!(message_pin_range(&batch, &m0), Some(0..2));
        assert_eq!(message_pin_range(&batch, &m1), Some(2..3));
        assert_eq!(message_pin_range(&batch, "nope"), None);
    }
}
