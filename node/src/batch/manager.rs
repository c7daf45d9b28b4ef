//! Batch manager: one in-memory dispatcher per (namespace, author, group,
//! privacy class). Dispatchers drain staged messages into an open batch and
//! seal it on count, size or age. Sealing assigns nonces and writes pins in
//! the same transaction; it is the only irreversible step, and everything
//! before it rolls back to `staged` on failure.

use std::collections::HashMap;
use std::time::Duration;

use futures_timer::Delay;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::BatchConfig;
use crate::operations::Backoff;
use crate::storage::{
    txn, Filter, FilterValue, Query, SharedStore, SortDir, StorageResult, StorageTxn,
};
use crate::types::{
    Batch, BatchRecord, BatchType, MessageState, MessageType, Pin, Transaction, TransactionType,
    TxRef,
};
use crate::utilities::time::now_millis;

use super::{DispatchKey, SealedBatch};

pub(crate) struct BatchManager {
    store: SharedStore,
    config: BatchConfig,
    signing_key: String,
    notify_rx: mpsc::Receiver<DispatchKey>,
    sealed_tx: mpsc::Sender<SealedBatch>,
    dispatcher_shutdown: broadcast::Sender<()>,
    dispatchers: HashMap<DispatchKey, DispatcherHandle>,
}

struct DispatcherHandle {
    wake_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl BatchManager {
    pub(crate) fn new(
        store: SharedStore,
        config: BatchConfig,
        signing_key: &str,
        notify_rx: mpsc::Receiver<DispatchKey>,
        sealed_tx: mpsc::Sender<SealedBatch>,
    ) -> Self {
        let (dispatcher_shutdown, _) = broadcast::channel(1);
        Self {
            store,
            config,
            signing_key: signing_key.to_string(),
            notify_rx,
            sealed_tx,
            dispatcher_shutdown,
            dispatchers: HashMap::new(),
        }
    }

    pub(crate) async fn run(mut self, mut shutdown: crate::core::shutdown::Shutdown) {
        // Anything staged before a restart still needs a dispatcher.
        if let Err(err) = self.recover().await {
            log::error!("Batch manager recovery failed: {err}");
        }

        loop {
            tokio::select! {
                _ = shutdown.shutdown_signal_rcv.recv() => {
                    log::info!("Shutting down batch manager");
                    let _ = self.dispatcher_shutdown.send(());
                    for (_, handle) in self.dispatchers.drain() {
                        let _ = handle.task.await;
                    }
                    break;
                }
                Some(key) = self.notify_rx.recv() => {
                    self.wake(key);
                }
            }
        }
    }

    async fn recover(&mut self) -> anyhow::Result<()> {
        let keys: Vec<DispatchKey> = {
            let mut store = self.store.lock().await;
            let records = txn(store.as_mut(), |t| {
                t.query_messages(
                    &Query::new()
                        .filter(Filter::In(
                            "state",
                            vec![
                                MessageState::Staged.as_str().into(),
                                MessageState::Ready.as_str().into(),
                            ],
                        ))
                        .sort("created", SortDir::Asc),
                )
            })?;
            records
                .iter()
                .map(|r| DispatchKey {
                    namespace: r.message.header.namespace.clone(),
                    author: r.message.header.author.clone(),
                    group: r.message.header.group,
                    private: r.message.header.message_type.is_private(),
                })
                .collect()
        };
        for key in keys {
            self.wake(key);
        }
        Ok(())
    }

    fn wake(&mut self, key: DispatchKey) {
        if let Some(handle) = self.dispatchers.get(&key) {
            if handle.task.is_finished() {
                self.dispatchers.remove(&key);
            }
        }

        let config = self.config.clone();
        let handle = self.dispatchers.entry(key.clone()).or_insert_with(|| {
            log::debug!("Spawning batch dispatcher for {key:?}");
            let (wake_tx, wake_rx) = mpsc::channel(1);
            let dispatcher = BatchDispatcher {
                key,
                config,
                signing_key: self.signing_key.clone(),
                store: self.store.clone(),
                sealed_tx: self.sealed_tx.clone(),
                wake_rx,
                shutdown_rx: self.dispatcher_shutdown.subscribe(),
                open: None,
            };
            DispatcherHandle {
                wake_tx,
                task: tokio::spawn(dispatcher.run()),
            }
        });

        // Notify-or-drop: a dispatcher that misses this re-reads staged rows
        // on its next wakeup anyway.
        let _ = handle.wake_tx.try_send(());
    }
}

struct BatchDispatcher {
    key: DispatchKey,
    config: BatchConfig,
    signing_key: String,
    store: SharedStore,
    sealed_tx: mpsc::Sender<SealedBatch>,
    wake_rx: mpsc::Receiver<()>,
    shutdown_rx: broadcast::Receiver<()>,
    open: Option<Batch>,
}

enum AssembleOutcome {
    /// Batch sealed and handed over; more staged rows may remain.
    Sealed { more: bool },
    /// Messages added (or none waiting); batch still open or absent.
    Open,
}

impl BatchDispatcher {
    async fn run(mut self) {
        let mut idle_since = now_millis();
        loop {
            let sleep_for = match &self.open {
                Some(batch) => {
                    let age = now_millis().saturating_sub(batch.created);
                    Duration::from_millis(self.config.timeout_ms.saturating_sub(age))
                }
                None => {
                    let idle = now_millis().saturating_sub(idle_since);
                    Duration::from_millis(self.config.quiesce_ms.saturating_sub(idle))
                }
            };

            tokio::select! {
                _ = self.shutdown_rx.recv() => break,
                wake = self.wake_rx.recv() => {
                    if wake.is_none() {
                        break;
                    }
                    self.assemble().await;
                    idle_since = now_millis();
                }
                _ = Delay::new(sleep_for) => {
                    match &self.open {
                        Some(_) => {
                            // Age-based seal.
                            self.assemble().await;
                            idle_since = now_millis();
                        }
                        None => {
                            log::debug!("Batch dispatcher for {:?} quiescing", self.key);
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Drain staged messages and seal when a criterion is met, retrying
    /// forever on storage errors, since staged work is still wanted.
    async fn assemble(&mut self) {
        let mut backoff = Backoff::new(
            self.config.retry_initial_ms,
            2,
            self.config.retry_max_ms,
        );
        loop {
            match self.fill_and_seal().await {
                Ok(AssembleOutcome::Sealed { more: true }) => {
                    backoff.reset();
                    continue;
                }
                Ok(_) => return,
                Err(err) => {
                    let delay = backoff.next_delay();
                    log::error!(
                        "Batch assembly for {:?} failed ({err}), retrying in {delay:?}",
                        self.key
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn fill_and_seal(&mut self) -> StorageResult<AssembleOutcome> {
        let key = self.key.clone();
        let max_messages = self.config.max_messages;
        let mut open = self.open.clone();

        // Step one: attach staged messages to the open batch.
        let more = {
            let mut store = self.store.lock().await;
            txn(store.as_mut(), |t| {
                if open.is_none() {
                    open = t.find_open_batch(
                        &key.namespace,
                        &key.author,
                        key.group.as_ref(),
                        key.private,
                    )?;
                }

                let room = max_messages.saturating_sub(
                    open.as_ref().map_or(0, |b| b.payload.messages.len()),
                );
                if room == 0 {
                    return Ok(false);
                }

                let staged = t.query_messages(&staged_query(&key, room))?;
                if staged.is_empty() {
                    return Ok(false);
                }

                let batch = open.get_or_insert_with(|| {
                    Batch::open(
                        &key.namespace,
                        &key.author,
                        key.group,
                        if key.private {
                            BatchType::Private
                        } else {
                            BatchType::Broadcast
                        },
                    )
                });

                let full_page = staged.len() == room;
                for record in staged {
                    let message = record.message;
                    let mut resolved = true;
                    for data_ref in &message.data {
                        match t.get_data(&key.namespace, &data_ref.id)? {
                            Some(data) => {
                                if !batch.payload.data.iter().any(|d| d.id == data.id) {
                                    batch.payload.data.push(data);
                                }
                            }
                            None => {
                                log::error!(
                                    "Message {} references missing data {}, rejecting",
                                    message.id,
                                    data_ref.id
                                );
                                t.update_message_state(
                                    &key.namespace,
                                    &message.id,
                                    MessageState::Rejected,
                                    None,
                                )?;
                                resolved = false;
                                break;
                            }
                        }
                    }
                    if !resolved {
                        continue;
                    }

                    t.update_message_state(
                        &key.namespace,
                        &message.id,
                        MessageState::Ready,
                        Some(&batch.id),
                    )?;
                    batch.payload.messages.push(message);
                }

                batch.recompute_hash().map_err(crate::storage::StorageError::Internal)?;
                t.upsert_batch(&BatchRecord {
                    batch: batch.clone(),
                    sealed: false,
                })?;
                Ok(full_page)
            })?
        };
        self.open = open;

        let Some(batch) = &self.open else {
            return Ok(AssembleOutcome::Open);
        };
        if batch.payload.messages.is_empty() {
            self.open = None;
            return Ok(AssembleOutcome::Open);
        }

        // Step two: seal when any criterion holds.
        let age = now_millis().saturating_sub(batch.created);
        let size = batch
            .payload
            .size_bytes()
            .map_err(crate::storage::StorageError::Internal)?;
        let full = batch.payload.messages.len() >= self.config.max_messages
            || size >= self.config.max_bytes
            || age >= self.config.timeout_ms;
        if !full {
            return Ok(AssembleOutcome::Open);
        }

        let sealed = self.seal().await?;
        if self.sealed_tx.send(sealed).await.is_err() {
            log::error!("Batch sender is gone; sealed batch will be recovered on restart");
        }
        Ok(AssembleOutcome::Sealed { more })
    }

    /// The irreversible step: final hash, nonce allocation, pin rows, state
    /// flips to `sent`, all in one transaction.
    async fn seal(&mut self) -> StorageResult<SealedBatch> {
        let mut batch = self.open.take().expect("Seal called without an open batch");
        let signing_key = self.signing_key.clone();

        let mut store = self.store.lock().await;
        let (batch, pins, group_definition) = txn(store.as_mut(), move |t| {
            batch
                .recompute_hash()
                .map_err(crate::storage::StorageError::Internal)?;

            let transaction = Transaction::new(&batch.namespace, TransactionType::BatchPin);
            t.upsert_transaction(&transaction)?;
            batch.tx = Some(TxRef {
                tx_type: TransactionType::BatchPin,
                id: transaction.id.clone(),
            });

            let mut pins = Vec::new();
            let mut batch_index = 0u64;
            for message in &batch.payload.messages {
                let contexts = message
                    .contexts()
                    .map_err(crate::storage::StorageError::Internal)?;
                for context in contexts {
                    let nonce = t.next_nonce(&context, &batch.author)?;
                    let pin = Pin::new(
                        &batch.namespace,
                        &batch.id,
                        context,
                        &signing_key,
                        nonce,
                        batch_index,
                    );
                    t.upsert_pin(&pin)?;
                    pins.push(pin);
                    batch_index += 1;
                }
            }

            for message in &batch.payload.messages {
                t.update_message_state(
                    &batch.namespace,
                    &message.id,
                    MessageState::Sent,
                    Some(&batch.id),
                )?;
            }

            t.upsert_batch(&BatchRecord {
                batch: batch.clone(),
                sealed: true,
            })?;

            let group_definition = match batch.group.as_ref() {
                Some(hash) => t.get_group(hash)?,
                None => None,
            };
            Ok((batch, pins, group_definition))
        })?;

        log::info!(
            "Sealed batch {} with {} messages, {} pins",
            batch.id,
            batch.payload.messages.len(),
            pins.len()
        );
        Ok(SealedBatch {
            batch,
            pins,
            group_definition,
        })
    }
}

fn staged_query(key: &DispatchKey, limit: usize) -> Query {
    let types: Vec<FilterValue> = if key.private {
        vec![
            MessageType::Private.as_str().into(),
            MessageType::TransferPrivate.as_str().into(),
        ]
    } else {
        vec![
            MessageType::Broadcast.as_str().into(),
            MessageType::TransferBroadcast.as_str().into(),
            MessageType::Definition.as_str().into(),
        ]
    };

    let mut clauses = vec![
        Filter::Eq("namespace", key.namespace.as_str().into()),
        Filter::Eq("author", key.author.as_str().into()),
        Filter::Eq("state", MessageState::Staged.as_str().into()),
        Filter::In("mtype", types),
    ];
    clauses.push(match &key.group {
        Some(hash) => Filter::Eq("group_hash", hash.hex().into()),
        None => Filter::Null("group_hash"),
    });

    Query::new()
        .filter(Filter::And(clauses))
        .sort("created", SortDir::Asc)
        .limit(limit)
}
