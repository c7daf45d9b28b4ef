//! Reconciliation sweep: Pending operations that have outlived the stale
//! threshold are checked against the owning plugin, whose answer is
//! authoritative for the terminal transition.

use std::time::Duration;

use crate::config::OperationConfig;
use crate::core::shutdown::Shutdown;
use crate::events::EventIngress;
use crate::plugins::{OpPollStatus, PluginRegistry};
use crate::storage::{txn, Filter, Query, SharedStore, SortDir, StorageTxn};
use crate::types::{OpStatus, OpType, Operation};
use crate::utilities::time::now_millis;

pub(crate) struct Reconciler {
    store: SharedStore,
    plugins: PluginRegistry,
    ingress: EventIngress,
    config: OperationConfig,
}

impl Reconciler {
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

    pub(crate) async fn run(self, mut shutdown: Shutdown) {
        let interval = Duration::from_millis(self.config.reconcile_interval_ms);
        loop {
            tokio::select! {
                _ = shutdown.shutdown_signal_rcv.recv() => {
                    log::info!("Shutting down operation reconciler");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    if let Err(err) = self.sweep().await {
                        log::error!("Operation reconciliation sweep failed: {err}");
                    }
                }
            }
        }
    }

    pub(crate) async fn sweep(&self) -> anyhow::Result<()> {
        let cutoff = now_millis().saturating_sub(self.config.stale_ms);
        let stale = {
            let mut store = self.store.lock().await;
            txn(store.as_mut(), |t| {
                t.query_operations(
                    &Query::new()
                        .filter(Filter::And(vec![
                            Filter::Eq("status", OpStatus::Pending.as_str().into()),
                            Filter::Lt("updated", cutoff.into()),
                        ]))
                        .sort("updated", SortDir::Asc)
                        .limit(100),
                )
            })?
        };

        for op in stale {
            if let Err(err) = self.reconcile(&op).await {
                log::error!("Failed to reconcile operation {}: {err}", op.id);
            }
        }
        Ok(())
    }

    async fn reconcile(&self, op: &Operation) -> anyhow::Result<()> {
        let key = op.idempotency_key()?;
        let polled = match op.op_type {
            OpType::BlockchainPinBatch | OpType::BlockchainNetworkAction => {
                self.plugins.blockchain.operation_status(&key).await?
            }
            OpType::TokenCreatePool
            | OpType::TokenMint
            | OpType::TokenBurn
            | OpType::TokenTransfer
            | OpType::TokenApproval => self.plugins.tokens.operation_status(&key).await?,
            // Transfer plugins have no status query; an accepted transfer
            // that never called back is treated as lost.
            OpType::SharedStorageUploadBatch
            | OpType::DataExchangeSendBatch
            | OpType::DataExchangeSendBlob => OpPollStatus::Unknown,
        };

        log::debug!("Reconciled operation {}: {polled:?}", op.id);
        match polled {
            OpPollStatus::Pending => Ok(()),
            OpPollStatus::Succeeded { output } => {
                self.ingress
                    .operation_update(
                        &op.namespace,
                        &op.id,
                        OpStatus::Succeeded,
                        output,
                        None,
                        None,
                    )
                    .await
                    .map_err(|e| anyhow::anyhow!(e))
            }
            OpPollStatus::Failed { error } => {
                self.ingress
                    .operation_update(
                        &op.namespace,
                        &op.id,
                        OpStatus::Failed,
                        None,
                        Some(error),
                        None,
                    )
                    .await
                    .map_err(|e| anyhow::anyhow!(e))
            }
            OpPollStatus::Unknown => {
                self.ingress
                    .operation_update(
                        &op.namespace,
                        &op.id,
                        OpStatus::Failed,
                        None,
                        Some("Plugin has no record of this submission".to_string()),
                        None,
                    )
                    .await
                    .map_err(|e| anyhow::anyhow!(e))
            }
        }
    }
}
