//! Batch senders: one dispatch path per batch type. Broadcast uploads the
//! canonical payload to shared storage and pins the reference; private pushes
//! the payload to every group member over data exchange, then pins. Every
//! step is an operation, so failures land in the operation log and retry
//! there; a sealed batch is never re-sealed or re-nonced.

use tokio::sync::mpsc;

use crate::core::shutdown::Shutdown;
use crate::error::CoreError;
use crate::operations::OperationRunner;
use crate::types::{BatchType, OpType};

use super::SealedBatch;

pub(crate) struct BatchSender {
    runner: OperationRunner,
    local_node: String,
    sealed_rx: mpsc::Receiver<SealedBatch>,
}

impl BatchSender {
    pub(crate) fn new(
        runner: OperationRunner,
        local_node: &str,
        sealed_rx: mpsc::Receiver<SealedBatch>,
    ) -> Self {
        Self {
            runner,
            local_node: local_node.to_string(),
            sealed_rx,
        }
    }

    pub(crate) async fn run(mut self, mut shutdown: Shutdown) {
        loop {
            tokio::select! {
                _ = shutdown.shutdown_signal_rcv.recv() => {
                    log::info!("Shutting down batch sender");
                    break;
                }
                sealed = self.sealed_rx.recv() => {
                    let Some(sealed) = sealed else { break };
                    let batch_id = sealed.batch.id.clone();
                    if let Err(err) = self.dispatch(sealed).await {
                        // The failed step is recorded as a Failed operation;
                        // retry happens there, the batch stays sealed.
                        log::error!("Dispatch of batch {batch_id} failed: {err}");
                    }
                }
            }
        }
    }

    async fn dispatch(&self, sealed: SealedBatch) -> Result<(), CoreError> {
        let batch = &sealed.batch;
        let tx = batch
            .tx
            .as_ref()
            .ok_or_else(|| {
                CoreError::Internal(anyhow::anyhow!("Sealed batch {} has no transaction", batch.id))
            })?
            .id
            .clone();

        match batch.batch_type {
            BatchType::Broadcast => {
                let upload = self
                    .runner
                    .run(
                        &batch.namespace,
                        &tx,
                        OpType::SharedStorageUploadBatch,
                        serde_json::json!({ "batch_id": batch.id }),
                    )
                    .await?;
                let payload_ref = upload
                    .output
                    .as_ref()
                    .and_then(|o| o.get("payload_ref"))
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        CoreError::Internal(anyhow::anyhow!(
                            "Upload operation {} produced no payload_ref",
                            upload.id
                        ))
                    })?
                    .to_string();

                self.runner
                    .run(
                        &batch.namespace,
                        &tx,
                        OpType::BlockchainPinBatch,
                        serde_json::json!({ "batch_id": batch.id, "payload_ref": payload_ref }),
                    )
                    .await?;
            }
            BatchType::Private => {
                let group = sealed.group_definition.as_ref().ok_or_else(|| {
                    CoreError::Internal(anyhow::anyhow!(
                        "Private batch {} has no group definition",
                        batch.id
                    ))
                })?;

                for member in &group.members {
                    if member.node == self.local_node {
                        continue;
                    }
                    self.runner
                        .run(
                            &batch.namespace,
                            &tx,
                            OpType::DataExchangeSendBatch,
                            serde_json::json!({
                                "batch_id": batch.id,
                                "peer": member.node,
                                "group_definition": group,
                            }),
                        )
                        .await?;

                    // Blobs ride point-to-point alongside the payload.
                    for data in &batch.payload.data {
                        if let Some(blob) = &data.blob {
                            self.runner
                                .run(
                                    &batch.namespace,
                                    &tx,
                                    OpType::DataExchangeSendBlob,
                                    serde_json::json!({
                                        "peer": member.node,
                                        "hash": blob.hash,
                                    }),
                                )
                                .await?;
                        }
                    }
                }

                self.runner
                    .run(
                        &batch.namespace,
                        &tx,
                        OpType::BlockchainPinBatch,
                        serde_json::json!({ "batch_id": batch.id }),
                    )
                    .await?;
            }
        }
        Ok(())
    }
}
