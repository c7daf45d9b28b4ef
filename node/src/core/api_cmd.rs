use crate::api::ApiCmd;
use crate::error::CoreError;
use crate::storage::{txn, Filter, Query, SortDir, StorageTxn};
use crate::types::{OpType, Subscription, Transaction, TransactionType};
use crate::Node;

pub(crate) struct ApiCmdProcessor;

impl ApiCmdProcessor {
    pub(crate) async fn process(node: &mut Node, cmd: ApiCmd) {
        log::trace!("Processing API command: {cmd}");
        match cmd {
            ApiCmd::SubmitMessage(request, reply) => {
                let result = node.assembler.submit(*request).await;
                let _ = reply.send(result);
            }

            ApiCmd::QueryMessage(id, reply) => {
                let namespace = node.node_info.namespace.clone();
                let mut store = node.store.lock().await;
                let result = txn(store.as_mut(), |t| t.get_message(&namespace, &id))
                    .map_err(|e| CoreError::Internal(e.into()));
                let _ = reply.send(result);
            }

            ApiCmd::QueryBatch(id, reply) => {
                let namespace = node.node_info.namespace.clone();
                let mut store = node.store.lock().await;
                let result = txn(store.as_mut(), |t| t.get_batch(&namespace, &id))
                    .map_err(|e| CoreError::Internal(e.into()));
                let _ = reply.send(result);
            }

            ApiCmd::QueryEvents {
                from_sequence,
                limit,
                reply,
            } => {
                let namespace = node.node_info.namespace.clone();
                let mut store = node.store.lock().await;
                let result = txn(store.as_mut(), |t| {
                    t.query_events(
                        &Query::new()
                            .filter(Filter::And(vec![
                                Filter::Eq("namespace", namespace.into()),
                                Filter::Gt("sequence", from_sequence.into()),
                            ]))
                            .sort("sequence", SortDir::Asc)
                            .limit(limit.min(1000)),
                    )
                })
                .map_err(|e| CoreError::Internal(e.into()));
                let _ = reply.send(result);
            }

            ApiCmd::QueryOperation(id, reply) => {
                let namespace = node.node_info.namespace.clone();
                let mut store = node.store.lock().await;
                let result = txn(store.as_mut(), |t| t.get_operation(&namespace, &id))
                    .map_err(|e| CoreError::Internal(e.into()));
                let _ = reply.send(result);
            }

            ApiCmd::RetryOperation(id, reply) => {
                // Retries run the whole backoff cycle; keep the main loop free.
                let runner = node.runner.clone();
                let namespace = node.node_info.namespace.clone();
                tokio::spawn(async move {
                    let _ = reply.send(runner.retry(&namespace, &id).await);
                });
            }

            ApiCmd::CreateSubscription(request, reply) => {
                let namespace = node.node_info.namespace.clone();
                let mut sub = Subscription::new(&namespace, &request.name);
                sub.filter = request.filter;
                sub.options = request.options;

                let result = {
                    let mut store = node.store.lock().await;
                    txn(store.as_mut(), |t| {
                        t.upsert_subscription(&sub)?;
                        // Pin the starting offset at creation so events that
                        // land before the dispatcher spins up are classified
                        // consistently.
                        let initial = match sub.options.first_event {
                            crate::types::FirstEvent::Oldest => 0,
                            crate::types::FirstEvent::Newest => t.max_event_sequence()?,
                            crate::types::FirstEvent::Sequence(s) => s,
                        };
                        t.upsert_offset(
                            crate::storage::OffsetType::Subscription,
                            &sub.id,
                            initial,
                        )
                    })
                    .map_err(|e| match e {
                        crate::storage::StorageError::IdMismatch(name) => {
                            CoreError::Conflict(format!("Subscription name in use: {name}"))
                        }
                        other => CoreError::Internal(other.into()),
                    })
                };
                match result {
                    Ok(()) => {
                        if node.new_sub_tx.send(sub.clone()).await.is_err() {
                            log::error!("Subscription manager is gone");
                        }
                        let _ = reply.send(Ok(sub));
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    }
                }
            }

            ApiCmd::ListSubscriptions(reply) => {
                let namespace = node.node_info.namespace.clone();
                let mut store = node.store.lock().await;
                let result = txn(store.as_mut(), |t| t.list_subscriptions(&namespace))
                    .map_err(|e| CoreError::Internal(e.into()));
                let _ = reply.send(result);
            }

            ApiCmd::DeleteSubscription(name, reply) => {
                let namespace = node.node_info.namespace.clone();
                let mut store = node.store.lock().await;
                let result = txn(store.as_mut(), |t| {
                    match t.get_subscription(&namespace, &name)? {
                        Some(sub) => {
                            t.delete_subscription(&namespace, &sub.id)?;
                            Ok(Ok(()))
                        }
                        None => Ok(Err(CoreError::NotFound(format!("Subscription {name}")))),
                    }
                })
                .map_err(|e| CoreError::Internal(e.into()))
                .and_then(|inner| inner);
                let _ = reply.send(result);
            }

            ApiCmd::CreateTokenPool(spec, reply) => {
                Self::run_token_op(
                    node,
                    TransactionType::TokenPool,
                    OpType::TokenCreatePool,
                    serde_json::to_value(&*spec),
                    reply,
                )
                .await;
            }
            ApiCmd::MintTokens(spec, reply) => {
                Self::run_token_op(
                    node,
                    TransactionType::TokenTransfer,
                    OpType::TokenMint,
                    serde_json::to_value(&*spec),
                    reply,
                )
                .await;
            }
            ApiCmd::BurnTokens(spec, reply) => {
                Self::run_token_op(
                    node,
                    TransactionType::TokenTransfer,
                    OpType::TokenBurn,
                    serde_json::to_value(&*spec),
                    reply,
                )
                .await;
            }
            ApiCmd::TransferTokens(spec, reply) => {
                Self::run_token_op(
                    node,
                    TransactionType::TokenTransfer,
                    OpType::TokenTransfer,
                    serde_json::to_value(&*spec),
                    reply,
                )
                .await;
            }
            ApiCmd::ApproveTokens(spec, reply) => {
                Self::run_token_op(
                    node,
                    TransactionType::TokenApproval,
                    OpType::TokenApproval,
                    serde_json::to_value(&*spec),
                    reply,
                )
                .await;
            }
        }
    }

    /// Token submissions: one transaction row grouping the operation, run off
    /// the main loop because the runner may sit in backoff.
    async fn run_token_op(
        node: &mut Node,
        tx_type: TransactionType,
        op_type: OpType,
        input: serde_json::Result<serde_json::Value>,
        reply: tokio::sync::oneshot::Sender<Result<crate::types::Operation, CoreError>>,
    ) {
        let input = match input {
            Ok(input) => input,
            Err(err) => {
                let _ = reply.send(Err(CoreError::InvalidInput(err.to_string())));
                return;
            }
        };

        let namespace = node.node_info.namespace.clone();
        let transaction = Transaction::new(&namespace, tx_type);
        let insert = {
            let mut store = node.store.lock().await;
            txn(store.as_mut(), |t| t.upsert_transaction(&transaction))
        };
        if let Err(err) = insert {
            let _ = reply.send(Err(CoreError::Internal(err.into())));
            return;
        }

        let runner = node.runner.clone();
        let tx_id = transaction.id.clone();
        tokio::spawn(async move {
            let _ = reply.send(runner.run(&namespace, &tx_id, op_type, input).await);
        });
    }
}
