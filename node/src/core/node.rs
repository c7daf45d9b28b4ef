use tokio::sync::mpsc;

use crate::api::ApiListener;
use crate::batch::MessageAssembler;
use crate::core::api_cmd::ApiCmdProcessor;
use crate::core::builder::{NodeHandle, NodeInfo};
use crate::core::shutdown::ShutdownManager;
use crate::operations::OperationRunner;
use crate::storage::SharedStore;
use crate::types::Subscription;

pub struct Node {
    pub(crate) node_info: NodeInfo,

    /// Accepts outbound messages and stages them for batching.
    pub(crate) assembler: MessageAssembler,

    /// Runs durable plugin work with idempotency and retry.
    pub(crate) runner: OperationRunner,

    pub(crate) store: SharedStore,

    /// Callback surface plugins deliver into.
    pub(crate) ingress: crate::events::EventIngress,

    /// Commands arriving from the HTTP surface or embedding code.
    pub(crate) api_listener: ApiListener,

    /// Hands freshly-created subscriptions to the subscription manager.
    pub(crate) new_sub_tx: mpsc::Sender<Subscription>,

    pub(crate) node_handle: NodeHandle,

    pub(crate) shutdown_manager: Option<ShutdownManager>,
}

impl Node {
    /// Handle for interacting with the running node.
    pub fn handle(&self) -> NodeHandle {
        self.node_handle.clone()
    }

    /// Main loop: the batch manager, aggregator, senders, subscription
    /// dispatchers and reconciler all run as their own tasks; this loop owns
    /// only API command processing and shutdown sequencing.
    pub async fn run(mut self) {
        log::info!("Starting node {}", self.node_info);
        let mut shutdown_manager = self
            .shutdown_manager
            .take()
            .expect("Shutdown manager not set");

        loop {
            tokio::select! {
                cmd = self.api_listener.commands_rcv.recv() => {
                    match cmd {
                        Some(cmd) => ApiCmdProcessor::process(&mut self, cmd).await,
                        None => {
                            log::error!("API listener channel closed");
                        }
                    }
                }
                _ = shutdown_manager.external_shutdown.recv() => {
                    log::info!("Shutting down node");
                    shutdown_manager.stop().await;
                    break;
                }
            }
        }
    }
}
