use std::fmt::Display;
use std::sync::Arc;

use log::{error, info};
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::{
    aggregator::Aggregator,
    api::{ApiListener, WeftApi},
    batch::{BatchManager, BatchSender, DispatchKey, MessageAssembler},
    config::Configuration,
    core::shutdown::{Shutdown, ShutdownHandle, ShutdownManager},
    events::EventIngress,
    http,
    operations::{OperationRunner, Reconciler},
    plugins::{memory::MemoryNetwork, PluginRegistry},
    storage::{sqlite::SqliteStore, Persistence, SharedStore},
    subscriptions::{DeliveryTransport, SubscriptionManager},
    types::{Event, EventType},
    websocket::ws_manager::WsManager,
    Node,
};

#[derive(Clone)]
pub(crate) struct NodeInfo {
    pub(crate) namespace: String,
    pub(crate) org: String,
    pub(crate) node_name: String,
    pub(crate) signing_key: String,
    pub(crate) initial_config: Configuration,
}

impl NodeInfo {
    pub(crate) fn new(config: Configuration) -> Self {
        Self {
            namespace: config.node.namespace.clone(),
            org: config.node.org.clone(),
            node_name: config.node.node_name.clone(),
            signing_key: config.node.signing_key.clone(),
            initial_config: config,
        }
    }
}

impl Display for NodeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "NodeInfo {{ namespace: {}, org: {}, node: {} }}",
            self.namespace, self.org, self.node_name
        )
    }
}

/// Handle for interacting with a running node.
#[derive(Clone)]
pub struct NodeHandle {
    pub api: WeftApi,
    pub shutdown: ShutdownHandle,
}

pub struct NodeStarter {
    config: Configuration,
    node_info: NodeInfo,
    network: Option<MemoryNetwork>,
    transport: Option<Arc<dyn DeliveryTransport>>,
    serve_network: bool,
    api: WeftApi,
    api_listener: Option<ApiListener>,
}

impl NodeStarter {
    /// Pure data structure setup; no resource allocation or tasks yet.
    pub fn new(config: Configuration) -> Self {
        let node_info = NodeInfo::new(config.clone());
        let (api, api_listener) = WeftApi::new();
        NodeStarter {
            config,
            node_info,
            network: None,
            transport: None,
            serve_network: true,
            api,
            api_listener: Some(api_listener),
        }
    }

    /// Join an existing loopback fabric instead of creating a private one.
    pub(crate) fn with_memory_network(mut self, network: MemoryNetwork) -> Self {
        self.network = Some(network);
        self
    }

    pub(crate) fn with_delivery_transport(mut self, transport: Arc<dyn DeliveryTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Embedded mode: no HTTP or websocket listeners, API via [`NodeHandle`].
    pub fn embedded(mut self) -> Self {
        self.serve_network = false;
        self
    }

    /// Opens the database and spawns every component task.
    pub async fn init_tasks(mut self) -> anyhow::Result<Node> {
        info!("Initializing node tasks...");

        info!("Opening database...");
        let sqlite = SqliteStore::open(self.config.storage.clone())?;
        let store: SharedStore = Arc::new(Mutex::new(Box::new(sqlite) as Box<dyn Persistence>));
        let ingress = EventIngress::new(store.clone());

        let network = match self.network.take() {
            Some(network) => network,
            None => {
                info!("No fabric supplied, starting a private loopback fabric");
                MemoryNetwork::new()
            }
        };
        network
            .register_identity(
                &self.node_info.org,
                &self.node_info.org,
                &self.node_info.node_name,
                &self.node_info.signing_key,
            )
            .await;
        let plugins: PluginRegistry = network
            .join(&self.node_info.node_name, ingress.clone())
            .await;

        let (batch_notify_tx, batch_notify_rx) = mpsc::channel::<DispatchKey>(100);
        let (sealed_tx, sealed_rx) = mpsc::channel(16);
        let (agg_wake_tx, agg_wake_rx) = mpsc::channel::<()>(1);
        let (sub_wake_tx, _) = broadcast::channel::<()>(64);
        let (new_sub_tx, new_sub_rx) = mpsc::channel(16);

        // Post-commit wakeups. Notify-or-drop throughout: every consumer
        // re-reads persisted state on wakeup, so a dropped pulse is harmless.
        {
            let batch_notify = batch_notify_tx.clone();
            let agg_wake = agg_wake_tx.clone();
            let sub_wake = sub_wake_tx.clone();
            store.lock().await.add_post_commit_listener(Box::new(move |changes| {
                for staged in &changes.staged_messages {
                    let _ = batch_notify.try_send(DispatchKey {
                        namespace: staged.namespace.clone(),
                        author: staged.author.clone(),
                        group: staged.group,
                        private: staged.private,
                    });
                }
                if changes.events.iter().any(wakes_aggregator) {
                    let _ = agg_wake.try_send(());
                }
                if !changes.events.is_empty() {
                    let _ = sub_wake.send(());
                }
            }));
        }

        let runner = OperationRunner::new(
            store.clone(),
            plugins.clone(),
            ingress.clone(),
            self.config.operations.clone(),
        );
        let assembler = MessageAssembler::new(
            store.clone(),
            plugins.clone(),
            &self.node_info.node_name,
        );

        let (mut shutdown_manager, shutdown_handle) = ShutdownManager::init();

        info!("Starting batch manager...");
        let batch_manager = BatchManager::new(
            store.clone(),
            self.config.batch.clone(),
            &self.node_info.signing_key,
            batch_notify_rx,
            sealed_tx,
        );
        shutdown_manager
            .add_handle(tokio::spawn(batch_manager.run(shutdown_manager.subscribe())));

        info!("Starting batch sender...");
        let sender = BatchSender::new(runner.clone(), &self.node_info.node_name, sealed_rx);
        shutdown_manager.add_handle(tokio::spawn(sender.run(shutdown_manager.subscribe())));

        info!("Starting aggregator...");
        let aggregator = Aggregator::new(
            self.config.aggregator.clone(),
            store.clone(),
            plugins.clone(),
            ingress.clone(),
            &self.node_info.node_name,
            agg_wake_rx,
        );
        shutdown_manager.add_handle(tokio::spawn(aggregator.run(shutdown_manager.subscribe())));

        info!("Starting operation reconciler...");
        let reconciler = Reconciler::new(
            store.clone(),
            plugins.clone(),
            ingress.clone(),
            self.config.operations.clone(),
        );
        shutdown_manager.add_handle(tokio::spawn(reconciler.run(shutdown_manager.subscribe())));

        let transport = match self.transport.take() {
            Some(transport) => transport,
            None => {
                info!("Starting websocket listener...");
                let (ws_manager, ws_transport) =
                    WsManager::new(&self.config.websocket.address);
                if self.serve_network {
                    let shutdown = shutdown_manager.subscribe();
                    shutdown_manager.add_handle(tokio::spawn(run_ws(ws_manager, shutdown)));
                }
                Arc::new(ws_transport)
            }
        };

        info!("Starting subscription manager...");
        let sub_manager = SubscriptionManager::new(
            &self.node_info.namespace,
            store.clone(),
            transport,
            sub_wake_tx,
            new_sub_rx,
        );
        shutdown_manager.add_handle(tokio::spawn(sub_manager.run(shutdown_manager.subscribe())));

        if self.serve_network {
            info!("Starting http server...");
            let server = http::start(&self.config.http, self.api.clone())?;
            let shutdown = shutdown_manager.subscribe();
            shutdown_manager.add_handle(tokio::spawn(run_http(server, shutdown)));
        }

        let node_handle = NodeHandle {
            api: self.api.clone(),
            shutdown: shutdown_handle,
        };
        Ok(Node {
            node_info: self.node_info,
            assembler,
            runner,
            store,
            ingress,
            api_listener: self.api_listener.take().expect("API listener consumed twice"),
            new_sub_tx,
            node_handle,
            shutdown_manager: Some(shutdown_manager),
        })
    }
}

/// Events whose arrival can unblock a parked or undelivered message.
fn wakes_aggregator(event: &Event) -> bool {
    matches!(
        event.event_type,
        EventType::BatchPinComplete
            | EventType::MessageArrived
            | EventType::BlobReceived
            | EventType::MessageConfirmed
            | EventType::MessageRejected
    )
}

async fn run_http(server: actix_web::dev::Server, mut shutdown: Shutdown) {
    let server_handle = server.handle();
    tokio::select! {
        _ = shutdown.shutdown_signal_rcv.recv() => {
            info!("Shutting down http server");
            server_handle.stop(true).await;
        }
        stopped = server => {
            match stopped {
                Ok(_) => info!("Http server stopped unexpectedly"),
                Err(e) => error!("Http server stopped with error: {e}"),
            }
        }
    }
    info!("Http task finished");
}

async fn run_ws(manager: WsManager, mut shutdown: Shutdown) {
    tokio::select! {
        _ = shutdown.shutdown_signal_rcv.recv() => {
            info!("Shutting down websocket listener");
        }
        stopped = manager.run() => {
            match stopped {
                Ok(_) => info!("Websocket listener stopped unexpectedly"),
                Err(e) => error!("Websocket listener stopped with error: {e}"),
            }
        }
    }
    info!("Websocket task finished");
}
