//! Subscription manager: owns one dispatcher task per subscription row,
//! spawning for existing rows at startup and for new ones as the API creates
//! them.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::core::shutdown::Shutdown;
use crate::storage::{txn, SharedStore, StorageTxn};
use crate::types::Subscription;
use crate::utilities::EntityId;

use super::{DeliveryTransport, SubscriptionDispatcher};

pub(crate) struct SubscriptionManager {
    namespace: String,
    store: SharedStore,
    transport: Arc<dyn DeliveryTransport>,
    /// Fan-out wakeup: post-commit event inserts pulse this.
    wake_tx: broadcast::Sender<()>,
    new_sub_rx: mpsc::Receiver<Subscription>,
    dispatcher_shutdown: broadcast::Sender<()>,
    dispatchers: HashMap<EntityId, JoinHandle<()>>,
}

impl SubscriptionManager {
    pub(crate) fn new(
        namespace: &str,
        store: SharedStore,
        transport: Arc<dyn DeliveryTransport>,
        wake_tx: broadcast::Sender<()>,
        new_sub_rx: mpsc::Receiver<Subscription>,
    ) -> Self {
        let (dispatcher_shutdown, _) = broadcast::channel(1);
        Self {
            namespace: namespace.to_string(),
            store,
            transport,
            wake_tx,
            new_sub_rx,
            dispatcher_shutdown,
            dispatchers: HashMap::new(),
        }
    }

    pub(crate) async fn run(mut self, mut shutdown: Shutdown) {
        match self.load_existing().await {
            Ok(subs) => {
                for sub in subs {
                    self.spawn(sub);
                }
            }
            Err(err) => log::error!("Failed to load subscriptions: {err}"),
        }

        loop {
            tokio::select! {
                _ = shutdown.shutdown_signal_rcv.recv() => {
                    log::info!("Shutting down subscription manager");
                    let _ = self.dispatcher_shutdown.send(());
                    for (_, handle) in self.dispatchers.drain() {
                        let _ = handle.await;
                    }
                    break;
                }
                Some(sub) = self.new_sub_rx.recv() => {
                    self.spawn(sub);
                }
            }
        }
    }

    async fn load_existing(&mut self) -> anyhow::Result<Vec<Subscription>> {
        let namespace = self.namespace.clone();
        let mut store = self.store.lock().await;
        Ok(txn(store.as_mut(), |t| t.list_subscriptions(&namespace))?)
    }

    fn spawn(&mut self, sub: Subscription) {
        if let Some(existing) = self.dispatchers.get(&sub.id) {
            if !existing.is_finished() {
                log::debug!("Subscription {} already has a dispatcher", sub.name);
                return;
            }
        }

        log::info!("Starting dispatcher for subscription {}", sub.name);
        let dispatcher = SubscriptionDispatcher::new(
            sub.clone(),
            self.store.clone(),
            self.transport.clone(),
            self.wake_tx.subscribe(),
        );
        let shutdown = Shutdown {
            shutdown_signal_rcv: self.dispatcher_shutdown.subscribe(),
        };
        self.dispatchers
            .insert(sub.id, tokio::spawn(dispatcher.run(shutdown)));
    }
}
