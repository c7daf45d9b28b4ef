use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::types::{Event, Subscription};

pub(crate) mod dispatcher;
pub(crate) mod manager;

pub(crate) use dispatcher::SubscriptionDispatcher;
pub(crate) use manager::SubscriptionManager;

/// One event on its way to an external consumer. The sequence doubles as the
/// delivery id acks refer to.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub(crate) struct EventDelivery {
    pub subscription: String,
    pub event: Event,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Ack {
    pub sequence: i64,
    pub ok: bool,
}

/// How deliveries reach a consumer. The transport forwards the consumer's
/// ack/nack responses into the channel handed to it on each delivery.
#[async_trait]
pub(crate) trait DeliveryTransport: Send + Sync {
    async fn deliver(
        &self,
        sub: &Subscription,
        delivery: &EventDelivery,
        acks: mpsc::Sender<Ack>,
    ) -> anyhow::Result<()>;
}
