//! Websocket delivery: a consumer connects with `?subscription=<name>` and
//! receives JSON event envelopes; it answers `{"type":"ack","sequence":n}` or
//! `{"type":"nack","sequence":n}`. One connection per subscription.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message as WsFrame;

use crate::subscriptions::{Ack, DeliveryTransport, EventDelivery};
use crate::types::Subscription;

struct ConnectionHandle {
    frames_tx: mpsc::Sender<String>,
    /// The ack channel of the dispatcher currently delivering; refreshed on
    /// every delivery so acks always reach the live dispatcher.
    ack_route: Arc<StdMutex<Option<mpsc::Sender<Ack>>>>,
}

type ConnectionRegistry = Arc<Mutex<HashMap<String, ConnectionHandle>>>;

pub(crate) struct WsManager {
    address: String,
    registry: ConnectionRegistry,
}

#[derive(Clone)]
pub(crate) struct WsTransport {
    registry: ConnectionRegistry,
}

impl WsManager {
    pub(crate) fn new(address: &str) -> (WsManager, WsTransport) {
        let registry: ConnectionRegistry = Arc::new(Mutex::new(HashMap::new()));
        let manager = WsManager {
            address: address.to_string(),
            registry: registry.clone(),
        };
        (manager, WsTransport { registry })
    }

    pub(crate) async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.address).await?;
        log::info!("Listening for websocket connections on {}", self.address);

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    log::debug!("Accepted websocket connection from: {addr}");
                    let registry = self.registry.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, registry).await {
                            log::error!("Websocket connection error: {err}");
                        }
                        log::debug!("Websocket connection closed");
                    });
                }
                Err(err) => {
                    log::error!("Error accepting websocket connection: {err}");
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, registry: ConnectionRegistry) -> Result<()> {
    let mut subscription = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        subscription = req
            .uri()
            .query()
            .and_then(|q| {
                q.split('&')
                    .find_map(|kv| kv.strip_prefix("subscription="))
            })
            .map(String::from);
        Ok(resp)
    })
    .await?;

    let Some(subscription) = subscription else {
        anyhow::bail!("Connection rejected: no subscription query parameter");
    };
    log::info!("Websocket consumer attached to subscription {subscription}");

    let (frames_tx, mut frames_rx) = mpsc::channel::<String>(64);
    let ack_route: Arc<StdMutex<Option<mpsc::Sender<Ack>>>> = Arc::new(StdMutex::new(None));
    registry.lock().await.insert(
        subscription.clone(),
        ConnectionHandle {
            frames_tx,
            ack_route: ack_route.clone(),
        },
    );

    let (mut sink, mut source) = ws_stream.split();
    loop {
        tokio::select! {
            frame = frames_rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(err) = sink.send(WsFrame::Text(frame)).await {
                    log::error!("Error sending frame to websocket client: {err}");
                    break;
                }
            }
            incoming = source.next() => {
                match incoming {
                    Some(Ok(WsFrame::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(frame) => {
                                let route = ack_route.lock().expect("Ack route poisoned").clone();
                                if let Some(route) = route {
                                    let _ = route.try_send(Ack {
                                        sequence: frame.sequence,
                                        ok: frame.frame_type == "ack",
                                    });
                                }
                            }
                            Err(err) => {
                                log::warn!("Undecodable client frame: {err}");
                            }
                        }
                    }
                    Some(Ok(WsFrame::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        log::error!("Websocket read error: {err}");
                        break;
                    }
                }
            }
        }
    }

    registry.lock().await.remove(&subscription);
    log::info!("Websocket consumer detached from subscription {subscription}");
    Ok(())
}

#[derive(Deserialize)]
struct ClientFrame {
    #[serde(rename = "type")]
    frame_type: String,
    sequence: i64,
}

#[async_trait]
impl DeliveryTransport for WsTransport {
    async fn deliver(
        &self,
        sub: &Subscription,
        delivery: &EventDelivery,
        acks: mpsc::Sender<Ack>,
    ) -> Result<()> {
        let registry = self.registry.lock().await;
        let Some(conn) = registry.get(&sub.name) else {
            anyhow::bail!("No consumer connected for subscription {}", sub.name);
        };
        *conn.ack_route.lock().expect("Ack route poisoned") = Some(acks);

        let frame = serde_json::to_string(delivery)?;
        conn.frames_tx
            .send(frame)
            .await
            .map_err(|_| anyhow::anyhow!("Consumer connection closed"))?;
        Ok(())
    }
}
