//! In-memory loopback plugins. One [`MemoryNetwork`] is the shared fabric a
//! set of nodes joins: a ledger that totally orders batch pins and echoes
//! them to every member, a point-to-point router for payloads and blobs, and
//! a content store standing in for shared storage. Used for single-node dev
//! runs and multi-node tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::events::EventIngress;
use crate::types::EventType;
use crate::utilities::hash::HashType;

use super::blockchain::{BatchPin, BatchPinEvent, BlockchainPlugin};
use super::data_exchange::{BatchEnvelope, DataExchangePlugin};
use super::identity::{Identity, IdentityPlugin};
use super::shared_storage::SharedStoragePlugin;
use super::tokens::{TokenApprovalSpec, TokenPoolSpec, TokenTransferSpec, TokensPlugin};
use super::{OpPollStatus, PluginError, PluginRegistry, PluginResult};

const PLUGIN_NAME: &str = "memory";

/// The shared fabric. Create one, then [`MemoryNetwork::join`] each node.
#[derive(Clone, Default)]
pub(crate) struct MemoryNetwork {
    ledger: Arc<Mutex<LedgerState>>,
    router: Arc<Mutex<RouterState>>,
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    object_counter: Arc<AtomicU64>,
    identities: Arc<Mutex<IdentityState>>,
}

#[derive(Default)]
struct LedgerState {
    block_number: u64,
    /// Idempotency keys already pinned; resubmission is a no-op.
    submitted: HashSet<String>,
    subscribers: Vec<EventIngress>,
    /// Test hook: fail this many submissions with a transient error first.
    fail_next: u32,
}

#[derive(Default)]
struct RouterState {
    nodes: HashMap<String, EventIngress>,
    /// (namespace, batch id) -> envelope, kept for replay on request.
    envelopes: HashMap<(String, String), BatchEnvelope>,
    /// (node, blob hash hex) -> (namespace, size).
    blobs: HashMap<(String, String), (String, u64)>,
}

#[derive(Default)]
struct IdentityState {
    /// author -> identity
    authors: HashMap<String, Identity>,
    /// signing key -> author
    keys: HashMap<String, String>,
    /// author -> signing key
    author_keys: HashMap<String, String>,
    /// authors local to some node: author -> node
    local: HashMap<String, String>,
}

impl MemoryNetwork {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register an author identity with its signing key and home node.
    pub(crate) async fn register_identity(
        &self,
        author: &str,
        org: &str,
        node: &str,
        signing_key: &str,
    ) {
        let mut identities = self.identities.lock().await;
        identities.authors.insert(
            author.to_string(),
            Identity {
                org: org.to_string(),
                node: node.to_string(),
            },
        );
        identities
            .keys
            .insert(signing_key.to_string(), author.to_string());
        identities
            .author_keys
            .insert(author.to_string(), signing_key.to_string());
        identities
            .local
            .insert(author.to_string(), node.to_string());
    }

    /// Attach a node's ingress to the fabric and hand back its plugin set.
    pub(crate) async fn join(&self, node_name: &str, ingress: EventIngress) -> PluginRegistry {
        self.ledger.lock().await.subscribers.push(ingress.clone());
        self.router
            .lock()
            .await
            .nodes
            .insert(node_name.to_string(), ingress.clone());

        PluginRegistry {
            blockchain: Arc::new(MemoryBlockchain {
                network: self.clone(),
            }),
            data_exchange: Arc::new(MemoryDataExchange {
                network: self.clone(),
                node_name: node_name.to_string(),
            }),
            shared_storage: Arc::new(MemorySharedStorage {
                network: self.clone(),
            }),
            tokens: Arc::new(MemoryTokens {
                ingress,
                submitted: Mutex::new(HashSet::new()),
            }),
            identity: Arc::new(MemoryIdentity {
                network: self.clone(),
                node_name: node_name.to_string(),
            }),
        }
    }

    /// Make the next `n` ledger submissions fail with a transient error.
    pub(crate) async fn fail_submissions(&self, n: u32) {
        self.ledger.lock().await.fail_next = n;
    }

    /// How many distinct pins the ledger has accepted.
    pub(crate) async fn ledger_pin_count(&self) -> usize {
        self.ledger.lock().await.submitted.len()
    }

    /// Mark a blob as present on a node and notify its ingress.
    pub(crate) async fn stage_blob(
        &self,
        node: &str,
        namespace: &str,
        hash: &HashType,
        size: u64,
    ) -> anyhow::Result<()> {
        let ingress = {
            let mut router = self.router.lock().await;
            router.blobs.insert(
                (node.to_string(), hash.hex()),
                (namespace.to_string(), size),
            );
            router.nodes.get(node).cloned()
        };
        if let Some(ingress) = ingress {
            ingress.blob_received(namespace, hash, size).await?;
        }
        Ok(())
    }
}

pub(crate) struct MemoryBlockchain {
    network: MemoryNetwork,
}

#[async_trait]
impl BlockchainPlugin for MemoryBlockchain {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn verifier_type(&self) -> &str {
        "memory_key"
    }

    async fn submit_batch_pin(
        &self,
        pin: &BatchPin,
        signing_key: &str,
        idempotency_key: &str,
    ) -> PluginResult<()> {
        // The ledger lock is held across the echo to every subscriber: that
        // is what gives all nodes one identical pin order.
        let mut ledger = self.network.ledger.lock().await;
        if ledger.fail_next > 0 {
            ledger.fail_next -= 1;
            return Err(PluginError::Unavailable(
                "Injected transient ledger failure".to_string(),
            ));
        }
        if !ledger.submitted.insert(idempotency_key.to_string()) {
            log::debug!("Duplicate batch pin submission short-circuited: {idempotency_key}");
            return Ok(());
        }
        ledger.block_number += 1;
        log::debug!(
            "Ledger block {} pins batch {}: contexts [{}]",
            ledger.block_number,
            pin.batch_id,
            pin.contexts
                .iter()
                .map(super::blockchain::PinnedContext::to_wire)
                .collect::<Vec<_>>()
                .join(", ")
        );

        let event = BatchPinEvent {
            pin: pin.clone(),
            signer: signing_key.to_string(),
            block_number: ledger.block_number,
            transaction_hash: format!("0xmem{:08x}", ledger.block_number),
        };
        for subscriber in ledger.subscribers.clone() {
            if let Err(err) = subscriber.batch_pin_complete(&event).await {
                log::error!("Subscriber failed to ingest batch pin: {err}");
            }
        }
        Ok(())
    }

    async fn submit_network_action(
        &self,
        action: &str,
        _signing_key: &str,
        idempotency_key: &str,
    ) -> PluginResult<()> {
        let mut ledger = self.network.ledger.lock().await;
        if !ledger.submitted.insert(idempotency_key.to_string()) {
            return Ok(());
        }
        ledger.block_number += 1;
        log::info!("Network action recorded on ledger: {action}");
        Ok(())
    }

    async fn operation_status(&self, idempotency_key: &str) -> PluginResult<OpPollStatus> {
        let ledger = self.network.ledger.lock().await;
        if ledger.submitted.contains(idempotency_key) {
            Ok(OpPollStatus::Succeeded { output: None })
        } else {
            Ok(OpPollStatus::Unknown)
        }
    }
}

pub(crate) struct MemoryDataExchange {
    network: MemoryNetwork,
    node_name: String,
}

#[async_trait]
impl DataExchangePlugin for MemoryDataExchange {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn send_batch(
        &self,
        peer: &str,
        envelope: &BatchEnvelope,
        _idempotency_key: &str,
    ) -> PluginResult<()> {
        let ingress = {
            let mut router = self.network.router.lock().await;
            router.envelopes.insert(
                (envelope.meta.namespace.clone(), envelope.meta.id.clone()),
                envelope.clone(),
            );
            router.nodes.get(peer).cloned()
        };
        let Some(ingress) = ingress else {
            return Err(PluginError::Unavailable(format!("Unknown peer: {peer}")));
        };
        ingress
            .batch_payload_arrived(envelope)
            .await
            .map_err(|e| PluginError::Rejected(e.to_string()))?;
        Ok(())
    }

    async fn transfer_blob(
        &self,
        peer: &str,
        hash: &HashType,
        _idempotency_key: &str,
    ) -> PluginResult<()> {
        let (ingress, namespace, size) = {
            let router = self.network.router.lock().await;
            let Some((namespace, size)) =
                router.blobs.get(&(self.node_name.clone(), hash.hex())).cloned()
            else {
                return Err(PluginError::Rejected(format!(
                    "Blob not present locally: {hash}"
                )));
            };
            (router.nodes.get(peer).cloned(), namespace, size)
        };
        let Some(ingress) = ingress else {
            return Err(PluginError::Unavailable(format!("Unknown peer: {peer}")));
        };

        self.network
            .router
            .lock()
            .await
            .blobs
            .insert((peer.to_string(), hash.hex()), (namespace.clone(), size));
        ingress
            .blob_received(&namespace, hash, size)
            .await
            .map_err(|e| PluginError::Rejected(e.to_string()))?;
        Ok(())
    }

    async fn request_blob(&self, peer: &str, hash: &HashType) -> PluginResult<()> {
        let (own_ingress, namespace, size) = {
            let router = self.network.router.lock().await;
            let Some((namespace, size)) =
                router.blobs.get(&(peer.to_string(), hash.hex())).cloned()
            else {
                // The peer does not have it yet; they will push when it lands.
                return Ok(());
            };
            (router.nodes.get(&self.node_name).cloned(), namespace, size)
        };
        let Some(ingress) = own_ingress else {
            return Err(PluginError::Unavailable("Requester not joined".to_string()));
        };

        self.network.router.lock().await.blobs.insert(
            (self.node_name.clone(), hash.hex()),
            (namespace.clone(), size),
        );
        ingress
            .blob_received(&namespace, hash, size)
            .await
            .map_err(|e| PluginError::Rejected(e.to_string()))?;
        Ok(())
    }

    async fn request_batch(
        &self,
        _peer: &str,
        namespace: &str,
        batch_id: &str,
    ) -> PluginResult<()> {
        let (ingress, envelope) = {
            let router = self.network.router.lock().await;
            (
                router.nodes.get(&self.node_name).cloned(),
                router
                    .envelopes
                    .get(&(namespace.to_string(), batch_id.to_string()))
                    .cloned(),
            )
        };
        let (Some(ingress), Some(envelope)) = (ingress, envelope) else {
            return Ok(());
        };
        ingress
            .batch_payload_arrived(&envelope)
            .await
            .map_err(|e| PluginError::Rejected(e.to_string()))?;
        Ok(())
    }
}

pub(crate) struct MemorySharedStorage {
    network: MemoryNetwork,
}

#[async_trait]
impl SharedStoragePlugin for MemorySharedStorage {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn upload_data(&self, payload: &[u8]) -> PluginResult<String> {
        let n = self.network.object_counter.fetch_add(1, Ordering::SeqCst);
        let payload_ref = format!("mem://{n}");
        self.network
            .objects
            .lock()
            .await
            .insert(payload_ref.clone(), payload.to_vec());
        Ok(payload_ref)
    }

    async fn download_data(&self, payload_ref: &str) -> PluginResult<Vec<u8>> {
        self.network
            .objects
            .lock()
            .await
            .get(payload_ref)
            .cloned()
            .ok_or_else(|| PluginError::Rejected(format!("No such object: {payload_ref}")))
    }
}

pub(crate) struct MemoryTokens {
    ingress: EventIngress,
    submitted: Mutex<HashSet<String>>,
}

impl MemoryTokens {
    async fn confirm(
        &self,
        namespace: &str,
        event_type: EventType,
        reference: &str,
        idempotency_key: &str,
    ) -> PluginResult<()> {
        if !self
            .submitted
            .lock()
            .await
            .insert(idempotency_key.to_string())
        {
            return Ok(());
        }
        self.ingress
            .token_event(namespace, event_type, &reference.to_string(), None)
            .await
            .map_err(|e| PluginError::Rejected(e.to_string()))
    }
}

#[async_trait]
impl TokensPlugin for MemoryTokens {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn create_pool(&self, pool: &TokenPoolSpec, idempotency_key: &str) -> PluginResult<()> {
        self.confirm(
            &pool.namespace,
            EventType::TokenPoolConfirmed,
            &pool.name,
            idempotency_key,
        )
        .await
    }

    async fn mint_tokens(
        &self,
        transfer: &TokenTransferSpec,
        idempotency_key: &str,
    ) -> PluginResult<()> {
        self.confirm(
            &transfer.namespace,
            EventType::TokenTransferConfirmed,
            &transfer.pool,
            idempotency_key,
        )
        .await
    }

    async fn burn_tokens(
        &self,
        transfer: &TokenTransferSpec,
        idempotency_key: &str,
    ) -> PluginResult<()> {
        self.mint_tokens(transfer, idempotency_key).await
    }

    async fn transfer_tokens(
        &self,
        transfer: &TokenTransferSpec,
        idempotency_key: &str,
    ) -> PluginResult<()> {
        self.mint_tokens(transfer, idempotency_key).await
    }

    async fn tokens_approval(
        &self,
        approval: &TokenApprovalSpec,
        idempotency_key: &str,
    ) -> PluginResult<()> {
        self.confirm(
            &approval.namespace,
            EventType::TokenApprovalConfirmed,
            &approval.pool,
            idempotency_key,
        )
        .await
    }

    async fn operation_status(&self, idempotency_key: &str) -> PluginResult<OpPollStatus> {
        if self.submitted.lock().await.contains(idempotency_key) {
            Ok(OpPollStatus::Succeeded { output: None })
        } else {
            Ok(OpPollStatus::Unknown)
        }
    }
}

pub(crate) struct MemoryIdentity {
    network: MemoryNetwork,
    node_name: String,
}

#[async_trait]
impl IdentityPlugin for MemoryIdentity {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn resolve_signing_key(&self, key: &str) -> PluginResult<Option<Identity>> {
        let identities = self.network.identities.lock().await;
        let author = identities.keys.get(key);
        Ok(author.and_then(|a| identities.authors.get(a).cloned()))
    }

    async fn author_for_key(&self, key: &str) -> PluginResult<Option<String>> {
        let identities = self.network.identities.lock().await;
        Ok(identities.keys.get(key).cloned())
    }

    async fn is_local_author(&self, author: &str) -> PluginResult<bool> {
        let identities = self.network.identities.lock().await;
        Ok(identities.local.get(author).map(String::as_str) == Some(self.node_name.as_str()))
    }

    async fn signing_key_for(&self, author: &str) -> PluginResult<Option<String>> {
        let identities = self.network.identities.lock().await;
        Ok(identities.author_keys.get(author).cloned())
    }

    async fn node_for_author(&self, author: &str) -> PluginResult<Option<String>> {
        let identities = self.network.identities.lock().await;
        Ok(identities.authors.get(author).map(|i| i.node.clone()))
    }
}
