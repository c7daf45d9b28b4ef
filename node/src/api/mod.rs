//! # Node API
//!
//! The command surface the HTTP layer (and embedding Rust code) talks to.
//! Commands travel over a channel into the node's main loop; queries carry a
//! oneshot for the reply.

use std::fmt::Display;

use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::oneshot;

use crate::error::CoreError;
use crate::plugins::tokens::{TokenApprovalSpec, TokenPoolSpec, TokenTransferSpec};
use crate::types::{BatchRecord, Event, Message, MessageRecord, Operation, Subscription};
use crate::utilities::EntityId;

pub mod types;

pub use types::{ApiSubscriptionRequest, DataInput, GroupInput, SubmitRequest};

pub type ApiResult<T> = Result<T, CoreError>;

type Reply<T> = oneshot::Sender<ApiResult<T>>;

#[derive(Debug)]
pub(crate) enum ApiCmd {
    SubmitMessage(Box<SubmitRequest>, Reply<Message>),
    QueryMessage(EntityId, Reply<Option<MessageRecord>>),
    QueryBatch(EntityId, Reply<Option<BatchRecord>>),
    QueryEvents {
        from_sequence: i64,
        limit: usize,
        reply: Reply<Vec<Event>>,
    },
    QueryOperation(EntityId, Reply<Option<Operation>>),
    RetryOperation(EntityId, Reply<Operation>),
    CreateSubscription(Box<ApiSubscriptionRequest>, Reply<Subscription>),
    ListSubscriptions(Reply<Vec<Subscription>>),
    DeleteSubscription(String, Reply<()>),
    CreateTokenPool(Box<TokenPoolSpec>, Reply<Operation>),
    MintTokens(Box<TokenTransferSpec>, Reply<Operation>),
    BurnTokens(Box<TokenTransferSpec>, Reply<Operation>),
    TransferTokens(Box<TokenTransferSpec>, Reply<Operation>),
    ApproveTokens(Box<TokenApprovalSpec>, Reply<Operation>),
}

impl Display for ApiCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiCmd::SubmitMessage(request, _) => {
                write!(f, "SubmitMessage(author={})", request.author)
            }
            ApiCmd::QueryMessage(id, _) => write!(f, "QueryMessage({id})"),
            ApiCmd::QueryBatch(id, _) => write!(f, "QueryBatch({id})"),
            ApiCmd::QueryEvents { from_sequence, .. } => {
                write!(f, "QueryEvents(from={from_sequence})")
            }
            ApiCmd::QueryOperation(id, _) => write!(f, "QueryOperation({id})"),
            ApiCmd::RetryOperation(id, _) => write!(f, "RetryOperation({id})"),
            ApiCmd::CreateSubscription(request, _) => {
                write!(f, "CreateSubscription({})", request.name)
            }
            ApiCmd::ListSubscriptions(_) => write!(f, "ListSubscriptions"),
            ApiCmd::DeleteSubscription(name, _) => write!(f, "DeleteSubscription({name})"),
            ApiCmd::CreateTokenPool(pool, _) => write!(f, "CreateTokenPool({})", pool.name),
            ApiCmd::MintTokens(spec, _) => write!(f, "MintTokens({})", spec.pool),
            ApiCmd::BurnTokens(spec, _) => write!(f, "BurnTokens({})", spec.pool),
            ApiCmd::TransferTokens(spec, _) => write!(f, "TransferTokens({})", spec.pool),
            ApiCmd::ApproveTokens(spec, _) => write!(f, "ApproveTokens({})", spec.pool),
        }
    }
}

pub(crate) struct ApiListener {
    pub(crate) commands_rcv: Receiver<ApiCmd>,
}

/// Cloneable handle for submitting commands to a running node.
#[derive(Clone)]
pub struct WeftApi {
    pub(crate) commands_channel: Sender<ApiCmd>,
}

impl WeftApi {
    pub(crate) fn new() -> (WeftApi, ApiListener) {
        let (commands_channel, commands_rcv) = channel(100);
        (
            WeftApi { commands_channel },
            ApiListener { commands_rcv },
        )
    }

    pub async fn submit_message(&self, request: SubmitRequest) -> ApiResult<Message> {
        self.send_and_wait(|tx| ApiCmd::SubmitMessage(request.into(), tx))
            .await
    }

    pub async fn get_message(&self, id: String) -> ApiResult<Option<MessageRecord>> {
        self.send_and_wait(|tx| ApiCmd::QueryMessage(id, tx)).await
    }

    pub async fn get_batch(&self, id: String) -> ApiResult<Option<BatchRecord>> {
        self.send_and_wait(|tx| ApiCmd::QueryBatch(id, tx)).await
    }

    pub async fn get_events(&self, from_sequence: i64, limit: usize) -> ApiResult<Vec<Event>> {
        self.send_and_wait(|reply| ApiCmd::QueryEvents {
            from_sequence,
            limit,
            reply,
        })
        .await
    }

    pub async fn get_operation(&self, id: String) -> ApiResult<Option<Operation>> {
        self.send_and_wait(|tx| ApiCmd::QueryOperation(id, tx))
            .await
    }

    pub async fn retry_operation(&self, id: String) -> ApiResult<Operation> {
        self.send_and_wait(|tx| ApiCmd::RetryOperation(id, tx))
            .await
    }

    pub async fn create_subscription(
        &self,
        request: ApiSubscriptionRequest,
    ) -> ApiResult<Subscription> {
        self.send_and_wait(|tx| ApiCmd::CreateSubscription(request.into(), tx))
            .await
    }

    pub async fn list_subscriptions(&self) -> ApiResult<Vec<Subscription>> {
        self.send_and_wait(ApiCmd::ListSubscriptions).await
    }

    pub async fn delete_subscription(&self, name: String) -> ApiResult<()> {
        self.send_and_wait(|tx| ApiCmd::DeleteSubscription(name, tx))
            .await
    }

    pub async fn create_token_pool(&self, pool: TokenPoolSpec) -> ApiResult<Operation> {
        self.send_and_wait(|tx| ApiCmd::CreateTokenPool(pool.into(), tx))
            .await
    }

    pub async fn mint_tokens(&self, spec: TokenTransferSpec) -> ApiResult<Operation> {
        self.send_and_wait(|tx| ApiCmd::MintTokens(spec.into(), tx))
            .await
    }

    pub async fn burn_tokens(&self, spec: TokenTransferSpec) -> ApiResult<Operation> {
        self.send_and_wait(|tx| ApiCmd::BurnTokens(spec.into(), tx))
            .await
    }

    pub async fn transfer_tokens(&self, spec: TokenTransferSpec) -> ApiResult<Operation> {
        self.send_and_wait(|tx| ApiCmd::TransferTokens(spec.into(), tx))
            .await
    }

    pub async fn approve_tokens(&self, spec: TokenApprovalSpec) -> ApiResult<Operation> {
        self.send_and_wait(|tx| ApiCmd::ApproveTokens(spec.into(), tx))
            .await
    }

    async fn send_and_wait<F, R>(&self, f: F) -> ApiResult<R>
    where
        F: FnOnce(oneshot::Sender<ApiResult<R>>) -> ApiCmd,
        R: Send + 'static,
    {
        let (tx, rcv) = oneshot::channel();
        let cmd = f(tx);
        log::trace!("Sending API command: {cmd}");
        if self.commands_channel.send(cmd).await.is_err() {
            return Err(CoreError::Cancelled);
        }
        rcv.await.map_err(|_| CoreError::Cancelled)?
    }
}
