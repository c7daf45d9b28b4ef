use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{OpPollStatus, PluginResult};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TokenPoolSpec {
    pub namespace: String,
    pub name: String,
    /// "fungible" or "nonfungible"; the node does not interpret further.
    pub pool_type: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TokenTransferSpec {
    pub namespace: String,
    pub pool: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub amount: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TokenApprovalSpec {
    pub namespace: String,
    pub pool: String,
    pub operator: String,
    pub approved: bool,
}

#[async_trait]
pub(crate) trait TokensPlugin: Send + Sync {
    fn name(&self) -> &str;

    async fn create_pool(&self, pool: &TokenPoolSpec, idempotency_key: &str) -> PluginResult<()>;

    async fn mint_tokens(
        &self,
        transfer: &TokenTransferSpec,
        idempotency_key: &str,
    ) -> PluginResult<()>;

    async fn burn_tokens(
        &self,
        transfer: &TokenTransferSpec,
        idempotency_key: &str,
    ) -> PluginResult<()>;

    async fn transfer_tokens(
        &self,
        transfer: &TokenTransferSpec,
        idempotency_key: &str,
    ) -> PluginResult<()>;

    async fn tokens_approval(
        &self,
        approval: &TokenApprovalSpec,
        idempotency_key: &str,
    ) -> PluginResult<()>;

    async fn operation_status(&self, idempotency_key: &str) -> PluginResult<OpPollStatus>;
}
