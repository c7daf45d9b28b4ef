use async_trait::async_trait;

use super::PluginResult;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Identity {
    pub org: String,
    pub node: String,
}

#[async_trait]
pub(crate) trait IdentityPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Resolve a ledger signing key to the registered (org, node) identity.
    async fn resolve_signing_key(&self, key: &str) -> PluginResult<Option<Identity>>;

    /// The author identity registered for a ledger signing key.
    async fn author_for_key(&self, key: &str) -> PluginResult<Option<String>>;

    /// Whether this author identity may submit messages from this node.
    async fn is_local_author(&self, author: &str) -> PluginResult<bool>;

    /// The ledger signing key registered for a local author.
    async fn signing_key_for(&self, author: &str) -> PluginResult<Option<String>>;

    /// The node registered for an author identity, local or remote.
    async fn node_for_author(&self, author: &str) -> PluginResult<Option<String>>;
}
