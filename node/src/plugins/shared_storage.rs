use async_trait::async_trait;

use super::PluginResult;

#[async_trait]
pub(crate) trait SharedStoragePlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Upload a payload, returning the public download reference.
    async fn upload_data(&self, payload: &[u8]) -> PluginResult<String>;

    async fn download_data(&self, payload_ref: &str) -> PluginResult<Vec<u8>>;
}
