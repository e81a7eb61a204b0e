use async_trait::async_trait;
use serde_json::Value;

/// The HTTP transport to a worker, treated as an opaque collaborator by
/// the core. `router-server` supplies the real `reqwest`-based
/// implementation; tests supply stubs.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    async fn generate(&self, body: Value) -> anyhow::Result<Value>;
}

/// A transport that always fails; useful as a registry placeholder in
/// tests that never actually forward a request.
pub struct NoopTransport;

#[async_trait]
impl WorkerTransport for NoopTransport {
    async fn generate(&self, _body: Value) -> anyhow::Result<Value> {
        anyhow::bail!("NoopTransport never forwards requests")
    }
}
