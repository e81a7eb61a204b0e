use std::time::Duration;

use async_trait::async_trait;
use router_core::WorkerTransport;
use serde_json::Value;

/// Builds the `reqwest::Client` shared by a single worker's transport.
/// No total request timeout is set: generation requests can legitimately
/// take minutes, so a client-wide deadline would abort healthy long
/// responses. Timeout policy, if any, belongs to the operator.
fn build_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .http2_keep_alive_interval(Some(Duration::from_secs(10)))
        .pool_max_idle_per_host(0)
        .build()
}

pub struct ReqwestTransport {
    client: reqwest::Client,
    generate_url: String,
}

impl ReqwestTransport {
    pub fn new(worker_address: &str) -> anyhow::Result<Self> {
        let client = build_client()?;
        let base = worker_address.trim_end_matches('/');
        Ok(Self {
            client,
            generate_url: format!("{base}/generate"),
        })
    }
}

#[async_trait]
impl WorkerTransport for ReqwestTransport {
    async fn generate(&self, body: Value) -> anyhow::Result<Value> {
        let response = self.client.post(&self.generate_url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("worker returned HTTP {status}");
        }
        let value = response.json::<Value>().await?;
        Ok(value)
    }
}
