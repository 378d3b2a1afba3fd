pub mod issue;
pub mod migrate;
pub mod revoke;
pub mod status;
pub mod verify;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
struct ErrorResponse {
    error: String,
    kind: String,
}

/// Thin JSON client over the node API.
pub struct ApiClient {
    endpoint: String,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let resp = self
            .http
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        Self::decode(resp).await
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> anyhow::Result<T> {
        let resp = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        Self::decode(resp).await
    }

    fn unreachable(&self, err: reqwest::Error) -> anyhow::Error {
        tracing::debug!(error = %err, "request failed");
        anyhow::anyhow!(
            "could not reach node at {}: {}\nIs the node running? Start it with: attest-node",
            self.endpoint,
            err
        )
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> anyhow::Result<T> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json().await?);
        }
        match resp.json::<ErrorResponse>().await {
            Ok(err) => anyhow::bail!("{} (HTTP {}, {})", err.error, status, err.kind),
            Err(_) => anyhow::bail!("node returned HTTP {}", status),
        }
    }
}
