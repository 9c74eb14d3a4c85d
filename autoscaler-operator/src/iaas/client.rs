use super::IaasNode;
use crate::util::Error;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Simple in-memory token bucket guarding outbound IaaS calls, guarded by
/// its own lock so every IaaS call flows through it. No lock is held
/// across the HTTP call itself, only around the bucket state.
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub struct HttpIaasClient {
    http: reqwest::Client,
    base_url: String,
    api_token: String,
    bucket: Mutex<TokenBucket>,
}

impl HttpIaasClient {
    pub fn new(base_url: String, api_token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            api_token,
            bucket: Mutex::new(TokenBucket::new(10.0, 5.0)),
        }
    }

    async fn acquire(&self) {
        loop {
            if self.bucket.lock().unwrap().try_acquire() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Classifies a non-2xx HTTP status into a transient-vs-terminal error:
    /// quota/plan/limit responses are terminal (403, 402, 429 with a
    /// "quota" body) and must not be retried.
    fn classify(&self, status: reqwest::StatusCode, body: &str) -> Error {
        let terminal = status.as_u16() == 402
            || status.as_u16() == 403
            || (status.as_u16() == 429 && body.to_lowercase().contains("quota"));
        Error::Iaas {
            message: format!("IaaS request failed: {status} {body}"),
            terminal,
        }
    }
}

#[derive(Deserialize)]
struct WireNode {
    id: u64,
    #[serde(default)]
    identifier: String,
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    ipv6: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    cpu: Option<u32>,
    #[serde(default)]
    ram_mb: Option<u64>,
    #[serde(default)]
    disk_gb: Option<u64>,
}

impl From<WireNode> for IaasNode {
    fn from(w: WireNode) -> Self {
        IaasNode {
            id: w.id,
            identifier: w.identifier,
            hostname: w.hostname,
            ip: w.ip,
            ipv6: w.ipv6,
            status: w.status,
            cpu: w.cpu,
            ram_mb: w.ram_mb,
            disk_gb: w.disk_gb,
        }
    }
}

#[async_trait]
impl super::IaasClient for HttpIaasClient {
    async fn create_node(&self, cluster_id: &str, group_id: u64) -> Result<IaasNode, Error> {
        self.acquire().await;
        let resp = self
            .http
            .post(self.url("/v1/nodes"))
            .bearer_auth(&self.api_token)
            .json(&serde_json::json!({ "clusterId": cluster_id, "groupId": group_id }))
            .send()
            .await
            .map_err(|e| Error::iaas(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(self.classify(status, &body));
        }
        let node: WireNode = resp.json().await.map_err(|e| Error::iaas(e.to_string()))?;
        Ok(node.into())
    }

    async fn get_node(&self, id: u64) -> Result<Option<IaasNode>, Error> {
        self.acquire().await;
        let resp = self
            .http
            .get(self.url(&format!("/v1/nodes/{id}")))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| Error::iaas(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(self.classify(status, &body));
        }
        let node: WireNode = resp.json().await.map_err(|e| Error::iaas(e.to_string()))?;
        Ok(Some(node.into()))
    }

    async fn list_nodes(&self) -> Result<Vec<IaasNode>, Error> {
        self.acquire().await;
        let resp = self
            .http
            .get(self.url("/v1/nodes"))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| Error::iaas(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(self.classify(status, &body));
        }
        let nodes: Vec<WireNode> = resp.json().await.map_err(|e| Error::iaas(e.to_string()))?;
        Ok(nodes.into_iter().map(Into::into).collect())
    }

    async fn delete_node(&self, id: u64) -> Result<(), Error> {
        self.acquire().await;
        let resp = self
            .http
            .delete(self.url(&format!("/v1/nodes/{id}")))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| Error::iaas(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND || resp.status().is_success() {
            return Ok(());
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(self.classify(status, &body))
    }

    async fn delete_cluster_node(
        &self,
        cluster_id: &str,
        node_identifier: &str,
    ) -> Result<(), Error> {
        self.acquire().await;
        let resp = self
            .http
            .delete(self.url(&format!(
                "/v1/clusters/{cluster_id}/nodes/{node_identifier}"
            )))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| Error::iaas(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND || resp.status().is_success() {
            return Ok(());
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(self.classify(status, &body))
    }

    async fn find_node_identifier(&self, cluster_id: &str, hostname: &str) -> Result<String, Error> {
        self.acquire().await;
        let resp = self
            .http
            .get(self.url(&format!("/v1/clusters/{cluster_id}/nodes")))
            .query(&[("hostname", hostname)])
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| Error::iaas(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(String::new());
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(self.classify(status, &body));
        }
        #[derive(Deserialize)]
        struct Found {
            #[serde(default)]
            identifier: String,
        }
        let found: Found = resp.json().await.map_err(|e| Error::iaas(e.to_string()))?;
        Ok(found.identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_bucket_drains_and_refills() {
        let mut bucket = TokenBucket::new(2.0, 1000.0);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
        std::thread::sleep(Duration::from_millis(5));
        assert!(bucket.try_acquire());
    }
}
