//! Mesh client
//!
//! [`MeshInterface`] performs one HTTP round trip per call against a
//! registered mesh endpoint. Structured error bodies are decoded back into
//! [`fleet_common::Error`]; anything else becomes `Error::Transport`.

use crate::routes::HealthResponse;
use fleet_common::{Ack, Error, ErrorBody, KeyValue, Result, ServiceDescriptor};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// Default per-request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for a remote mesh service
#[derive(Debug, Clone)]
pub struct MeshInterface {
    client: reqwest::Client,
    endpoint: Option<String>,
}

impl MeshInterface {
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: None,
        })
    }

    /// Point the client at a mesh, e.g. `http://127.0.0.1:7000`
    pub fn register(&mut self, endpoint: impl Into<String>) {
        let endpoint = endpoint.into();
        debug!("Mesh endpoint set to {}", endpoint);
        self.endpoint = Some(endpoint.trim_end_matches('/').to_string());
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    fn url(&self, path: &str) -> Result<String> {
        let endpoint = self
            .endpoint
            .as_deref()
            .ok_or_else(|| Error::Transport("no mesh endpoint registered".to_string()))?;
        Ok(format!("{}{}", endpoint, path))
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| Error::Transport(format!("undecodable response: {}", e)));
        }

        let text = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => Err(body.into()),
            Err(_) => Err(Error::Transport(format!("mesh returned {}: {}", status, text))),
        }
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        let url = self.url("/health")?;
        self.send(self.client.get(url)).await
    }

    pub async fn register_service(
        &self,
        descriptor: &ServiceDescriptor,
    ) -> Result<ServiceDescriptor> {
        let url = self.url("/services")?;
        self.send(self.client.post(url).json(descriptor)).await
    }

    pub async fn search_services(&self, tag: &str) -> Result<Vec<ServiceDescriptor>> {
        let url = self.url("/services/search")?;
        self.send(self.client.get(url).query(&[("tag", tag)])).await
    }

    pub async fn get_services(&self, name: &str) -> Result<Vec<ServiceDescriptor>> {
        let url = self.url(&format!("/services/{}", urlencoding::encode(name)))?;
        self.send(self.client.get(url)).await
    }

    pub async fn discover_service(&self, name: &str) -> Result<Vec<ServiceDescriptor>> {
        let url = self.url(&format!("/discovery/{}", urlencoding::encode(name)))?;
        self.send(self.client.get(url)).await
    }

    pub async fn deregister_service(&self, name: &str, service_id: &str) -> Result<Ack> {
        let url = self.url(&format!(
            "/services/{}/{}",
            urlencoding::encode(name),
            urlencoding::encode(service_id)
        ))?;
        self.send(self.client.delete(url)).await
    }

    pub async fn set_key_value(&self, key: &str, value: serde_json::Value) -> Result<Ack> {
        let url = self.url("/kv")?;
        let body = KeyValue {
            key: key.to_string(),
            value,
        };
        self.send(self.client.put(url).json(&body)).await
    }

    pub async fn get_key_value(&self, key: &str) -> Result<serde_json::Value> {
        let url = self.url(&format!("/kv/{}", urlencoding::encode(key)))?;
        let kv: KeyValue = self.send(self.client.get(url)).await?;
        Ok(kv.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_trims_trailing_slash() {
        let mut mesh = MeshInterface::new().unwrap();
        mesh.register("http://127.0.0.1:7000/");
        assert_eq!(mesh.endpoint(), Some("http://127.0.0.1:7000"));
        assert_eq!(mesh.url("/kv").unwrap(), "http://127.0.0.1:7000/kv");
    }

    #[tokio::test]
    async fn test_unregistered_client_fails_without_network() {
        let mesh = MeshInterface::new().unwrap();
        let err = mesh.get_key_value("k").await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
