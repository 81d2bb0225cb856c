// ===============================
// src/registry.rs
// ===============================
//
// Client Registry boundary. Two sources:
// - InMemoryRegistry : loaded once from a JSON file (or built in tests)
// - RestRegistry     : the platform backend, GET /api/v1/clients[/{id}]
//
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{Client, ClientId};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("client {0} not found")]
    NotFound(ClientId),
    #[error("registry source error: {0}")]
    Source(String),
}

#[async_trait]
pub trait ClientRegistry: Send + Sync {
    async fn list_clients(&self) -> Result<Vec<Client>, RegistryError>;
    async fn get_client(&self, id: &ClientId) -> Result<Client, RegistryError>;
}

/// Frozen id -> client view used for one dispatch round.
pub type RegistrySnapshot = HashMap<ClientId, Client>;

pub async fn snapshot(registry: &dyn ClientRegistry) -> Result<RegistrySnapshot, RegistryError> {
    Ok(registry
        .list_clients()
        .await?
        .into_iter()
        .map(|c| (c.id.clone(), c))
        .collect())
}

#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    clients: Vec<Client>,
    by_id: HashMap<ClientId, usize>,
}

impl InMemoryRegistry {
    pub fn new(clients: Vec<Client>) -> Self {
        let by_id = clients.iter().enumerate().map(|(i, c)| (c.id.clone(), i)).collect();
        Self { clients, by_id }
    }

    pub fn from_file(path: &str) -> Result<Self, RegistryError> {
        let raw = std::fs::read_to_string(path).map_err(|e| RegistryError::Source(format!("{path}: {e}")))?;
        let clients: Vec<Client> =
            serde_json::from_str(&raw).map_err(|e| RegistryError::Source(format!("{path}: {e}")))?;
        Ok(Self::new(clients))
    }
}

#[async_trait]
impl ClientRegistry for InMemoryRegistry {
    async fn list_clients(&self) -> Result<Vec<Client>, RegistryError> {
        Ok(self.clients.clone())
    }

    async fn get_client(&self, id: &ClientId) -> Result<Client, RegistryError> {
        self.by_id
            .get(id)
            .map(|&i| self.clients[i].clone())
            .ok_or_else(|| RegistryError::NotFound(id.clone()))
    }
}

pub struct RestRegistry {
    http: reqwest::Client,
    base: String,
}

impl RestRegistry {
    pub fn new(http: reqwest::Client, base: &str) -> Self {
        Self { http, base: base.trim_end_matches('/').to_string() }
    }
}

#[async_trait]
impl ClientRegistry for RestRegistry {
    async fn list_clients(&self) -> Result<Vec<Client>, RegistryError> {
        let url = format!("{}/api/v1/clients", self.base);
        let rsp = self.http.get(url).send().await.map_err(|e| RegistryError::Source(e.to_string()))?;
        if !rsp.status().is_success() {
            return Err(RegistryError::Source(format!("list clients: HTTP {}", rsp.status())));
        }
        rsp.json::<Vec<Client>>().await.map_err(|e| RegistryError::Source(e.to_string()))
    }

    async fn get_client(&self, id: &ClientId) -> Result<Client, RegistryError> {
        let url = format!("{}/api/v1/clients/{}", self.base, urlencoding::encode(&id.0));
        let rsp = self.http.get(url).send().await.map_err(|e| RegistryError::Source(e.to_string()))?;
        match rsp.status() {
            reqwest::StatusCode::NOT_FOUND => Err(RegistryError::NotFound(id.clone())),
            s if s.is_success() => rsp.json::<Client>().await.map_err(|e| RegistryError::Source(e.to_string())),
            s => Err(RegistryError::Source(format!("get client: HTTP {s}"))),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_clients(ids: &[&str]) -> Vec<Client> {
    ids.iter()
        .map(|id| Client {
            id: (*id).into(),
            display_name: format!("Client {id}"),
            broker_client_id: format!("BRK-{id}"),
        })
        .collect()
}
