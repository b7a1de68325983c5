use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::machine::{ConnectionUpdate, MachineRecord};

#[derive(Debug, Clone)]
pub enum StoreError {
    MachineNotFound(String),
    ConnectionNotFound(String),
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::MachineNotFound(id) => write!(f, "machine not found: {id}"),
            StoreError::ConnectionNotFound(id) => write!(f, "connection not found: {id}"),
            StoreError::Backend(msg) => write!(f, "config store backend error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// The authoritative configuration source. The engine holds no cross-request
/// credential cache; everything flows through here.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn load(&self, machine_id: &str) -> Result<Option<MachineRecord>, StoreError>;

    /// Field-wise merge into one connection of one machine.
    async fn update_connection(
        &self,
        machine_id: &str,
        connection_id: &str,
        update: ConnectionUpdate,
    ) -> Result<(), StoreError>;
}

/// In-memory store used by the binary's single-machine mode and by tests.
#[derive(Default)]
pub struct MemoryConfigStore {
    machines: RwLock<HashMap<String, MachineRecord>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, machine_id: impl Into<String>, record: MachineRecord) {
        self.machines.write().await.insert(machine_id.into(), record);
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn load(&self, machine_id: &str) -> Result<Option<MachineRecord>, StoreError> {
        Ok(self.machines.read().await.get(machine_id).cloned())
    }

    async fn update_connection(
        &self,
        machine_id: &str,
        connection_id: &str,
        update: ConnectionUpdate,
    ) -> Result<(), StoreError> {
        let mut guard = self.machines.write().await;
        let record = guard
            .get_mut(machine_id)
            .ok_or_else(|| StoreError::MachineNotFound(machine_id.to_string()))?;
        let connection = record
            .providers
            .get_mut(connection_id)
            .ok_or_else(|| StoreError::ConnectionNotFound(connection_id.to_string()))?;
        update.apply(connection, OffsetDateTime::now_utc());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::ProviderKind;
    use crate::machine::ProviderConnection;

    #[tokio::test]
    async fn update_reaches_the_stored_connection() {
        let store = MemoryConfigStore::new();
        let mut record = MachineRecord::default();
        record.providers.insert(
            "conn-1".to_string(),
            ProviderConnection::new_api_key("conn-1", ProviderKind::Openai, "sk-x"),
        );
        store.insert("m1", record).await;

        store
            .update_connection(
                "m1",
                "conn-1",
                ConnectionUpdate {
                    access_token: Some("fresh".to_string()),
                    ..ConnectionUpdate::default()
                },
            )
            .await
            .unwrap();

        let record = store.load("m1").await.unwrap().unwrap();
        assert_eq!(
            record.providers["conn-1"].access_token.as_deref(),
            Some("fresh")
        );

        let missing = store
            .update_connection("m1", "nope", ConnectionUpdate::default())
            .await;
        assert!(matches!(missing, Err(StoreError::ConnectionNotFound(_))));
    }
}
