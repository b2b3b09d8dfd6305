//! Durable storage seam.
//!
//! The server only ever talks to [`Storage`]; [`MemoryStorage`] backs tests and
//! throwaway worlds, [`crate::file_storage::FileStorage`] keeps a world on disk.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::{get_timestamp, Blueprint, BlueprintId, Entity, EntityId, Rank, UserId};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;

/// Config key of the persisted [`shared::Settings`].
pub const SETTINGS_KEY: &str = "settings";
/// Config key of the persisted [`shared::Spawn`].
pub const SPAWN_KEY: &str = "spawn";
/// Config key recording which storage layout the world was written with.
pub const VERSION_KEY: &str = "version";
pub const SCHEMA_VERSION: u64 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub avatar: Option<String>,
    pub rank: Rank,
    pub created_at: u64,
}

impl User {
    /// Fresh visitor record for a connection without a valid token.
    pub fn anonymous() -> Self {
        Self {
            id: UserId::generate(),
            name: shared::model::DEFAULT_PLAYER_NAME.to_string(),
            avatar: None,
            rank: Rank::Visitor,
            created_at: get_timestamp(),
        }
    }
}

/// A stored row with its bookkeeping timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record<T> {
    pub data: T,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Every table of a world database.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Tables {
    pub users: BTreeMap<UserId, User>,
    pub blueprints: BTreeMap<BlueprintId, Record<Blueprint>>,
    pub entities: BTreeMap<EntityId, Record<Entity>>,
    pub config: BTreeMap<String, serde_json::Value>,
}

impl Tables {
    fn upsert<K: Ord, T>(table: &mut BTreeMap<K, Record<T>>, key: K, data: T) {
        let now = get_timestamp();
        match table.get_mut(&key) {
            Some(record) => {
                record.data = data;
                record.updated_at = now;
            }
            None => {
                table.insert(
                    key,
                    Record {
                        data,
                        created_at: now,
                        updated_at: now,
                    },
                );
            }
        }
    }

    pub fn put_blueprint(&mut self, blueprint: &Blueprint) {
        Self::upsert(&mut self.blueprints, blueprint.id.clone(), blueprint.clone());
    }

    pub fn put_entity(&mut self, entity: &Entity) {
        Self::upsert(&mut self.entities, entity.id().clone(), entity.clone());
    }
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn user(&self, id: &UserId) -> Result<Option<User>, StorageError>;
    async fn save_user(&self, user: &User) -> Result<(), StorageError>;

    async fn blueprints(&self) -> Result<Vec<Blueprint>, StorageError>;
    async fn save_blueprint(&self, blueprint: &Blueprint) -> Result<(), StorageError>;

    async fn entities(&self) -> Result<Vec<Entity>, StorageError>;
    async fn save_entity(&self, entity: &Entity) -> Result<(), StorageError>;
    async fn delete_entity(&self, id: &EntityId) -> Result<(), StorageError>;

    async fn config(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError>;
    async fn set_config(&self, key: &str, value: serde_json::Value) -> Result<(), StorageError>;
}

/// Storage that lives and dies with the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    tables: Mutex<Tables>,
    writes: AtomicU64,
    failing: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Makes every following write fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn tables(&self) -> Tables {
        self.tables.lock().await.clone()
    }

    fn begin_write(&self) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("writes disabled".to_string()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn user(&self, id: &UserId) -> Result<Option<User>, StorageError> {
        Ok(self.tables.lock().await.users.get(id).cloned())
    }

    async fn save_user(&self, user: &User) -> Result<(), StorageError> {
        self.begin_write()?;
        self.tables
            .lock()
            .await
            .users
            .insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn blueprints(&self) -> Result<Vec<Blueprint>, StorageError> {
        let tables = self.tables.lock().await;
        Ok(tables.blueprints.values().map(|r| r.data.clone()).collect())
    }

    async fn save_blueprint(&self, blueprint: &Blueprint) -> Result<(), StorageError> {
        self.begin_write()?;
        self.tables.lock().await.put_blueprint(blueprint);
        Ok(())
    }

    async fn entities(&self) -> Result<Vec<Entity>, StorageError> {
        let tables = self.tables.lock().await;
        Ok(tables.entities.values().map(|r| r.data.clone()).collect())
    }

    async fn save_entity(&self, entity: &Entity) -> Result<(), StorageError> {
        self.begin_write()?;
        self.tables.lock().await.put_entity(entity);
        Ok(())
    }

    async fn delete_entity(&self, id: &EntityId) -> Result<(), StorageError> {
        self.begin_write()?;
        self.tables.lock().await.entities.remove(id);
        Ok(())
    }

    async fn config(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
        Ok(self.tables.lock().await.config.get(key).cloned())
    }

    async fn set_config(&self, key: &str, value: serde_json::Value) -> Result<(), StorageError> {
        self.begin_write()?;
        self.tables
            .lock()
            .await
            .config
            .insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::AppEntity;

    #[tokio::test]
    async fn test_records_keep_created_at() {
        let storage = MemoryStorage::new();
        let mut blueprint = Blueprint::new(BlueprintId::from("bp"), "Lamp");
        storage.save_blueprint(&blueprint).await.unwrap();
        let created = storage.tables().await.blueprints[&BlueprintId::from("bp")].created_at;

        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        blueprint.version = 2;
        storage.save_blueprint(&blueprint).await.unwrap();

        let tables = storage.tables().await;
        let record = &tables.blueprints[&BlueprintId::from("bp")];
        assert_eq!(record.created_at, created);
        assert!(record.updated_at > created);
        assert_eq!(record.data.version, 2);
        assert_eq!(storage.write_count(), 2);
    }

    #[tokio::test]
    async fn test_entity_delete() {
        let storage = MemoryStorage::new();
        let app = Entity::App(AppEntity::new(EntityId::from("a"), BlueprintId::from("bp")));
        storage.save_entity(&app).await.unwrap();
        assert_eq!(storage.entities().await.unwrap(), vec![app]);

        storage.delete_entity(&EntityId::from("a")).await.unwrap();
        assert!(storage.entities().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_writes() {
        let storage = MemoryStorage::new();
        storage.set_failing(true);
        let result = storage.set_config(SPAWN_KEY, serde_json::json!({})).await;
        assert!(matches!(result, Err(StorageError::Unavailable(_))));
        assert_eq!(storage.config(SPAWN_KEY).await.unwrap(), None);
        assert_eq!(storage.write_count(), 0);
    }

    #[tokio::test]
    async fn test_anonymous_users_are_visitors() {
        let a = User::anonymous();
        let b = User::anonymous();
        assert_ne!(a.id, b.id);
        assert_eq!(a.rank, Rank::Visitor);
        assert_eq!(a.name, "Anonymous");
    }
}
