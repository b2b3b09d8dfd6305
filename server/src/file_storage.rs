//! World database kept as one JSON file per table inside the world directory.
//!
//! Reads are served from memory. Each write rewrites the table it touched
//! through a temporary file and a rename, so a crash never leaves a half
//! written table behind.

use crate::storage::{Storage, StorageError, Tables, User};
use async_trait::async_trait;
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared::{Blueprint, Entity, EntityId, UserId};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

const USERS_FILE: &str = "users.json";
const BLUEPRINTS_FILE: &str = "blueprints.json";
const ENTITIES_FILE: &str = "entities.json";
const CONFIG_FILE: &str = "config.json";

pub struct FileStorage {
    dir: PathBuf,
    tables: Mutex<Tables>,
}

impl FileStorage {
    /// Opens the database in `dir`, creating the directory if needed.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let tables = Tables {
            users: read_table(&dir, USERS_FILE).await?,
            blueprints: read_table(&dir, BLUEPRINTS_FILE).await?,
            entities: read_table(&dir, ENTITIES_FILE).await?,
            config: read_table(&dir, CONFIG_FILE).await?,
        };
        info!(
            "Opened world database at {} ({} users, {} blueprints, {} entities)",
            dir.display(),
            tables.users.len(),
            tables.blueprints.len(),
            tables.entities.len()
        );

        Ok(Self {
            dir,
            tables: Mutex::new(tables),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn write_table<T: Serialize>(&self, name: &str, table: &T) -> Result<(), StorageError> {
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{}.tmp", name));
        let json = serde_json::to_vec_pretty(table)?;
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!("Wrote {} ({} bytes)", path.display(), json.len());
        Ok(())
    }
}

async fn read_table<T: DeserializeOwned + Default>(
    dir: &Path,
    name: &str,
) -> Result<T, StorageError> {
    match tokio::fs::read(dir.join(name)).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn user(&self, id: &UserId) -> Result<Option<User>, StorageError> {
        Ok(self.tables.lock().await.users.get(id).cloned())
    }

    async fn save_user(&self, user: &User) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().await;
        tables.users.insert(user.id.clone(), user.clone());
        self.write_table(USERS_FILE, &tables.users).await
    }

    async fn blueprints(&self) -> Result<Vec<Blueprint>, StorageError> {
        let tables = self.tables.lock().await;
        Ok(tables.blueprints.values().map(|r| r.data.clone()).collect())
    }

    async fn save_blueprint(&self, blueprint: &Blueprint) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().await;
        tables.put_blueprint(blueprint);
        self.write_table(BLUEPRINTS_FILE, &tables.blueprints).await
    }

    async fn entities(&self) -> Result<Vec<Entity>, StorageError> {
        let tables = self.tables.lock().await;
        Ok(tables.entities.values().map(|r| r.data.clone()).collect())
    }

    async fn save_entity(&self, entity: &Entity) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().await;
        tables.put_entity(entity);
        self.write_table(ENTITIES_FILE, &tables.entities).await
    }

    async fn delete_entity(&self, id: &EntityId) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().await;
        if tables.entities.remove(id).is_none() {
            return Ok(());
        }
        self.write_table(ENTITIES_FILE, &tables.entities).await
    }

    async fn config(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
        Ok(self.tables.lock().await.config.get(key).cloned())
    }

    async fn set_config(&self, key: &str, value: serde_json::Value) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().await;
        tables.config.insert(key.to_string(), value);
        self.write_table(CONFIG_FILE, &tables.config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{AppEntity, BlueprintId, Rank};
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_tables_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = FileStorage::open(dir.path()).await.unwrap();
            let mut user = User::anonymous();
            user.id = UserId::from("u1");
            user.rank = Rank::Builder;
            assert_ok!(storage.save_user(&user).await);
            assert_ok!(
                storage
                    .save_blueprint(&Blueprint::new(BlueprintId::from("bp"), "Tree"))
                    .await
            );
            assert_ok!(
                storage
                    .save_entity(&Entity::App(AppEntity::new(
                        EntityId::from("e1"),
                        BlueprintId::from("bp"),
                    )))
                    .await
            );
            assert_ok!(
                storage
                    .set_config("spawn", serde_json::json!({ "position": [1.0, 0.0, 0.0] }))
                    .await
            );
        }

        let storage = FileStorage::open(dir.path()).await.unwrap();
        let user = assert_ok!(storage.user(&UserId::from("u1")).await).unwrap();
        assert_eq!(user.rank, Rank::Builder);
        assert_eq!(storage.blueprints().await.unwrap()[0].name, "Tree");
        assert_eq!(storage.entities().await.unwrap().len(), 1);
        assert!(storage.config("spawn").await.unwrap().is_some());
        assert!(!dir.path().join("entities.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_missing_directory_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("worlds").join("plaza");
        let storage = FileStorage::open(&nested).await.unwrap();
        assert!(storage.dir().is_dir());
        assert!(storage.blueprints().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_table_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("users.json"), b"{ not json").unwrap();
        assert!(matches!(
            FileStorage::open(dir.path()).await,
            Err(StorageError::Json(_))
        ));
    }
}
