//! Dirty tracking and the periodic persistence sweep.
//!
//! Handlers never write storage themselves. Blueprints and apps are marked by
//! id and the sweep reads their current state from the world; user records and
//! config values are queued whole, latest value wins. Anything whose write
//! fails stays queued for the next sweep.

use crate::storage::{Storage, User};
use log::{debug, error, info};
use shared::{BlueprintId, EntityId, UserId, World};
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SaveReport {
    pub upserted: usize,
    pub deleted: usize,
    /// Apps still being moved or uploaded, left for a later sweep.
    pub skipped: usize,
    pub failed: usize,
}

impl SaveReport {
    pub fn is_empty(&self) -> bool {
        self.upserted == 0 && self.deleted == 0 && self.skipped == 0 && self.failed == 0
    }
}

#[derive(Debug, Default)]
pub struct Persistence {
    dirty_blueprints: HashSet<BlueprintId>,
    dirty_apps: HashSet<EntityId>,
    dirty_users: HashMap<UserId, User>,
    dirty_config: BTreeMap<String, serde_json::Value>,
}

impl Persistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_blueprint(&mut self, id: BlueprintId) {
        self.dirty_blueprints.insert(id);
    }

    pub fn mark_app(&mut self, id: EntityId) {
        self.dirty_apps.insert(id);
    }

    pub fn mark_user(&mut self, user: User) {
        self.dirty_users.insert(user.id.clone(), user);
    }

    pub fn mark_config(&mut self, key: &str, value: serde_json::Value) {
        self.dirty_config.insert(key.to_string(), value);
    }

    /// A user record written since the last sweep, newer than storage's copy.
    pub fn pending_user(&self, id: &UserId) -> Option<&User> {
        self.dirty_users.get(id)
    }

    pub fn is_config_dirty(&self, key: &str) -> bool {
        self.dirty_config.contains_key(key)
    }

    pub fn is_blueprint_dirty(&self, id: &BlueprintId) -> bool {
        self.dirty_blueprints.contains(id)
    }

    pub fn is_app_dirty(&self, id: &EntityId) -> bool {
        self.dirty_apps.contains(id)
    }

    pub fn pending(&self) -> usize {
        self.dirty_blueprints.len()
            + self.dirty_apps.len()
            + self.dirty_users.len()
            + self.dirty_config.len()
    }

    pub async fn save(&mut self, world: &World, storage: &dyn Storage) -> SaveReport {
        let mut report = SaveReport::default();

        let users: Vec<User> = self.dirty_users.drain().map(|(_, user)| user).collect();
        for user in users {
            match storage.save_user(&user).await {
                Ok(()) => report.upserted += 1,
                Err(e) => {
                    error!("Failed to save user {}: {}", user.id, e);
                    report.failed += 1;
                    self.dirty_users.insert(user.id.clone(), user);
                }
            }
        }

        let config = std::mem::take(&mut self.dirty_config);
        for (key, value) in config {
            match storage.set_config(&key, value.clone()).await {
                Ok(()) => report.upserted += 1,
                Err(e) => {
                    error!("Failed to save config {}: {}", key, e);
                    report.failed += 1;
                    self.dirty_config.insert(key, value);
                }
            }
        }

        let blueprints: Vec<BlueprintId> = self.dirty_blueprints.drain().collect();
        for id in blueprints {
            let Some(blueprint) = world.blueprint(&id) else {
                // blueprints are never deleted
                continue;
            };
            match storage.save_blueprint(blueprint).await {
                Ok(()) => report.upserted += 1,
                Err(e) => {
                    error!("Failed to save blueprint {}: {}", id, e);
                    report.failed += 1;
                    self.dirty_blueprints.insert(id);
                }
            }
        }

        let apps: Vec<EntityId> = self.dirty_apps.drain().collect();
        for id in apps {
            match world.entity(&id) {
                Some(entity) => {
                    let Some(app) = entity.as_app() else {
                        continue;
                    };
                    if !app.is_settled() {
                        report.skipped += 1;
                        self.dirty_apps.insert(id);
                        continue;
                    }
                    match storage.save_entity(entity).await {
                        Ok(()) => report.upserted += 1,
                        Err(e) => {
                            error!("Failed to save app {}: {}", id, e);
                            report.failed += 1;
                            self.dirty_apps.insert(id);
                        }
                    }
                }
                None => match storage.delete_entity(&id).await {
                    Ok(()) => report.deleted += 1,
                    Err(e) => {
                        error!("Failed to delete app {}: {}", id, e);
                        report.failed += 1;
                        self.dirty_apps.insert(id);
                    }
                },
            }
        }

        if report.upserted + report.deleted > 0 {
            info!(
                "World saved ({} upserted, {} deleted, {} deferred, {} failed)",
                report.upserted, report.deleted, report.skipped, report.failed
            );
        } else if !report.is_empty() {
            debug!(
                "Nothing saved ({} deferred, {} failed)",
                report.skipped, report.failed
            );
        }
        report
    }
}
