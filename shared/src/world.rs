//! In-memory world state shared by the server registry and the client session.
//!
//! Both sides drive it through the same small set of operations; permission
//! and version checks are the caller's business.

use crate::ids::{BlueprintId, EntityId, UserId};
use crate::model::{
    Blueprint, BlueprintPatch, ChatMessage, Collection, Entity, EntityPatch, PlayerEntity,
    Settings, Spawn,
};
use std::collections::{HashMap, VecDeque};

/// Number of chat messages kept in the log.
pub const MAX_CHAT_MESSAGES: usize = 50;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum WorldError {
    #[error("entity {0} already exists")]
    DuplicateEntity(EntityId),

    #[error("entity {0} not found")]
    EntityNotFound(EntityId),

    #[error("blueprint {0} already exists")]
    DuplicateBlueprint(BlueprintId),

    #[error("blueprint {0} not found")]
    BlueprintNotFound(BlueprintId),
}

#[derive(Debug, Clone)]
pub struct World {
    pub settings: Settings,
    pub spawn: Spawn,
    pub collections: Vec<Collection>,
    blueprints: HashMap<BlueprintId, Blueprint>,
    entities: HashMap<EntityId, Entity>,
    chat: VecDeque<ChatMessage>,
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    pub fn new() -> Self {
        Self {
            settings: Settings::default(),
            spawn: Spawn::default(),
            collections: vec![Collection::default_collection()],
            blueprints: HashMap::new(),
            entities: HashMap::new(),
            chat: VecDeque::new(),
        }
    }

    pub fn blueprint(&self, id: &BlueprintId) -> Option<&Blueprint> {
        self.blueprints.get(id)
    }

    /// Blueprints sorted by id.
    pub fn blueprints(&self) -> Vec<Blueprint> {
        let mut blueprints: Vec<Blueprint> = self.blueprints.values().cloned().collect();
        blueprints.sort_by(|a, b| a.id.cmp(&b.id));
        blueprints
    }

    pub fn add_blueprint(&mut self, blueprint: Blueprint) -> Result<&Blueprint, WorldError> {
        if self.blueprints.contains_key(&blueprint.id) {
            return Err(WorldError::DuplicateBlueprint(blueprint.id));
        }
        let id = blueprint.id.clone();
        Ok(&*self.blueprints.entry(id).or_insert(blueprint))
    }

    /// Applies a patch without looking at versions.
    pub fn modify_blueprint(&mut self, patch: &BlueprintPatch) -> Result<&Blueprint, WorldError> {
        let blueprint = self
            .blueprints
            .get_mut(&patch.id)
            .ok_or_else(|| WorldError::BlueprintNotFound(patch.id.clone()))?;
        patch.apply_to(blueprint);
        Ok(&*blueprint)
    }

    /// Replaces every blueprint, used when loading or applying a snapshot.
    pub fn set_blueprints(&mut self, blueprints: Vec<Blueprint>) {
        self.blueprints = blueprints
            .into_iter()
            .map(|blueprint| (blueprint.id.clone(), blueprint))
            .collect();
    }

    pub fn entity(&self, id: &EntityId) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn has_entity(&self, id: &EntityId) -> bool {
        self.entities.contains_key(id)
    }

    /// Entities sorted by id.
    pub fn entities(&self) -> Vec<Entity> {
        let mut entities: Vec<Entity> = self.entities.values().cloned().collect();
        entities.sort_by(|a, b| a.id().cmp(b.id()));
        entities
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn apps(&self) -> impl Iterator<Item = &crate::model::AppEntity> {
        self.entities.values().filter_map(Entity::as_app)
    }

    pub fn player(&self, user: &UserId) -> Option<&PlayerEntity> {
        self.entities
            .get(&EntityId::from(user))
            .and_then(Entity::as_player)
    }

    pub fn add_entity(&mut self, entity: Entity) -> Result<&Entity, WorldError> {
        if self.entities.contains_key(entity.id()) {
            return Err(WorldError::DuplicateEntity(entity.id().clone()));
        }
        let id = entity.id().clone();
        Ok(&*self.entities.entry(id).or_insert(entity))
    }

    pub fn modify_entity(&mut self, patch: &EntityPatch) -> Result<&Entity, WorldError> {
        let entity = self
            .entities
            .get_mut(&patch.id)
            .ok_or_else(|| WorldError::EntityNotFound(patch.id.clone()))?;
        entity.apply(patch);
        Ok(&*entity)
    }

    pub fn remove_entity(&mut self, id: &EntityId) -> Option<Entity> {
        self.entities.remove(id)
    }

    pub fn set_entities(&mut self, entities: Vec<Entity>) {
        self.entities = entities
            .into_iter()
            .map(|entity| (entity.id().clone(), entity))
            .collect();
    }

    pub fn chat(&self) -> Vec<ChatMessage> {
        self.chat.iter().cloned().collect()
    }

    /// Appends to the chat log, dropping the oldest message past the cap.
    pub fn add_chat(&mut self, message: ChatMessage) {
        self.chat.push_back(message);
        while self.chat.len() > MAX_CHAT_MESSAGES {
            self.chat.pop_front();
        }
    }

    pub fn clear_chat(&mut self) {
        self.chat.clear();
    }

    pub fn set_chat(&mut self, messages: Vec<ChatMessage>) {
        self.chat.clear();
        for message in messages {
            self.add_chat(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AppEntity;

    fn app(id: &str) -> Entity {
        Entity::App(AppEntity::new(EntityId::from(id), BlueprintId::from("bp")))
    }

    #[test]
    fn test_add_and_remove_entities() {
        let mut world = World::new();
        world.add_entity(app("a")).unwrap();
        world.add_entity(app("b")).unwrap();
        assert_eq!(world.entity_count(), 2);

        assert_eq!(
            world.add_entity(app("a")).unwrap_err(),
            WorldError::DuplicateEntity(EntityId::from("a"))
        );

        assert!(world.remove_entity(&EntityId::from("a")).is_some());
        assert!(world.remove_entity(&EntityId::from("a")).is_none());
        assert_eq!(world.entity_count(), 1);
    }

    #[test]
    fn test_modify_missing_entity() {
        let mut world = World::new();
        let patch = EntityPatch::new(EntityId::from("ghost"));
        assert!(matches!(
            world.modify_entity(&patch),
            Err(WorldError::EntityNotFound(_))
        ));
    }

    #[test]
    fn test_modify_blueprint_ignores_version_order() {
        let mut world = World::new();
        let mut blueprint = Blueprint::new(BlueprintId::from("bp"), "Box");
        blueprint.version = 5;
        world.add_blueprint(blueprint).unwrap();

        let patch = BlueprintPatch::new(BlueprintId::from("bp"), 2);
        let stored = world.modify_blueprint(&patch).unwrap();
        assert_eq!(stored.version, 2);
    }

    #[test]
    fn test_chat_is_bounded() {
        let mut world = World::new();
        for i in 0..(MAX_CHAT_MESSAGES + 10) {
            world.add_chat(ChatMessage::system(format!("line {}", i)));
        }
        let chat = world.chat();
        assert_eq!(chat.len(), MAX_CHAT_MESSAGES);
        assert_eq!(chat[0].body, "line 10");

        world.clear_chat();
        assert!(world.chat().is_empty());
    }

    #[test]
    fn test_entities_are_listed_in_id_order() {
        let mut world = World::new();
        world.add_entity(app("c")).unwrap();
        world.add_entity(app("a")).unwrap();
        world.add_entity(app("b")).unwrap();
        let ids: Vec<String> = world
            .entities()
            .iter()
            .map(|entity| entity.id().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
