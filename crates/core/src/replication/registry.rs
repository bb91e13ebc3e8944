use std::collections::HashMap;

use crate::net::{PropertyValue, Transform};

use super::{EntityId, ReplicationError};

/// Local representation of a replicated entity, built by the factory
/// registry and notified whenever replicated state changes.
pub trait ReplicatedEntity {
    fn entity_type(&self) -> &str;

    fn on_property_changed(&mut self, _name: &str, _value: &PropertyValue) {}

    fn on_transform_changed(&mut self, _transform: &Transform) {}

    fn on_destroyed(&mut self) {}
}

type Constructor = Box<dyn Fn(EntityId) -> Box<dyn ReplicatedEntity>>;

/// Explicit `entity type -> constructor` table, filled at startup.
#[derive(Default)]
pub struct EntityFactoryRegistry {
    constructors: HashMap<String, Constructor>,
}

impl EntityFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(
        &mut self,
        entity_type: impl Into<String>,
        constructor: F,
    ) -> Result<(), ReplicationError>
    where
        F: Fn(EntityId) -> Box<dyn ReplicatedEntity> + 'static,
    {
        let entity_type = entity_type.into();
        if self.constructors.contains_key(&entity_type) {
            return Err(ReplicationError::DuplicateEntityType(entity_type));
        }
        log::debug!("registered entity type {entity_type}");
        self.constructors.insert(entity_type, Box::new(constructor));
        Ok(())
    }

    /// Registers a type whose local representation only tracks its name.
    pub fn register_plain(
        &mut self,
        entity_type: impl Into<String>,
    ) -> Result<(), ReplicationError> {
        let entity_type = entity_type.into();
        let name = entity_type.clone();
        self.register(entity_type, move |_| -> Box<dyn ReplicatedEntity> {
            Box::new(PlainEntity {
                entity_type: name.clone(),
            })
        })
    }

    pub fn create(
        &self,
        entity_type: &str,
        entity_id: EntityId,
    ) -> Result<Box<dyn ReplicatedEntity>, ReplicationError> {
        let constructor = self
            .constructors
            .get(entity_type)
            .ok_or_else(|| ReplicationError::UnknownEntityType(entity_type.to_string()))?;
        Ok(constructor(entity_id))
    }

    pub fn contains(&self, entity_type: &str) -> bool {
        self.constructors.contains_key(entity_type)
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }
}

impl std::fmt::Debug for EntityFactoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.constructors.keys().collect();
        names.sort();
        f.debug_struct("EntityFactoryRegistry")
            .field("types", &names)
            .finish()
    }
}

#[derive(Debug)]
struct PlainEntity {
    entity_type: String,
}

impl ReplicatedEntity for PlainEntity {
    fn entity_type(&self) -> &str {
        &self.entity_type
    }
}
