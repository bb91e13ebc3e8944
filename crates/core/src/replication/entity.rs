use std::collections::BTreeMap;

use crate::net::{PropertyDelta, PropertyValue, Transform};

use super::registry::ReplicatedEntity;

pub type EntityId = u32;

/// Property name that maps onto the entity transform instead of the
/// property table.
pub const TRANSFORM_PROPERTY: &str = "transform";

/// Client-side lifecycle of a replicated entity. An entity with no record
/// is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicationState {
    Created,
    Synchronized,
    Predicting,
    /// Predictions were discarded; waiting for authoritative state.
    Resyncing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertySlot {
    pub value: PropertyValue,
    pub frame_tick: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaOutcome {
    pub applied: usize,
    pub stale: usize,
}

/// An observer's copy of one replicated entity.
pub struct EntityRecord {
    entity_id: EntityId,
    entity_type: String,
    transform: Transform,
    transform_tick: u32,
    created_tick: u32,
    frame_tick: u32,
    properties: BTreeMap<String, PropertySlot>,
    state: ReplicationState,
    instance: Box<dyn ReplicatedEntity>,
}

impl EntityRecord {
    pub fn new(
        entity_id: EntityId,
        entity_type: impl Into<String>,
        transform: Transform,
        frame_tick: u32,
        mut instance: Box<dyn ReplicatedEntity>,
    ) -> Self {
        instance.on_transform_changed(&transform);
        Self {
            entity_id,
            entity_type: entity_type.into(),
            transform,
            transform_tick: frame_tick,
            created_tick: frame_tick,
            frame_tick,
            properties: BTreeMap::new(),
            state: ReplicationState::Created,
            instance,
        }
    }

    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Latest authoritative transform.
    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    pub fn created_tick(&self) -> u32 {
        self.created_tick
    }

    /// Highest frame tick applied to this record.
    pub fn frame_tick(&self) -> u32 {
        self.frame_tick
    }

    pub fn state(&self) -> ReplicationState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ReplicationState) {
        if self.state != state {
            log::trace!("entity {} {:?} -> {:?}", self.entity_id, self.state, state);
            self.state = state;
        }
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name).map(|slot| &slot.value)
    }

    pub fn property_tick(&self, name: &str) -> Option<u32> {
        self.properties.get(name).map(|slot| slot.frame_tick)
    }

    pub fn properties(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.properties
            .iter()
            .map(|(name, slot)| (name.as_str(), &slot.value))
    }

    pub fn instance(&self) -> &dyn ReplicatedEntity {
        self.instance.as_ref()
    }

    pub fn instance_mut(&mut self) -> &mut dyn ReplicatedEntity {
        self.instance.as_mut()
    }

    /// Applies a property batch with per-property last-write-wins: a value is
    /// written only when the batch is at least as new as the last write to
    /// that property. Batches older than the record's creation are stale.
    pub fn apply_delta(&mut self, delta: &PropertyDelta) -> DeltaOutcome {
        let mut outcome = DeltaOutcome::default();
        let tick = delta.frame_tick;

        if tick < self.created_tick {
            outcome.stale = delta.properties.len();
            return outcome;
        }

        for (name, value) in &delta.properties {
            if let PropertyValue::None = value {
                continue;
            }

            if name == TRANSFORM_PROPERTY {
                if let PropertyValue::Transform(transform) = value {
                    if self.set_transform(*transform, tick) {
                        outcome.applied += 1;
                    } else {
                        outcome.stale += 1;
                    }
                    continue;
                }
            }

            if self.property_tick(name).is_some_and(|last| tick < last) {
                outcome.stale += 1;
                continue;
            }

            self.properties.insert(
                name.clone(),
                PropertySlot {
                    value: value.clone(),
                    frame_tick: tick,
                },
            );
            self.instance.on_property_changed(name, value);
            outcome.applied += 1;
        }

        if outcome.applied > 0 {
            self.frame_tick = self.frame_tick.max(tick);
        }
        outcome
    }

    /// Stores an authoritative transform unless a newer one was already
    /// applied.
    pub fn set_transform(&mut self, transform: Transform, frame_tick: u32) -> bool {
        if frame_tick < self.transform_tick {
            return false;
        }
        self.transform_tick = frame_tick;
        self.frame_tick = self.frame_tick.max(frame_tick);
        if self.transform != transform {
            self.transform = transform;
            self.instance.on_transform_changed(&transform);
        }
        true
    }
}

impl std::fmt::Debug for EntityRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRecord")
            .field("entity_id", &self.entity_id)
            .field("entity_type", &self.entity_type)
            .field("transform", &self.transform)
            .field("frame_tick", &self.frame_tick)
            .field("state", &self.state)
            .field("properties", &self.properties)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;
    use crate::replication::EntityFactoryRegistry;

    fn record(created_tick: u32) -> EntityRecord {
        let mut registry = EntityFactoryRegistry::new();
        registry.register_plain("BasicUnit").unwrap();
        let instance = registry.create("BasicUnit", 5).unwrap();
        EntityRecord::new(5, "BasicUnit", Transform::IDENTITY, created_tick, instance)
    }

    #[test]
    fn newer_delta_wins_per_property() {
        let mut record = record(0);

        record.apply_delta(&PropertyDelta::new(5, 10).with("health", PropertyValue::Int32(80)));
        let outcome = record.apply_delta(
            &PropertyDelta::new(5, 8)
                .with("health", PropertyValue::Int32(95))
                .with("name", PropertyValue::String("grunt".into())),
        );

        assert_eq!(outcome, DeltaOutcome { applied: 1, stale: 1 });
        assert_eq!(record.property("health"), Some(&PropertyValue::Int32(80)));
        assert_eq!(record.property("name").and_then(|v| v.as_str()), Some("grunt"));
        assert_eq!(record.frame_tick(), 10);
    }

    #[test]
    fn deltas_before_creation_are_stale() {
        let mut record = record(20);
        let outcome =
            record.apply_delta(&PropertyDelta::new(5, 19).with("health", PropertyValue::Int32(1)));

        assert_eq!(outcome.applied, 0);
        assert_eq!(record.property("health"), None);
    }

    #[test]
    fn none_is_skipped_and_null_clears() {
        let mut record = record(0);
        record.apply_delta(&PropertyDelta::new(5, 1).with("target", PropertyValue::Int32(9)));

        record.apply_delta(&PropertyDelta::new(5, 2).with("target", PropertyValue::None));
        assert_eq!(record.property("target"), Some(&PropertyValue::Int32(9)));

        record.apply_delta(&PropertyDelta::new(5, 3).with("target", PropertyValue::Null));
        assert_eq!(record.property("target"), Some(&PropertyValue::Null));
    }

    #[test]
    fn transform_property_moves_the_entity() {
        let mut record = record(0);
        let moved = Transform::from_position(Vec3::new(1.0, 2.0, 3.0));

        let delta =
            PropertyDelta::new(5, 4).with(TRANSFORM_PROPERTY, PropertyValue::Transform(moved));
        record.apply_delta(&delta);
        assert_eq!(record.transform(), &moved);
        assert_eq!(record.property(TRANSFORM_PROPERTY), None);

        assert!(!record.set_transform(Transform::IDENTITY, 3));
        assert_eq!(record.transform(), &moved);
    }
}
