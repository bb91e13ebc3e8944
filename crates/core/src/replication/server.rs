use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::coroutine::TickContext;
use crate::net::{
    EntityAcknowledge, EntityCreate, EntityDestroy, InputPredict, NetworkMessage, PropertyDelta,
    PropertyValue, ProtocolError, Transform, Transport,
};
use crate::simulation::{LinearMovement, MovementInput, MovementModel};

use super::entity::{EntityId, TRANSFORM_PROPERTY};
use super::{ReplicationConfig, ReplicationError};

pub type ObserverId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputOutcome {
    Applied,
    /// Already processed; the latest ack was sent again.
    Reacknowledged,
}

/// The authoritative copy of an entity.
#[derive(Debug, Clone)]
pub struct AuthoritativeEntity {
    entity_id: EntityId,
    entity_type: String,
    transform: Transform,
    properties: BTreeMap<String, PropertyValue>,
    dirty: BTreeSet<String>,
    transform_dirty: bool,
    controller: Option<ObserverId>,
    spawned_tick: u32,
}

impl AuthoritativeEntity {
    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    pub fn controller(&self) -> Option<ObserverId> {
        self.controller
    }

    pub fn spawned_tick(&self) -> u32 {
        self.spawned_tick
    }

    fn is_dirty(&self) -> bool {
        self.transform_dirty || !self.dirty.is_empty()
    }

    fn full_delta(&self, frame_tick: u32) -> PropertyDelta {
        let mut delta = PropertyDelta::new(self.entity_id, frame_tick);
        delta.properties.extend(
            self.properties
                .iter()
                .map(|(name, value)| (name.clone(), value.clone())),
        );
        delta.properties.push((
            TRANSFORM_PROPERTY.to_string(),
            PropertyValue::Transform(self.transform),
        ));
        delta
    }

    fn dirty_delta(&self, frame_tick: u32) -> PropertyDelta {
        let mut delta = PropertyDelta::new(self.entity_id, frame_tick);
        for name in &self.dirty {
            if let Some(value) = self.properties.get(name) {
                delta.properties.push((name.clone(), value.clone()));
            }
        }
        if self.transform_dirty {
            delta.properties.push((
                TRANSFORM_PROPERTY.to_string(),
                PropertyValue::Transform(self.transform),
            ));
        }
        delta
    }
}

#[derive(Debug, Default)]
struct Observer {
    known: BTreeSet<EntityId>,
    /// Despawned entities this observer knew, re-announced on keyframes.
    departed: BTreeSet<EntityId>,
    last_input: HashMap<EntityId, u32>,
    outbound: Vec<NetworkMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub inputs_applied: u64,
    pub inputs_reacknowledged: u64,
    pub inputs_rejected: u64,
    pub protocol_errors: u64,
    pub keyframes: u64,
    pub messages_queued: u64,
}

/// Authoritative side of the replication protocol.
///
/// Owns every entity, processes observer inputs through the shared
/// movement model and, once per tick, queues creates, property deltas and
/// periodic keyframes for each observer.
pub struct ServerReplicator {
    config: ReplicationConfig,
    movement: Box<dyn MovementModel>,
    entities: BTreeMap<EntityId, AuthoritativeEntity>,
    observers: BTreeMap<ObserverId, Observer>,
    next_entity_id: EntityId,
    next_observer_id: ObserverId,
    tick: u32,
    stats: ServerStats,
}

impl ServerReplicator {
    pub fn new(config: ReplicationConfig) -> Self {
        Self {
            config,
            movement: Box::new(LinearMovement::default()),
            entities: BTreeMap::new(),
            observers: BTreeMap::new(),
            next_entity_id: 1,
            next_observer_id: 1,
            tick: 0,
            stats: ServerStats::default(),
        }
    }

    pub fn with_movement(mut self, movement: impl MovementModel + 'static) -> Self {
        self.movement = Box::new(movement);
        self
    }

    pub fn add_observer(&mut self) -> ObserverId {
        let id = self.next_observer_id;
        self.next_observer_id += 1;
        self.observers.insert(id, Observer::default());
        log::info!("observer {id} joined");
        id
    }

    pub fn remove_observer(&mut self, observer_id: ObserverId) -> bool {
        if self.observers.remove(&observer_id).is_none() {
            return false;
        }
        for entity in self.entities.values_mut() {
            if entity.controller == Some(observer_id) {
                entity.controller = None;
            }
        }
        log::info!("observer {observer_id} left");
        true
    }

    /// Creates an entity. Ids are never reused within a session.
    pub fn spawn(&mut self, entity_type: impl Into<String>, transform: Transform) -> EntityId {
        let entity_id = self.next_entity_id;
        self.next_entity_id += 1;

        let entity = AuthoritativeEntity {
            entity_id,
            entity_type: entity_type.into(),
            transform,
            properties: BTreeMap::new(),
            dirty: BTreeSet::new(),
            transform_dirty: false,
            controller: None,
            spawned_tick: self.tick,
        };
        log::debug!("spawned entity {entity_id} ({})", entity.entity_type);
        self.entities.insert(entity_id, entity);
        entity_id
    }

    pub fn despawn(&mut self, entity_id: EntityId) -> Result<(), ReplicationError> {
        self.entities
            .remove(&entity_id)
            .ok_or(ReplicationError::UnknownEntity(entity_id))?;

        let capacity = self.config.tombstone_capacity;
        let frame_tick = self.tick_in_progress();
        for observer in self.observers.values_mut() {
            observer.last_input.remove(&entity_id);
            if observer.known.remove(&entity_id) {
                observer.outbound.push(NetworkMessage::EntityDestroy(EntityDestroy {
                    entity_id,
                    frame_tick,
                }));
                self.stats.messages_queued += 1;

                observer.departed.insert(entity_id);
                while observer.departed.len() > capacity {
                    observer.departed.pop_first();
                }
            }
        }
        log::debug!("despawned entity {entity_id}");
        Ok(())
    }

    pub fn set_property(
        &mut self,
        entity_id: EntityId,
        name: impl Into<String>,
        value: PropertyValue,
    ) -> Result<(), ReplicationError> {
        let name = name.into();
        if name == TRANSFORM_PROPERTY {
            if let PropertyValue::Transform(transform) = value {
                return self.set_transform(entity_id, transform);
            }
        }

        let entity = self
            .entities
            .get_mut(&entity_id)
            .ok_or(ReplicationError::UnknownEntity(entity_id))?;

        if matches!(value, PropertyValue::None) || entity.properties.get(&name) == Some(&value) {
            return Ok(());
        }
        entity.properties.insert(name.clone(), value);
        entity.dirty.insert(name);
        Ok(())
    }

    pub fn set_transform(
        &mut self,
        entity_id: EntityId,
        transform: Transform,
    ) -> Result<(), ReplicationError> {
        let entity = self
            .entities
            .get_mut(&entity_id)
            .ok_or(ReplicationError::UnknownEntity(entity_id))?;
        if entity.transform != transform {
            entity.transform = transform;
            entity.transform_dirty = true;
        }
        Ok(())
    }

    /// Lets `observer_id` drive the entity with inputs.
    pub fn assign_control(
        &mut self,
        entity_id: EntityId,
        observer_id: ObserverId,
    ) -> Result<(), ReplicationError> {
        if !self.observers.contains_key(&observer_id) {
            return Err(ReplicationError::UnknownObserver(observer_id));
        }
        let entity = self
            .entities
            .get_mut(&entity_id)
            .ok_or(ReplicationError::UnknownEntity(entity_id))?;
        entity.controller = Some(observer_id);
        log::debug!("observer {observer_id} controls entity {entity_id}");
        Ok(())
    }

    /// Decodes and applies one frame sent by `observer_id`.
    pub fn receive(
        &mut self,
        observer_id: ObserverId,
        frame: &[u8],
    ) -> Result<InputOutcome, ReplicationError> {
        match NetworkMessage::decode(frame)? {
            NetworkMessage::InputPredict(input) => self.process_input(observer_id, &input),
            other => Err(ReplicationError::UnexpectedMessage(other.tag())),
        }
    }

    /// Drains the observer's transport. Rejected messages are logged and
    /// skipped.
    pub fn apply_inbound<T: Transport + ?Sized>(
        &mut self,
        observer_id: ObserverId,
        transport: &mut T,
    ) -> usize {
        let mut applied = 0;
        for frame in transport.receive() {
            match self.receive(observer_id, &frame) {
                Ok(_) => applied += 1,
                Err(ReplicationError::Protocol(e)) => {
                    self.stats.protocol_errors += 1;
                    log::warn!("dropping message from observer {observer_id}: {e}");
                }
                Err(e) => log::warn!("rejected message from observer {observer_id}: {e}"),
            }
        }
        applied
    }

    /// Applies an input from the controlling observer and acknowledges it.
    /// Inputs that were already processed are not re-applied, but the
    /// latest ack is sent again in case it was lost.
    pub fn process_input(
        &mut self,
        observer_id: ObserverId,
        input: &InputPredict,
    ) -> Result<InputOutcome, ReplicationError> {
        let frame_tick = self.tick_in_progress();
        let observer = self
            .observers
            .get_mut(&observer_id)
            .ok_or(ReplicationError::UnknownObserver(observer_id))?;
        let entity = self
            .entities
            .get_mut(&input.entity_id)
            .ok_or(ReplicationError::UnknownEntity(input.entity_id))?;

        if entity.controller != Some(observer_id) {
            self.stats.inputs_rejected += 1;
            return Err(ReplicationError::NotController {
                entity_id: input.entity_id,
                observer_id,
            });
        }

        let last = observer.last_input.entry(input.entity_id).or_insert(0);
        let outcome = if input.prediction_id <= *last {
            self.stats.inputs_reacknowledged += 1;
            log::trace!(
                "re-acknowledging input {} for entity {}",
                input.prediction_id,
                input.entity_id
            );
            InputOutcome::Reacknowledged
        } else {
            let movement = MovementInput::from_network(input.movement_direction);
            self.movement
                .apply(&mut entity.transform, &movement, self.config.dt());
            entity.transform_dirty = true;
            *last = input.prediction_id;
            self.stats.inputs_applied += 1;
            InputOutcome::Applied
        };

        observer
            .outbound
            .push(NetworkMessage::EntityAcknowledge(EntityAcknowledge {
                entity_id: input.entity_id,
                prediction_id: *last,
                frame_tick,
                transform: entity.transform.to_network(),
            }));
        self.stats.messages_queued += 1;

        Ok(outcome)
    }

    /// Inputs and despawns between two `tick` calls belong to the tick
    /// after the last completed one, so their frame ticks never tie with an
    /// older delta.
    fn tick_in_progress(&self) -> u32 {
        self.tick.wrapping_add(1)
    }

    /// Queues this tick's replication traffic: creates for entities an
    /// observer has not seen and deltas for dirty entities. Every
    /// `keyframe_interval_ticks` each observer instead gets a full keyframe:
    /// a create and full property set for every entity, plus a destroy for
    /// every entity it saw despawned.
    pub fn tick(&mut self, ctx: &TickContext) {
        self.tick = ctx.tick;
        let interval = self.config.keyframe_interval_ticks;
        let keyframe = interval > 0 && ctx.tick % interval == 0;
        if keyframe {
            self.stats.keyframes += 1;
            log::trace!("keyframe at tick {}", ctx.tick);
        }

        for observer in self.observers.values_mut() {
            if keyframe {
                for &entity_id in &observer.departed {
                    observer.outbound.push(NetworkMessage::EntityDestroy(EntityDestroy {
                        entity_id,
                        frame_tick: ctx.tick,
                    }));
                    self.stats.messages_queued += 1;
                }
            }

            for entity in self.entities.values() {
                let first_sight = observer.known.insert(entity.entity_id);
                if first_sight || keyframe {
                    observer
                        .outbound
                        .push(NetworkMessage::EntityCreate(EntityCreate::new(
                            entity.entity_id,
                            entity.entity_type.clone(),
                            &entity.transform,
                            ctx.tick,
                        )));
                    self.stats.messages_queued += 1;
                    for piece in split_to_fit(entity.full_delta(ctx.tick)) {
                        observer.outbound.push(NetworkMessage::EntityProperties(piece));
                        self.stats.messages_queued += 1;
                    }
                } else if entity.is_dirty() {
                    for piece in split_to_fit(entity.dirty_delta(ctx.tick)) {
                        observer.outbound.push(NetworkMessage::EntityProperties(piece));
                        self.stats.messages_queued += 1;
                    }
                }
            }
        }

        for entity in self.entities.values_mut() {
            entity.dirty.clear();
            entity.transform_dirty = false;
        }
    }

    /// Encodes and sends everything queued for the observer.
    pub fn flush_outbound<T: Transport + ?Sized>(
        &mut self,
        observer_id: ObserverId,
        transport: &mut T,
    ) -> usize {
        let Some(observer) = self.observers.get_mut(&observer_id) else {
            return 0;
        };

        let mut sent = 0;
        for message in observer.outbound.drain(..) {
            match message.encode() {
                Ok(frame) => {
                    transport.send(frame);
                    sent += 1;
                }
                Err(e) => log::warn!(
                    "dropping {:?} for entity {}: {e}",
                    message.tag(),
                    message.entity_id()
                ),
            }
        }
        sent
    }

    pub fn entity(&self, entity_id: EntityId) -> Option<&AuthoritativeEntity> {
        self.entities.get(&entity_id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &AuthoritativeEntity> {
        self.entities.values()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Highest input id processed for the observer and entity.
    pub fn last_input(&self, observer_id: ObserverId, entity_id: EntityId) -> Option<u32> {
        self.observers
            .get(&observer_id)?
            .last_input
            .get(&entity_id)
            .copied()
    }

    pub fn outbound_len(&self, observer_id: ObserverId) -> usize {
        self.observers
            .get(&observer_id)
            .map_or(0, |observer| observer.outbound.len())
    }

    pub fn current_tick(&self) -> u32 {
        self.tick
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }
}

impl std::fmt::Debug for ServerReplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerReplicator")
            .field("tick", &self.tick)
            .field("entities", &self.entities.len())
            .field("observers", &self.observers.len())
            .field("stats", &self.stats)
            .finish()
    }
}

/// Splits a delta into pieces sharing its frame tick, each small enough to
/// encode. A single property that is too large on its own is kept whole and
/// reported when the frame is flushed.
fn split_to_fit(delta: PropertyDelta) -> Vec<PropertyDelta> {
    let mut fitted = Vec::new();
    let mut pending = vec![delta];

    while let Some(mut delta) = pending.pop() {
        let oversized = matches!(
            NetworkMessage::EntityProperties(delta.clone()).encode(),
            Err(ProtocolError::Oversized { .. })
        );
        if !oversized || delta.properties.len() < 2 {
            fitted.push(delta);
            continue;
        }

        let tail = delta.properties.split_off(delta.properties.len() / 2);
        pending.push(PropertyDelta {
            entity_id: delta.entity_id,
            frame_tick: delta.frame_tick,
            properties: tail,
        });
        pending.push(delta);
    }

    if fitted.len() > 1 {
        log::trace!(
            "split properties of entity {} into {} messages",
            fitted[0].entity_id,
            fitted.len()
        );
    }
    fitted
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;

    fn input(entity_id: EntityId, prediction_id: u32) -> InputPredict {
        InputPredict {
            entity_id,
            prediction_id,
            movement_direction: [1.0, 0.0, 0.0],
        }
    }

    fn acks(server: &mut ServerReplicator, observer: ObserverId) -> Vec<u32> {
        let messages = std::mem::take(
            &mut server
                .observers
                .get_mut(&observer)
                .expect("observer")
                .outbound,
        );
        messages
            .into_iter()
            .filter_map(|m| match m {
                NetworkMessage::EntityAcknowledge(ack) => Some(ack.prediction_id),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn first_tick_announces_entities_once() {
        let mut server = ServerReplicator::new(ReplicationConfig {
            keyframe_interval_ticks: 0,
            ..ReplicationConfig::default()
        });
        let observer = server.add_observer();
        let id = server.spawn("BasicUnit", Transform::IDENTITY);
        server
            .set_property(id, "health", PropertyValue::Int32(100))
            .unwrap();

        server.tick(&TickContext::new(1, 1.0 / 60.0));
        assert_eq!(server.outbound_len(observer), 2);

        server.tick(&TickContext::new(2, 1.0 / 60.0));
        assert_eq!(server.outbound_len(observer), 2);

        server
            .set_property(id, "health", PropertyValue::Int32(90))
            .unwrap();
        server.tick(&TickContext::new(3, 1.0 / 60.0));
        assert_eq!(server.outbound_len(observer), 3);
    }

    #[test]
    fn duplicate_input_is_reacknowledged_not_reapplied() {
        let mut server = ServerReplicator::new(ReplicationConfig::default());
        let observer = server.add_observer();
        let id = server.spawn("Player", Transform::IDENTITY);
        server.assign_control(id, observer).unwrap();

        assert_eq!(
            server.process_input(observer, &input(id, 1)).unwrap(),
            InputOutcome::Applied
        );
        let after_one = *server.entity(id).unwrap().transform();

        assert_eq!(
            server.process_input(observer, &input(id, 1)).unwrap(),
            InputOutcome::Reacknowledged
        );
        assert_eq!(server.entity(id).unwrap().transform(), &after_one);
        assert_eq!(acks(&mut server, observer), vec![1, 1]);
        assert!(after_one.position.x > 0.0);
    }

    #[test]
    fn late_lower_input_acks_the_highest() {
        let mut server = ServerReplicator::new(ReplicationConfig::default());
        let observer = server.add_observer();
        let id = server.spawn("Player", Transform::IDENTITY);
        server.assign_control(id, observer).unwrap();

        server.process_input(observer, &input(id, 3)).unwrap();
        server.process_input(observer, &input(id, 2)).unwrap();

        assert_eq!(acks(&mut server, observer), vec![3, 3]);
        assert_eq!(server.last_input(observer, id), Some(3));
    }

    #[test]
    fn input_from_non_controller_is_rejected() {
        let mut server = ServerReplicator::new(ReplicationConfig::default());
        let owner = server.add_observer();
        let intruder = server.add_observer();
        let id = server.spawn("Player", Transform::IDENTITY);
        server.assign_control(id, owner).unwrap();

        let result = server.process_input(intruder, &input(id, 1));
        assert!(matches!(
            result,
            Err(ReplicationError::NotController { entity_id, observer_id })
                if entity_id == id && observer_id == intruder
        ));
        assert_eq!(server.entity(id).unwrap().transform().position, Vec3::ZERO);
        assert_eq!(server.stats().inputs_rejected, 1);
    }

    #[test]
    fn despawn_notifies_observers_that_know_the_entity() {
        let mut server = ServerReplicator::new(ReplicationConfig::default());
        let observer = server.add_observer();
        let id = server.spawn("BasicUnit", Transform::IDENTITY);
        server.tick(&TickContext::new(1, 1.0 / 60.0));
        server.observers.get_mut(&observer).unwrap().outbound.clear();

        server.despawn(id).unwrap();

        let queued = &server.observers[&observer].outbound;
        assert!(matches!(
            queued.as_slice(),
            [NetworkMessage::EntityDestroy(EntityDestroy { entity_id, .. })] if *entity_id == id
        ));
        assert!(matches!(
            server.despawn(id),
            Err(ReplicationError::UnknownEntity(_))
        ));
    }

    #[test]
    fn keyframes_repeat_destroys() {
        let mut server = ServerReplicator::new(ReplicationConfig {
            keyframe_interval_ticks: 10,
            ..ReplicationConfig::default()
        });
        let observer = server.add_observer();
        let id = server.spawn("BasicUnit", Transform::IDENTITY);
        server.tick(&TickContext::new(1, 1.0 / 60.0));
        server.despawn(id).unwrap();
        server.observers.get_mut(&observer).unwrap().outbound.clear();

        server.tick(&TickContext::new(10, 1.0 / 60.0));

        let queued = &server.observers[&observer].outbound;
        assert_eq!(queued.len(), 1);
        assert!(matches!(queued[0], NetworkMessage::EntityDestroy(_)));
    }

    #[test]
    fn keyframes_resend_everything() {
        let mut server = ServerReplicator::new(ReplicationConfig {
            keyframe_interval_ticks: 10,
            ..ReplicationConfig::default()
        });
        let observer = server.add_observer();
        server.spawn("BasicUnit", Transform::IDENTITY);
        server.spawn("BasicUnit", Transform::IDENTITY);

        server.tick(&TickContext::new(1, 1.0 / 60.0));
        server.observers.get_mut(&observer).unwrap().outbound.clear();

        server.tick(&TickContext::new(5, 1.0 / 60.0));
        assert_eq!(server.outbound_len(observer), 0);

        server.tick(&TickContext::new(10, 1.0 / 60.0));
        assert_eq!(server.outbound_len(observer), 4);
        assert_eq!(server.stats().keyframes, 1);
    }

    #[test]
    fn large_property_sets_are_split_under_the_frame_limit() {
        let mut server = ServerReplicator::new(ReplicationConfig::default());
        let observer = server.add_observer();
        let id = server.spawn("BasicUnit", Transform::IDENTITY);
        for i in 0..60 {
            server
                .set_property(
                    id,
                    format!("label_{i:02}"),
                    PropertyValue::String(format!("value of label {i:02}")),
                )
                .unwrap();
        }

        server.tick(&TickContext::new(1, 1.0 / 60.0));

        let outbound = &server.observers[&observer].outbound;
        let pieces: Vec<&PropertyDelta> = outbound
            .iter()
            .filter_map(|m| match m {
                NetworkMessage::EntityProperties(delta) => Some(delta),
                _ => None,
            })
            .collect();

        assert!(pieces.len() > 1);
        assert!(pieces.iter().all(|delta| delta.frame_tick == 1));
        assert_eq!(
            pieces.iter().map(|delta| delta.properties.len()).sum::<usize>(),
            61
        );
        for message in outbound {
            assert!(message.encode().unwrap().len() <= crate::net::MAX_MESSAGE_SIZE);
        }
    }
}
