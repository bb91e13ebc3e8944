use std::collections::{BTreeMap, HashMap, VecDeque};

use glam::Vec3;

use crate::coroutine::TickContext;
use crate::net::{
    EntityAcknowledge, EntityCreate, EntityDestroy, InputPredict, NetworkMessage, PropertyDelta,
    Transform, Transport,
};
use crate::simulation::{LinearMovement, MovementInput, MovementModel};

use super::entity::{EntityId, EntityRecord, ReplicationState};
use super::history::TimeMachine;
use super::prediction::{AckOutcome, InputPrediction, TimeoutAction};
use super::registry::EntityFactoryRegistry;
use super::{ReplicationConfig, ReplicationError};

/// What applying one inbound message did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    /// A resyncing record was rebuilt from a fresh create.
    Replaced,
    Duplicate,
    Applied { applied: usize, stale: usize },
    /// Older than what is already applied; discarded.
    Stale,
    /// Held until the entity's create arrives.
    Buffered,
    Acknowledged { retired: usize, corrected: bool },
    Destroyed,
    Ignored,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub messages_applied: u64,
    pub protocol_errors: u64,
    pub stale_discarded: u64,
    pub duplicates: u64,
    pub buffered: u64,
    pub buffer_overflows: u64,
    pub corrections: u64,
    pub resends: u64,
    pub resyncs: u64,
}

#[derive(Debug, Default)]
struct Tombstones {
    order: VecDeque<EntityId>,
    ticks: HashMap<EntityId, u32>,
}

impl Tombstones {
    fn insert(&mut self, entity_id: EntityId, frame_tick: u32, capacity: usize) {
        if self.ticks.insert(entity_id, frame_tick).is_none() {
            self.order.push_back(entity_id);
        }
        while self.order.len() > capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ticks.remove(&oldest);
            }
        }
    }

    fn get(&self, entity_id: EntityId) -> Option<u32> {
        self.ticks.get(&entity_id).copied()
    }
}

/// Observer side of the replication protocol.
///
/// Inbound frames are applied at the start of a tick, `tick` runs the
/// prediction timeouts and smoothing, and everything queued is handed to
/// the transport by `flush_outbound` at the end of the tick.
pub struct ClientReplicator {
    config: ReplicationConfig,
    registry: EntityFactoryRegistry,
    movement: Box<dyn MovementModel>,
    entities: BTreeMap<EntityId, EntityRecord>,
    predictions: HashMap<EntityId, InputPrediction>,
    histories: HashMap<EntityId, TimeMachine<Transform>>,
    buffered: HashMap<EntityId, Vec<PropertyDelta>>,
    tombstones: Tombstones,
    outbound: Vec<NetworkMessage>,
    tick: u32,
    stats: ClientStats,
}

impl ClientReplicator {
    pub fn new(config: ReplicationConfig, registry: EntityFactoryRegistry) -> Self {
        Self {
            config,
            registry,
            movement: Box::new(LinearMovement::default()),
            entities: BTreeMap::new(),
            predictions: HashMap::new(),
            histories: HashMap::new(),
            buffered: HashMap::new(),
            tombstones: Tombstones::default(),
            outbound: Vec::new(),
            tick: 0,
            stats: ClientStats::default(),
        }
    }

    pub fn with_movement(mut self, movement: impl MovementModel + 'static) -> Self {
        self.movement = Box::new(movement);
        self
    }

    /// Decodes and applies one frame.
    pub fn receive(&mut self, frame: &[u8]) -> Result<ApplyOutcome, ReplicationError> {
        let message = NetworkMessage::decode(frame)?;
        Ok(self.apply_message(message))
    }

    /// Drains the transport and applies every frame. Malformed frames are
    /// logged and skipped.
    pub fn apply_inbound<T: Transport + ?Sized>(&mut self, transport: &mut T) -> usize {
        let mut applied = 0;
        for frame in transport.receive() {
            match self.receive(&frame) {
                Ok(_) => applied += 1,
                Err(e) => {
                    self.stats.protocol_errors += 1;
                    log::warn!("dropping inbound message ({} bytes): {e}", frame.len());
                }
            }
        }
        applied
    }

    pub fn apply_message(&mut self, message: NetworkMessage) -> ApplyOutcome {
        let outcome = match message {
            NetworkMessage::EntityCreate(create) => self.apply_create(create),
            NetworkMessage::EntityProperties(delta) => self.apply_properties(delta),
            NetworkMessage::EntityAcknowledge(ack) => self.apply_acknowledge(ack),
            NetworkMessage::EntityDestroy(destroy) => self.apply_destroy(destroy),
            NetworkMessage::InputPredict(input) => {
                log::warn!("ignoring server-bound input for entity {}", input.entity_id);
                ApplyOutcome::Ignored
            }
        };

        match outcome {
            ApplyOutcome::Stale => self.stats.stale_discarded += 1,
            ApplyOutcome::Duplicate => self.stats.duplicates += 1,
            ApplyOutcome::Buffered => self.stats.buffered += 1,
            ApplyOutcome::Ignored => {}
            _ => self.stats.messages_applied += 1,
        }
        outcome
    }

    fn apply_create(&mut self, create: EntityCreate) -> ApplyOutcome {
        let entity_id = create.entity_id;

        // Entity ids are never reused, so a tombstone rejects every create.
        if let Some(destroyed) = self.tombstones.get(entity_id) {
            log::trace!(
                "create at tick {} for entity {entity_id} destroyed at tick {destroyed}",
                create.frame_tick
            );
            return ApplyOutcome::Stale;
        }

        let replacing = match self.entities.get(&entity_id) {
            Some(record) if record.state() == ReplicationState::Resyncing => true,
            Some(_) => {
                log::trace!("duplicate create for entity {entity_id}");
                return ApplyOutcome::Duplicate;
            }
            None => false,
        };

        let instance = match self.registry.create(&create.entity_type, entity_id) {
            Ok(instance) => instance,
            Err(e) => {
                log::warn!("cannot instantiate entity {entity_id}: {e}");
                return ApplyOutcome::Ignored;
            }
        };

        let transform = Transform::from_network(&create.initial_transform);
        let mut record = EntityRecord::new(
            entity_id,
            create.entity_type,
            transform,
            create.frame_tick,
            instance,
        );

        let mut history = TimeMachine::new(self.config.history_ticks);
        history.set(create.frame_tick, transform);

        let mut buffered = self.buffered.remove(&entity_id).unwrap_or_default();
        buffered.sort_by_key(|delta| delta.frame_tick);
        for delta in &buffered {
            if record.apply_delta(delta).applied > 0 {
                history.set(record.frame_tick(), *record.transform());
            }
        }
        if !buffered.is_empty() && record.frame_tick() > create.frame_tick {
            record.set_state(ReplicationState::Synchronized);
        }

        if replacing {
            if let Some(old) = self.entities.get_mut(&entity_id) {
                old.instance_mut().on_destroyed();
            }
        }

        log::debug!(
            "{} entity {entity_id} ({}) at tick {}",
            if replacing { "replaced" } else { "created" },
            record.entity_type(),
            create.frame_tick
        );

        // Prediction ids keep counting across a replace; the server never
        // re-applies an id it has already seen.
        let authoritative = *record.transform();
        self.predictions
            .entry(entity_id)
            .and_modify(|prediction| prediction.resync(authoritative))
            .or_insert_with(|| InputPrediction::new(entity_id, authoritative));
        self.histories.insert(entity_id, history);
        self.entities.insert(entity_id, record);

        if replacing {
            ApplyOutcome::Replaced
        } else {
            ApplyOutcome::Created
        }
    }

    fn apply_properties(&mut self, delta: PropertyDelta) -> ApplyOutcome {
        let entity_id = delta.entity_id;

        if self.tombstones.get(entity_id).is_some() {
            log::trace!("properties for destroyed entity {entity_id}");
            return ApplyOutcome::Stale;
        }

        let Some(record) = self.entities.get_mut(&entity_id) else {
            return self.buffer(delta);
        };

        let outcome = record.apply_delta(&delta);
        if outcome.applied == 0 {
            log::trace!(
                "stale properties for entity {entity_id} at tick {}",
                delta.frame_tick
            );
            return ApplyOutcome::Stale;
        }

        if matches!(
            record.state(),
            ReplicationState::Created | ReplicationState::Resyncing
        ) {
            record.set_state(ReplicationState::Synchronized);
        }

        let transform = *record.transform();
        if let Some(history) = self.histories.get_mut(&entity_id) {
            history.set(record.frame_tick(), transform);
        }
        if let Some(prediction) = self.predictions.get_mut(&entity_id) {
            prediction.sync_authoritative(transform, &self.config);
        }

        ApplyOutcome::Applied {
            applied: outcome.applied,
            stale: outcome.stale,
        }
    }

    fn buffer(&mut self, delta: PropertyDelta) -> ApplyOutcome {
        let entity_id = delta.entity_id;
        let queue = self.buffered.entry(entity_id).or_default();
        queue.push(delta);

        if queue.len() > self.config.max_buffered_deltas {
            // Drop the oldest by frame tick; a later keyframe covers it.
            if let Some(oldest) = queue
                .iter()
                .enumerate()
                .min_by_key(|(_, d)| d.frame_tick)
                .map(|(index, _)| index)
            {
                queue.remove(oldest);
            }
            self.stats.buffer_overflows += 1;
        }

        log::trace!("buffered properties for unknown entity {entity_id}");
        ApplyOutcome::Buffered
    }

    fn apply_acknowledge(&mut self, ack: EntityAcknowledge) -> ApplyOutcome {
        let entity_id = ack.entity_id;
        let Some(record) = self.entities.get_mut(&entity_id) else {
            log::trace!("ack for unknown entity {entity_id}");
            return ApplyOutcome::Ignored;
        };
        let Some(prediction) = self.predictions.get_mut(&entity_id) else {
            return ApplyOutcome::Ignored;
        };

        let authoritative = Transform::from_network(&ack.transform);
        let outcome = prediction.acknowledge(
            ack.prediction_id,
            authoritative,
            self.movement.as_ref(),
            &self.config,
        );

        // Acks from one server tick share a frame tick, so only a newer
        // prediction id may touch the record transform.
        let AckOutcome::Acknowledged { retired, corrected } = outcome else {
            log::trace!("stale ack {} for entity {entity_id}", ack.prediction_id);
            return ApplyOutcome::Stale;
        };

        if record.set_transform(authoritative, ack.frame_tick) {
            if let Some(history) = self.histories.get_mut(&entity_id) {
                history.set(ack.frame_tick, authoritative);
            }
        }

        if corrected {
            self.stats.corrections += 1;
            log::debug!(
                "entity {entity_id}: corrected after ack {}",
                ack.prediction_id
            );
        }

        if prediction.consecutive_corrections() >= self.config.max_consecutive_corrections {
            log::warn!(
                "entity {entity_id}: {} corrections in a row, resynchronizing",
                prediction.consecutive_corrections()
            );
            self.force_resync(entity_id);
        } else if prediction.pending_len() == 0
            && record.state() == ReplicationState::Predicting
        {
            record.set_state(ReplicationState::Synchronized);
        }

        ApplyOutcome::Acknowledged { retired, corrected }
    }

    fn apply_destroy(&mut self, destroy: EntityDestroy) -> ApplyOutcome {
        let entity_id = destroy.entity_id;
        self.tombstones
            .insert(entity_id, destroy.frame_tick, self.config.tombstone_capacity);
        self.predictions.remove(&entity_id);
        self.histories.remove(&entity_id);
        self.buffered.remove(&entity_id);

        match self.entities.remove(&entity_id) {
            Some(mut record) => {
                record.instance_mut().on_destroyed();
                log::debug!("destroyed entity {entity_id}");
                ApplyOutcome::Destroyed
            }
            None => ApplyOutcome::Ignored,
        }
    }

    /// Applies a movement input locally and queues it for the server.
    /// Returns the prediction id.
    pub fn predict(
        &mut self,
        entity_id: EntityId,
        direction: Vec3,
    ) -> Result<u32, ReplicationError> {
        let record = self
            .entities
            .get_mut(&entity_id)
            .ok_or(ReplicationError::UnknownEntity(entity_id))?;
        if record.state() == ReplicationState::Resyncing {
            return Err(ReplicationError::AwaitingResync(entity_id));
        }
        let prediction = self
            .predictions
            .get_mut(&entity_id)
            .ok_or(ReplicationError::UnknownEntity(entity_id))?;

        let input = MovementInput::new(direction);
        let prediction_id =
            prediction.predict(input, self.tick, self.movement.as_ref(), &self.config);

        self.outbound
            .push(NetworkMessage::InputPredict(InputPredict {
                entity_id,
                prediction_id,
                movement_direction: input.to_network(),
            }));
        record.set_state(ReplicationState::Predicting);

        Ok(prediction_id)
    }

    /// Per-tick housekeeping: prediction timeouts, smoothing decay and
    /// history trimming.
    pub fn tick(&mut self, ctx: &TickContext) {
        self.tick = ctx.tick;

        let mut resync = Vec::new();
        for (&entity_id, prediction) in &mut self.predictions {
            match prediction.check_timeout(ctx.tick, &self.config) {
                Some(TimeoutAction::Resend(messages)) => {
                    log::debug!(
                        "entity {entity_id}: resending {} predictions",
                        messages.len()
                    );
                    self.stats.resends += messages.len() as u64;
                    self.outbound
                        .extend(messages.into_iter().map(NetworkMessage::InputPredict));
                }
                Some(TimeoutAction::Resync) => resync.push(entity_id),
                None => {}
            }
            prediction.decay(ctx.dt, &self.config);
        }

        for entity_id in resync {
            log::warn!("entity {entity_id}: predictions timed out, resynchronizing");
            self.force_resync(entity_id);
        }

        for history in self.histories.values_mut() {
            history.purge();
        }
    }

    /// Encodes and sends everything queued this tick.
    pub fn flush_outbound<T: Transport + ?Sized>(&mut self, transport: &mut T) -> usize {
        let mut sent = 0;
        for message in self.outbound.drain(..) {
            match message.encode() {
                Ok(frame) => {
                    transport.send(frame);
                    sent += 1;
                }
                Err(e) => log::warn!("dropping outbound {:?}: {e}", message.tag()),
            }
        }
        sent
    }

    /// Discards all predictions for the entity and waits for authoritative
    /// state.
    pub fn force_resync(&mut self, entity_id: EntityId) {
        let Some(record) = self.entities.get_mut(&entity_id) else {
            return;
        };
        if let Some(prediction) = self.predictions.get_mut(&entity_id) {
            prediction.resync(*record.transform());
        }
        record.set_state(ReplicationState::Resyncing);
        self.stats.resyncs += 1;
    }

    pub fn entity(&self, entity_id: EntityId) -> Option<&EntityRecord> {
        self.entities.get(&entity_id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityRecord> {
        self.entities.values()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn state(&self, entity_id: EntityId) -> Option<ReplicationState> {
        self.entities.get(&entity_id).map(EntityRecord::state)
    }

    pub fn prediction(&self, entity_id: EntityId) -> Option<&InputPrediction> {
        self.predictions.get(&entity_id)
    }

    pub fn pending_prediction_ids(&self, entity_id: EntityId) -> Vec<u32> {
        self.predictions
            .get(&entity_id)
            .map(InputPrediction::pending_ids)
            .unwrap_or_default()
    }

    /// Smoothed predicted transform, for locally controlled entities.
    pub fn predicted_transform(&self, entity_id: EntityId) -> Option<Transform> {
        self.predictions.get(&entity_id).map(InputPrediction::visual)
    }

    /// Authoritative transform interpolated at a fractional server tick, for
    /// remote entities.
    pub fn interpolated_transform(&self, entity_id: EntityId, tick: f32) -> Option<Transform> {
        self.histories.get(&entity_id)?.get(tick)
    }

    pub fn buffered_deltas(&self, entity_id: EntityId) -> usize {
        self.buffered.get(&entity_id).map_or(0, Vec::len)
    }

    pub fn is_destroyed(&self, entity_id: EntityId) -> bool {
        self.tombstones.get(entity_id).is_some()
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }
}

impl std::fmt::Debug for ClientReplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientReplicator")
            .field("tick", &self.tick)
            .field("entities", &self.entities.len())
            .field("outbound", &self.outbound.len())
            .field("stats", &self.stats)
            .finish()
    }
}
