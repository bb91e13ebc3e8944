use std::collections::VecDeque;

use glam::Vec3;

use crate::net::{InputPredict, Transform};
use crate::simulation::{MovementInput, MovementModel};

use super::{EntityId, ReplicationConfig};

/// Offsets shorter than this are dropped instead of decayed forever.
const OFFSET_THRESHOLD: f32 = 0.0001;

#[derive(Debug, Clone, PartialEq)]
pub struct PendingPrediction {
    pub prediction_id: u32,
    pub input: MovementInput,
    pub issued_tick: u32,
    /// Tick of the last (re)transmission.
    pub sent_tick: u32,
    pub resends: u32,
    pub predicted_after: Transform,
}

impl PendingPrediction {
    pub fn to_message(&self, entity_id: EntityId) -> InputPredict {
        InputPredict {
            entity_id,
            prediction_id: self.prediction_id,
            movement_direction: self.input.to_network(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Ack was not newer than one already processed.
    Stale,
    Acknowledged { retired: usize, corrected: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimeoutAction {
    Resend(Vec<InputPredict>),
    Resync,
}

/// Client-side prediction state for one controlled entity.
///
/// Inputs are applied locally as soon as they are issued and kept until a
/// cumulative acknowledgement retires them. On every ack the prediction is
/// rebuilt from the authoritative transform by replaying what is still
/// pending; any jump this causes goes into a visual offset that decays over
/// a few ticks.
#[derive(Debug, Clone)]
pub struct InputPrediction {
    entity_id: EntityId,
    last_issued: u32,
    highest_acked: u32,
    pending: VecDeque<PendingPrediction>,
    authoritative: Transform,
    predicted: Transform,
    visual_offset: Vec3,
    consecutive_corrections: u32,
}

impl InputPrediction {
    pub fn new(entity_id: EntityId, authoritative: Transform) -> Self {
        Self {
            entity_id,
            last_issued: 0,
            highest_acked: 0,
            pending: VecDeque::new(),
            authoritative,
            predicted: authoritative,
            visual_offset: Vec3::ZERO,
            consecutive_corrections: 0,
        }
    }

    /// Applies `input` locally and queues it as pending. Returns the new
    /// prediction id.
    pub fn predict(
        &mut self,
        input: MovementInput,
        tick: u32,
        model: &dyn MovementModel,
        config: &ReplicationConfig,
    ) -> u32 {
        self.last_issued += 1;
        model.apply(&mut self.predicted, &input, config.dt());

        self.pending.push_back(PendingPrediction {
            prediction_id: self.last_issued,
            input,
            issued_tick: tick,
            sent_tick: tick,
            resends: 0,
            predicted_after: self.predicted,
        });

        while self.pending.len() > config.max_pending_predictions {
            if let Some(dropped) = self.pending.pop_front() {
                log::debug!(
                    "entity {}: pending predictions full, dropped {}",
                    self.entity_id,
                    dropped.prediction_id
                );
            }
        }

        self.last_issued
    }

    /// Cumulative ack: retires every pending prediction up to
    /// `prediction_id`, rebases on `authoritative` and replays the rest.
    pub fn acknowledge(
        &mut self,
        prediction_id: u32,
        authoritative: Transform,
        model: &dyn MovementModel,
        config: &ReplicationConfig,
    ) -> AckOutcome {
        if prediction_id <= self.highest_acked {
            return AckOutcome::Stale;
        }
        self.highest_acked = prediction_id;

        let before = self.pending.len();
        self.pending.retain(|p| p.prediction_id > prediction_id);
        let retired = before - self.pending.len();

        self.authoritative = authoritative;
        let mut replayed = authoritative;
        for pending in &mut self.pending {
            model.apply(&mut replayed, &pending.input, config.dt());
            pending.predicted_after = replayed;
        }

        let corrected = self.correct_towards(replayed, config);
        AckOutcome::Acknowledged { retired, corrected }
    }

    /// Adopts a newer authoritative transform that did not come with an ack.
    /// Only takes effect while nothing is pending.
    pub fn sync_authoritative(&mut self, authoritative: Transform, config: &ReplicationConfig) {
        self.authoritative = authoritative;
        if self.pending.is_empty() {
            self.correct_towards(authoritative, config);
            self.consecutive_corrections = 0;
        }
    }

    /// Checks the oldest pending prediction against the timeout policy:
    /// re-send everything pending, or give up after too many resends.
    pub fn check_timeout(
        &mut self,
        tick: u32,
        config: &ReplicationConfig,
    ) -> Option<TimeoutAction> {
        let oldest = self.pending.front()?;
        if tick.saturating_sub(oldest.sent_tick) <= config.prediction_timeout_ticks {
            return None;
        }
        if oldest.resends >= config.max_prediction_resends {
            return Some(TimeoutAction::Resync);
        }

        let entity_id = self.entity_id;
        let messages = self
            .pending
            .iter_mut()
            .map(|pending| {
                pending.resends += 1;
                pending.sent_tick = tick;
                pending.to_message(entity_id)
            })
            .collect();
        Some(TimeoutAction::Resend(messages))
    }

    /// Drops every pending prediction and snaps to the authoritative
    /// transform.
    pub fn resync(&mut self, authoritative: Transform) {
        self.pending.clear();
        self.authoritative = authoritative;
        self.predicted = authoritative;
        self.visual_offset = Vec3::ZERO;
        self.consecutive_corrections = 0;
    }

    pub fn decay(&mut self, dt: f32, config: &ReplicationConfig) {
        self.visual_offset *= (-config.error_correction_speed * dt).exp();
        if self.visual_offset.length() < OFFSET_THRESHOLD {
            self.visual_offset = Vec3::ZERO;
        }
    }

    fn correct_towards(&mut self, target: Transform, config: &ReplicationConfig) -> bool {
        let error = target.position - self.predicted.position;
        let magnitude = error.length();
        self.predicted = target;

        if magnitude <= config.correction_epsilon {
            self.consecutive_corrections = 0;
            return false;
        }

        self.consecutive_corrections += 1;
        if magnitude > config.snap_distance {
            self.visual_offset = Vec3::ZERO;
        } else {
            // Keep the rendered position where it was; the offset decays.
            self.visual_offset -= error;
        }
        true
    }

    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingPrediction> {
        self.pending.iter()
    }

    pub fn pending_ids(&self) -> Vec<u32> {
        self.pending.iter().map(|p| p.prediction_id).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn highest_acked(&self) -> u32 {
        self.highest_acked
    }

    pub fn last_issued(&self) -> u32 {
        self.last_issued
    }

    pub fn consecutive_corrections(&self) -> u32 {
        self.consecutive_corrections
    }

    pub fn authoritative(&self) -> &Transform {
        &self.authoritative
    }

    /// Logical predicted transform, without visual smoothing.
    pub fn predicted(&self) -> &Transform {
        &self.predicted
    }

    /// Predicted transform with the decaying correction offset applied.
    pub fn visual(&self) -> Transform {
        Transform {
            position: self.predicted.position + self.visual_offset,
            ..self.predicted
        }
    }

    pub fn visual_offset(&self) -> Vec3 {
        self.visual_offset
    }
}
