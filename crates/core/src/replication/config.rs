#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub tick_rate: u32,
    /// Ticks the oldest pending prediction may wait for an ack before the
    /// pending queue is re-sent.
    pub prediction_timeout_ticks: u32,
    /// Resends before the client gives up and resynchronizes the entity.
    pub max_prediction_resends: u32,
    pub max_pending_predictions: usize,
    /// Per-entity cap on property deltas held while the create is missing.
    pub max_buffered_deltas: usize,
    pub history_ticks: u32,
    /// Zero disables keyframes.
    pub keyframe_interval_ticks: u32,
    pub tombstone_capacity: usize,
    pub correction_epsilon: f32,
    pub snap_distance: f32,
    pub error_correction_speed: f32,
    pub max_consecutive_corrections: u32,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            tick_rate: 60,
            prediction_timeout_ticks: 30,
            max_prediction_resends: 3,
            max_pending_predictions: 128,
            max_buffered_deltas: 32,
            history_ticks: 64,
            keyframe_interval_ticks: 60,
            tombstone_capacity: 1024,
            correction_epsilon: 0.0001,
            snap_distance: 1.0,
            error_correction_speed: 20.0,
            max_consecutive_corrections: 8,
        }
    }
}

impl ReplicationConfig {
    pub fn dt(&self) -> f32 {
        1.0 / self.tick_rate.max(1) as f32
    }
}
