use std::collections::BTreeMap;

use glam::Vec3;

use crate::net::Transform;

pub trait Interpolate: Clone {
    fn interpolate(&self, other: &Self, t: f32) -> Self;
}

impl Interpolate for f32 {
    fn interpolate(&self, other: &Self, t: f32) -> Self {
        self + (other - self) * t
    }
}

impl Interpolate for Vec3 {
    fn interpolate(&self, other: &Self, t: f32) -> Self {
        self.lerp(*other, t)
    }
}

impl Interpolate for Transform {
    fn interpolate(&self, other: &Self, t: f32) -> Self {
        self.lerp(other, t)
    }
}

/// Bounded history of authoritative values keyed by frame tick, used to
/// render remote entities between received updates.
#[derive(Debug, Clone)]
pub struct TimeMachine<T> {
    history: u32,
    keys: BTreeMap<u32, T>,
}

impl<T: Interpolate> TimeMachine<T> {
    pub fn new(history: u32) -> Self {
        Self {
            history,
            keys: BTreeMap::new(),
        }
    }

    /// Records `value` at `tick`. Ticks older than the latest key are
    /// ignored and `false` is returned.
    pub fn set(&mut self, tick: u32, value: T) -> bool {
        if self.latest_tick().is_some_and(|latest| tick < latest) {
            return false;
        }
        self.keys.insert(tick, value);
        true
    }

    /// Value at a possibly fractional tick. Between two keys the value is
    /// interpolated; outside the known range the nearest edge is held.
    pub fn get(&self, tick: f32) -> Option<T> {
        let tick = tick.max(0.0);
        let below = self.keys.range(..=tick.floor() as u32).next_back();
        let above = self.keys.range(tick.ceil() as u32..).next();

        match (below, above) {
            (Some((&from_tick, from)), Some((&to_tick, to))) => {
                if from_tick == to_tick {
                    return Some(from.clone());
                }
                let t = (tick - from_tick as f32) / (to_tick - from_tick) as f32;
                Some(from.interpolate(to, t))
            }
            (Some((_, value)), None) | (None, Some((_, value))) => Some(value.clone()),
            (None, None) => None,
        }
    }

    /// Value of the key closest to `tick`; ties go to the earlier key.
    pub fn get_nearest(&self, tick: u32) -> Option<&T> {
        let below = self.keys.range(..=tick).next_back();
        let above = self.keys.range(tick..).next();

        match (below, above) {
            (Some((&from_tick, from)), Some((&to_tick, to))) => {
                if to_tick - tick < tick - from_tick {
                    Some(to)
                } else {
                    Some(from)
                }
            }
            (Some((_, value)), None) | (None, Some((_, value))) => Some(value),
            (None, None) => None,
        }
    }

    /// Drops keys older than the history window behind the latest key, but
    /// always keeps at least two.
    pub fn purge(&mut self) {
        let Some(latest) = self.latest_tick() else {
            return;
        };
        let cutoff = latest.saturating_sub(self.history);
        while self.keys.len() > 2 {
            match self.keys.first_key_value() {
                Some((&tick, _)) if tick < cutoff => {
                    self.keys.pop_first();
                }
                _ => break,
            }
        }
    }

    pub fn latest_tick(&self) -> Option<u32> {
        self.keys.last_key_value().map(|(&tick, _)| tick)
    }

    pub fn latest(&self) -> Option<&T> {
        self.keys.last_key_value().map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpolates_between_keys() {
        let mut machine = TimeMachine::new(64);
        machine.set(10, 0.0f32);
        machine.set(20, 10.0f32);

        assert_eq!(machine.get(15.0), Some(5.0));
        assert_eq!(machine.get(12.5), Some(2.5));
    }

    #[test]
    fn holds_edges_outside_range() {
        let mut machine = TimeMachine::new(64);
        machine.set(10, 1.0f32);
        machine.set(20, 2.0f32);

        assert_eq!(machine.get(3.0), Some(1.0));
        assert_eq!(machine.get(40.0), Some(2.0));
        assert_eq!(TimeMachine::<f32>::new(8).get(1.0), None);
    }

    #[test]
    fn older_ticks_are_ignored() {
        let mut machine = TimeMachine::new(64);
        assert!(machine.set(10, 1.0f32));
        assert!(!machine.set(5, 9.0f32));
        assert!(machine.set(10, 2.0f32));

        assert_eq!(machine.len(), 1);
        assert_eq!(machine.latest(), Some(&2.0));
    }

    #[test]
    fn nearest_picks_closest_key() {
        let mut machine = TimeMachine::new(64);
        machine.set(10, 1.0f32);
        machine.set(20, 2.0f32);

        assert_eq!(machine.get_nearest(14), Some(&1.0));
        assert_eq!(machine.get_nearest(16), Some(&2.0));
        assert_eq!(machine.get_nearest(15), Some(&1.0));
    }

    #[test]
    fn purge_keeps_two_keys() {
        let mut machine = TimeMachine::new(10);
        for tick in [0, 5, 100] {
            machine.set(tick, tick as f32);
        }
        machine.purge();
        assert_eq!(machine.len(), 2);

        machine.set(200, 200.0);
        machine.set(205, 205.0);
        machine.purge();
        assert_eq!(machine.len(), 2);
        assert_eq!(machine.get(202.5), Some(202.5));
    }

    #[test]
    fn transforms_slerp_rotation() {
        let mut machine = TimeMachine::new(64);
        let end = Transform {
            position: Vec3::new(2.0, 0.0, 0.0),
            rotation: glam::Quat::from_rotation_y(std::f32::consts::FRAC_PI_2),
            scale: Vec3::ONE,
        };
        machine.set(0, Transform::IDENTITY);
        machine.set(2, end);

        let mid = machine.get(1.0).unwrap();
        assert!((mid.position.x - 1.0).abs() < 1e-5);
        let expected = glam::Quat::from_rotation_y(std::f32::consts::FRAC_PI_4);
        assert!(mid.rotation.angle_between(expected) < 1e-3);
    }
}
