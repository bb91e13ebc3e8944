
/// Impairments applied by a simulated link.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LinkConditions {
    pub enabled: bool,
    pub loss_percent: f32,
    pub duplicate_percent: f32,
    pub min_delay_ticks: u32,
    pub max_delay_ticks: u32,
}

impl LinkConditions {
    pub fn perfect() -> Self {
        Self::default()
    }

    pub fn lossy(loss_percent: f32, min_delay_ticks: u32, max_delay_ticks: u32) -> Self {
        Self {
            enabled: true,
            loss_percent,
            duplicate_percent: 0.0,
            min_delay_ticks,
            max_delay_ticks,
        }
    }

    pub fn should_drop(&self, rng: &mut LinkRng) -> bool {
        if !self.enabled || self.loss_percent <= 0.0 {
            return false;
        }
        rng.next_percent() < self.loss_percent
    }

    pub fn should_duplicate(&self, rng: &mut LinkRng) -> bool {
        if !self.enabled || self.duplicate_percent <= 0.0 {
            return false;
        }
        rng.next_percent() < self.duplicate_percent
    }

    pub fn delay_ticks(&self, rng: &mut LinkRng) -> u32 {
        if !self.enabled || self.max_delay_ticks == 0 {
            return 0;
        }
        let range = self.max_delay_ticks.saturating_sub(self.min_delay_ticks);
        self.min_delay_ticks + (rng.next_u64() % (u64::from(range) + 1)) as u32
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub messages_duplicated: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl NetworkStats {
    pub fn loss_percent(&self) -> f32 {
        if self.messages_sent == 0 {
            return 0.0;
        }
        self.messages_dropped as f32 / self.messages_sent as f32 * 100.0
    }
}

/// Small xorshift generator so simulated links are reproducible from a seed.
#[derive(Debug, Clone)]
pub struct LinkRng {
    state: u64,
}

impl LinkRng {
    pub fn new(seed: u64) -> Self {
        // xorshift never leaves zero
        Self {
            state: if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed },
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Uniform value in `[0, 100)`.
    pub fn next_percent(&mut self) -> f32 {
        (self.next_u64() % 10_000) as f32 / 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_conditions_never_impair() {
        let conditions = LinkConditions {
            enabled: false,
            loss_percent: 100.0,
            duplicate_percent: 100.0,
            min_delay_ticks: 5,
            max_delay_ticks: 10,
        };
        let mut rng = LinkRng::new(1);

        assert!(!conditions.should_drop(&mut rng));
        assert!(!conditions.should_duplicate(&mut rng));
        assert_eq!(conditions.delay_ticks(&mut rng), 0);
    }

    #[test]
    fn delay_stays_in_range() {
        let conditions = LinkConditions::lossy(0.0, 2, 6);
        let mut rng = LinkRng::new(42);

        for _ in 0..1000 {
            let delay = conditions.delay_ticks(&mut rng);
            assert!((2..=6).contains(&delay));
        }
    }

    #[test]
    fn same_seed_same_sequence() {
        let mut a = LinkRng::new(7);
        let mut b = LinkRng::new(7);
        for _ in 0..16 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }
}
