use crate::coroutine::{CoroutineError, CoroutineScheduler, PumpReport};

pub use crate::coroutine::TickContext;

/// Longest frame the accumulator accepts; anything slower is treated as a
/// stall and clamped.
const MAX_FRAME_DELTA: f32 = 0.25;

/// Turns variable frame deltas into whole fixed-size ticks.
#[derive(Debug, Clone)]
pub struct FixedTimestep {
    dt: f32,
    accumulator: f32,
}

impl FixedTimestep {
    pub fn new(tick_rate: u32) -> Self {
        Self {
            dt: 1.0 / tick_rate.max(1) as f32,
            accumulator: 0.0,
        }
    }

    pub fn dt(&self) -> f32 {
        self.dt
    }

    pub fn accumulate(&mut self, delta: f32) {
        self.accumulator += delta.clamp(0.0, MAX_FRAME_DELTA);
    }

    /// Takes one tick's worth of time out of the accumulator, if available.
    pub fn consume_tick(&mut self) -> bool {
        if self.accumulator < self.dt {
            return false;
        }
        self.accumulator -= self.dt;
        true
    }

    /// Fraction of the next tick already accumulated.
    pub fn alpha(&self) -> f32 {
        self.accumulator / self.dt
    }
}

/// One simulation role (client or server) as seen by the tick driver.
pub trait TickParticipant {
    /// Drain the transport and apply everything that arrived.
    fn apply_inbound(&mut self, ctx: &TickContext);

    /// Game or server logic for this tick.
    fn update(&mut self, ctx: &TickContext);

    /// Hand everything queued during the tick to the transport.
    fn flush_outbound(&mut self, ctx: &TickContext);
}

/// Drives a participant and a coroutine scheduler in the fixed per-tick
/// order: inbound apply, logic, coroutine pump, outbound flush.
pub struct TickDriver {
    timestep: FixedTimestep,
    scheduler: CoroutineScheduler,
    tick: u32,
}

impl TickDriver {
    pub fn new(tick_rate: u32, scheduler: CoroutineScheduler) -> Self {
        Self {
            timestep: FixedTimestep::new(tick_rate),
            scheduler,
            tick: 0,
        }
    }

    pub fn scheduler(&self) -> &CoroutineScheduler {
        &self.scheduler
    }

    /// Last tick that was stepped.
    pub fn tick(&self) -> u32 {
        self.tick
    }

    pub fn dt(&self) -> f32 {
        self.timestep.dt()
    }

    /// Runs exactly one tick.
    pub fn step<P>(&mut self, participant: &mut P) -> Result<PumpReport, CoroutineError>
    where
        P: TickParticipant + ?Sized,
    {
        self.tick = self.tick.wrapping_add(1);
        let ctx = TickContext::new(self.tick, self.timestep.dt());

        participant.apply_inbound(&ctx);
        participant.update(&ctx);
        let report = self.scheduler.pump(&ctx)?;
        participant.flush_outbound(&ctx);

        Ok(report)
    }

    /// Accumulates wall-clock time and runs as many ticks as fit.
    pub fn update<P>(&mut self, delta: f32, participant: &mut P) -> Result<u32, CoroutineError>
    where
        P: TickParticipant + ?Sized,
    {
        self.timestep.accumulate(delta);

        let mut ticks_run = 0;
        while self.timestep.consume_tick() {
            self.step(participant)?;
            ticks_run += 1;
        }

        Ok(ticks_run)
    }

    pub fn interpolation_alpha(&self) -> f32 {
        self.timestep.alpha()
    }
}
