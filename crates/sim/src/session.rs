use std::cell::{Cell, RefCell};
use std::rc::Rc;

use anyhow::Result;
use glam::Vec3;

use protosync::net::LinkRng;
use protosync::replication::{ClientStats, ServerStats};
use protosync::{
    ClientReplicator, CoroutineHandle, CoroutineScheduler, EntityFactoryRegistry, EntityId,
    LinkConditions, LoopbackTransport, NetworkStats, ObserverId, PropertyValue,
    ReplicatedEntity, ReplicationConfig, ReplicationError, ServerReplicator, TickContext,
    TickDriver, TickParticipant, Transform, sleep_ticks,
};

const PLAYER_TYPE: &str = "Player";
const UNIT_TYPE: &str = "BasicUnit";

const BOT_DIRECTIONS: [Vec3; 4] = [Vec3::X, Vec3::Z, Vec3::NEG_X, Vec3::NEG_Z];

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub replication: ReplicationConfig,
    pub link: LinkConditions,
    pub units: usize,
    pub seed: u64,
    /// Ticks between bot inputs.
    pub input_interval: u32,
    /// Ticks between property changes on server-driven units.
    pub churn_interval: u32,
    /// Ticks between replacing the oldest unit with a new one.
    pub respawn_interval: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            replication: ReplicationConfig::default(),
            link: LinkConditions::perfect(),
            units: 4,
            seed: 1,
            input_interval: 2,
            churn_interval: 15,
            respawn_interval: 300,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub ticks: u32,
    pub server_stats: ServerStats,
    pub client_stats: ClientStats,
    pub downstream: NetworkStats,
    pub upstream: NetworkStats,
    pub server_entities: usize,
    pub client_entities: usize,
    pub inputs_issued: u32,
    pub inputs_refused: u32,
    /// Distance between the server's player transform and the client's
    /// smoothed prediction at the end of the run.
    pub player_error: f32,
    /// Units whose health differs between server and client.
    pub mismatched_units: usize,
}

impl SessionReport {
    pub fn converged(&self, tolerance: f32) -> bool {
        self.server_entities == self.client_entities
            && self.mismatched_units == 0
            && self.player_error <= tolerance
    }
}

/// Unit representation on the client; only traces what it is told.
struct TracedUnit {
    entity_id: EntityId,
    entity_type: &'static str,
}

impl ReplicatedEntity for TracedUnit {
    fn entity_type(&self) -> &str {
        self.entity_type
    }

    fn on_property_changed(&mut self, name: &str, value: &PropertyValue) {
        log::trace!("{} {}: {name} = {value:?}", self.entity_type, self.entity_id);
    }

    fn on_destroyed(&mut self) {
        log::trace!("{} {} destroyed", self.entity_type, self.entity_id);
    }
}

fn registry() -> Result<EntityFactoryRegistry> {
    let mut registry = EntityFactoryRegistry::new();
    for entity_type in [PLAYER_TYPE, UNIT_TYPE] {
        registry.register(entity_type, move |entity_id| -> Box<dyn ReplicatedEntity> {
            Box::new(TracedUnit {
                entity_id,
                entity_type,
            })
        })?;
    }
    Ok(registry)
}

struct ServerNode {
    replicator: ServerReplicator,
    transport: LoopbackTransport,
    observer: ObserverId,
    units: Vec<EntityId>,
    rng: LinkRng,
    churn_interval: u32,
    respawn_interval: u32,
}

impl ServerNode {
    fn spawn_unit(&mut self) {
        let x = (self.rng.next_percent() - 50.0) * 0.2;
        let z = (self.rng.next_percent() - 50.0) * 0.2;
        let unit = self
            .replicator
            .spawn(UNIT_TYPE, Transform::from_position(Vec3::new(x, 0.0, z)));
        if let Err(e) = self
            .replicator
            .set_property(unit, "health", PropertyValue::Int32(100))
        {
            log::warn!("failed to initialize unit {unit}: {e}");
        }
        self.units.push(unit);
    }

    fn churn(&mut self, ctx: &TickContext) {
        if self.churn_interval > 0 && ctx.tick % self.churn_interval == 0 {
            for &unit in &self.units {
                let health = match self
                    .replicator
                    .entity(unit)
                    .and_then(|e| e.property("health"))
                {
                    Some(value) => value.as_i32().unwrap_or(100),
                    None => continue,
                };
                let next = if health <= 0 { 100 } else { health - 7 };
                if let Err(e) = self
                    .replicator
                    .set_property(unit, "health", PropertyValue::Int32(next))
                {
                    log::warn!("failed to update unit {unit}: {e}");
                }
            }
        }

        if self.respawn_interval > 0
            && ctx.tick % self.respawn_interval == 0
            && !self.units.is_empty()
        {
            let oldest = self.units.remove(0);
            match self.replicator.despawn(oldest) {
                Ok(()) => log::info!("tick {}: replaced unit {oldest}", ctx.tick),
                Err(e) => log::warn!("failed to despawn unit {oldest}: {e}"),
            }
            self.spawn_unit();
        }
    }
}

impl TickParticipant for ServerNode {
    fn apply_inbound(&mut self, _ctx: &TickContext) {
        self.replicator.apply_inbound(self.observer, &mut self.transport);
    }

    fn update(&mut self, ctx: &TickContext) {
        self.churn(ctx);
        self.replicator.tick(ctx);
    }

    fn flush_outbound(&mut self, _ctx: &TickContext) {
        self.replicator.flush_outbound(self.observer, &mut self.transport);
    }
}

struct ClientNode {
    replicator: Rc<RefCell<ClientReplicator>>,
    transport: LoopbackTransport,
}

impl TickParticipant for ClientNode {
    fn apply_inbound(&mut self, _ctx: &TickContext) {
        self.replicator
            .borrow_mut()
            .apply_inbound(&mut self.transport);
    }

    fn update(&mut self, ctx: &TickContext) {
        self.replicator.borrow_mut().tick(ctx);
    }

    fn flush_outbound(&mut self, _ctx: &TickContext) {
        self.replicator
            .borrow_mut()
            .flush_outbound(&mut self.transport);
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct BotTally {
    issued: u32,
    refused: u32,
}

/// Drives the player from a coroutine, turning every few inputs.
async fn run_bot(
    client: Rc<RefCell<ClientReplicator>>,
    player: EntityId,
    interval: u32,
    active: Rc<Cell<bool>>,
    tally: Rc<Cell<BotTally>>,
) -> Result<(), ReplicationError> {
    while client.borrow().entity(player).is_none() {
        sleep_ticks(1).await;
    }
    log::info!("bot: player {player} replicated, starting inputs");

    let mut step = 0usize;
    while active.get() {
        let direction = BOT_DIRECTIONS[(step / 20) % BOT_DIRECTIONS.len()];
        let mut counts = tally.get();
        match client.borrow_mut().predict(player, direction) {
            Ok(_) => counts.issued += 1,
            Err(ReplicationError::AwaitingResync(_)) => counts.refused += 1,
            Err(e) => return Err(e),
        }
        tally.set(counts);
        step += 1;
        sleep_ticks(interval.max(1)).await;
    }
    Ok(())
}

/// One server and one client connected by a simulated link, each with its
/// own tick driver.
pub struct Session {
    server: ServerNode,
    client: ClientNode,
    server_driver: TickDriver,
    client_driver: TickDriver,
    player: EntityId,
    bot: CoroutineHandle<Result<(), ReplicationError>>,
    bot_active: Rc<Cell<bool>>,
    bot_tally: Rc<Cell<BotTally>>,
    ticks: u32,
}

impl Session {
    pub fn new(config: SessionConfig) -> Result<Self> {
        let (server_end, client_end) = LoopbackTransport::pair(config.link.clone(), config.seed);
        let tick_rate = config.replication.tick_rate;

        let mut replicator = ServerReplicator::new(config.replication.clone());
        let observer = replicator.add_observer();
        let player = replicator.spawn(PLAYER_TYPE, Transform::IDENTITY);
        replicator.assign_control(player, observer)?;

        let mut server = ServerNode {
            replicator,
            transport: server_end,
            observer,
            units: Vec::new(),
            rng: LinkRng::new(config.seed ^ 0x5eed),
            churn_interval: config.churn_interval,
            respawn_interval: config.respawn_interval,
        };
        for _ in 0..config.units {
            server.spawn_unit();
        }

        let client = Rc::new(RefCell::new(ClientReplicator::new(
            config.replication.clone(),
            registry()?,
        )));

        let server_driver = TickDriver::new(tick_rate, CoroutineScheduler::new());
        let client_scheduler = CoroutineScheduler::new();
        let client_driver = TickDriver::new(tick_rate, client_scheduler.clone());

        let bot_active = Rc::new(Cell::new(true));
        let bot_tally = Rc::new(Cell::new(BotTally::default()));
        let bot = client_scheduler.run(run_bot(
            Rc::clone(&client),
            player,
            config.input_interval,
            Rc::clone(&bot_active),
            Rc::clone(&bot_tally),
        ));

        log::info!(
            "session: {} units, player {player}, link {:?}",
            config.units,
            config.link
        );

        Ok(Self {
            server,
            client: ClientNode {
                replicator: client,
                transport: client_end,
            },
            server_driver,
            client_driver,
            player,
            bot,
            bot_active,
            bot_tally,
            ticks: 0,
        })
    }

    pub fn step(&mut self) -> Result<()> {
        self.server_driver.step(&mut self.server)?;
        self.client_driver.step(&mut self.client)?;
        self.ticks += 1;

        if let Some(result) = self.bot.try_take() {
            match result {
                Ok(Ok(())) => log::info!("bot finished at tick {}", self.ticks),
                Ok(Err(e)) => anyhow::bail!("bot failed at tick {}: {e}", self.ticks),
                Err(e) => anyhow::bail!("bot coroutine aborted: {e}"),
            }
        }

        if self.ticks % 600 == 0 {
            let stats = self.client.replicator.borrow().stats().clone();
            log::info!(
                "tick {}: {} entities, {} corrections, {} resyncs",
                self.ticks,
                self.client.replicator.borrow().entity_count(),
                stats.corrections,
                stats.resyncs
            );
        }
        Ok(())
    }

    /// Stops the bot; the link keeps running so keyframes can heal the
    /// client.
    pub fn stop_inputs(&self) {
        self.bot_active.set(false);
    }

    pub fn report(&self) -> SessionReport {
        let server = &self.server.replicator;
        let client = self.client.replicator.borrow();

        let predicted = client.predicted_transform(self.player);
        let player_error = match (server.entity(self.player), predicted) {
            (Some(entity), Some(predicted)) => entity.transform().distance(&predicted),
            _ => f32::INFINITY,
        };

        let mismatched_units = self
            .server
            .units
            .iter()
            .filter(|&&unit| {
                let authoritative = server.entity(unit).and_then(|e| e.property("health"));
                let replicated = client.entity(unit).and_then(|e| e.property("health"));
                authoritative != replicated
            })
            .count();

        let tally = self.bot_tally.get();

        SessionReport {
            ticks: self.ticks,
            server_stats: server.stats().clone(),
            client_stats: client.stats().clone(),
            downstream: self.server.transport.sent_stats(),
            upstream: self.client.transport.sent_stats(),
            server_entities: server.entity_count(),
            client_entities: client.entity_count(),
            inputs_issued: tally.issued,
            inputs_refused: tally.refused,
            player_error,
            mismatched_units,
        }
    }
}
