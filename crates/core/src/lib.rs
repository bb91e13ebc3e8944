pub mod coroutine;
pub mod net;
pub mod replication;
pub mod simulation;

pub use coroutine::{
    CoroutineError, CoroutineHandle, CoroutineScheduler, PumpReport, RemoteQueue, TickContext,
    sleep_ticks, yield_tick,
};
pub use net::{
    EntityAcknowledge, EntityCreate, EntityDestroy, InputPredict, LinkConditions,
    LoopbackTransport, MAX_MESSAGE_SIZE, MessageTag, NetworkMessage, NetworkStats,
    PropertyDelta, PropertyTag, PropertyValue, ProtocolError, Transform, Transport,
};
pub use replication::{
    ApplyOutcome, ClientReplicator, EntityFactoryRegistry, EntityId, EntityRecord,
    InputOutcome, ObserverId, ReplicatedEntity, ReplicationConfig, ReplicationError,
    ReplicationState, ServerReplicator, TimeMachine,
};
pub use simulation::{
    FixedTimestep, LinearMovement, MovementInput, MovementModel, TickDriver, TickParticipant,
};
