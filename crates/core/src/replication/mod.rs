mod client;
mod config;
mod entity;
mod history;
mod prediction;
mod registry;
mod server;

pub use client::{ApplyOutcome, ClientReplicator, ClientStats};
pub use config::ReplicationConfig;
pub use entity::{
    DeltaOutcome, EntityId, EntityRecord, PropertySlot, ReplicationState, TRANSFORM_PROPERTY,
};
pub use history::{Interpolate, TimeMachine};
pub use prediction::{AckOutcome, InputPrediction, PendingPrediction, TimeoutAction};
pub use registry::{EntityFactoryRegistry, ReplicatedEntity};
pub use server::{AuthoritativeEntity, InputOutcome, ObserverId, ServerReplicator, ServerStats};

use crate::net::{MessageTag, ProtocolError};

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("unknown entity {0}")]
    UnknownEntity(EntityId),
    #[error("unknown entity type {0:?}")]
    UnknownEntityType(String),
    #[error("entity type {0:?} is already registered")]
    DuplicateEntityType(String),
    #[error("unknown observer {0}")]
    UnknownObserver(ObserverId),
    #[error("observer {observer_id} does not control entity {entity_id}")]
    NotController {
        entity_id: EntityId,
        observer_id: ObserverId,
    },
    #[error("entity {0} is waiting for authoritative state")]
    AwaitingResync(EntityId),
    #[error("unexpected {0:?} message")]
    UnexpectedMessage(MessageTag),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
