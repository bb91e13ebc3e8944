mod property;
mod protocol;
mod stats;
mod transform;
mod transport;

pub use property::{EntityPropertiesMessage, PropertyDelta, PropertyTag, PropertyValue};
pub use protocol::{
    EntityAcknowledge, EntityCreate, EntityDestroy, InputPredict, MessageTag, NetworkMessage,
    ProtocolError, MAX_MESSAGE_SIZE,
};
pub use stats::{LinkConditions, LinkRng, NetworkStats};
pub use transform::{NetworkTransform, Transform};
pub use transport::{LoopbackTransport, Transport};
