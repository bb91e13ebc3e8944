use rkyv::api::high::{HighDeserializer, HighSerializer, HighValidator};
use rkyv::bytecheck::CheckBytes;
use rkyv::ser::allocator::ArenaHandle;
use rkyv::util::AlignedVec;
use rkyv::{rancor, Archive, Deserialize, Serialize};

use super::property::{EntityPropertiesMessage, PropertyDelta, PropertyTag};
use super::transform::{NetworkTransform, Transform};

pub const MAX_MESSAGE_SIZE: usize = 1200;

/// First byte of every frame. Values are part of the wire format and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageTag {
    EntityCreate = 1,
    EntityProperties = 2,
    EntityAcknowledge = 3,
    InputPredict = 4,
    EntityDestroy = 5,
}

impl TryFrom<u8> for MessageTag {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::EntityCreate),
            2 => Ok(Self::EntityProperties),
            3 => Ok(Self::EntityAcknowledge),
            4 => Ok(Self::InputPredict),
            5 => Ok(Self::EntityDestroy),
            other => Err(ProtocolError::UnknownMessageTag(other)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    EmptyFrame,
    #[error("unknown message tag {0}")]
    UnknownMessageTag(u8),
    #[error("unknown property tag {0}")]
    UnknownPropertyTag(u8),
    #[error("{names} property names but {types} property types")]
    PropertyCountMismatch { names: usize, types: usize },
    #[error("value array for {0:?} ran out")]
    MissingPropertyValue(PropertyTag),
    #[error("unconsumed values left in the {0:?} array")]
    TrailingPropertyValues(PropertyTag),
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    Oversized { size: usize, max: usize },
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct EntityCreate {
    pub entity_id: u32,
    pub entity_type: String,
    pub initial_transform: NetworkTransform,
    pub frame_tick: u32,
}

impl EntityCreate {
    pub fn new(
        entity_id: u32,
        entity_type: impl Into<String>,
        transform: &Transform,
        frame_tick: u32,
    ) -> Self {
        Self {
            entity_id,
            entity_type: entity_type.into(),
            initial_transform: transform.to_network(),
            frame_tick,
        }
    }
}

/// Cumulative acknowledgement: confirms every prediction up to and including
/// `prediction_id`. `transform` is the authoritative state right after it.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct EntityAcknowledge {
    pub entity_id: u32,
    pub prediction_id: u32,
    pub frame_tick: u32,
    pub transform: NetworkTransform,
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct InputPredict {
    pub entity_id: u32,
    pub prediction_id: u32,
    pub movement_direction: [f32; 3],
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct EntityDestroy {
    pub entity_id: u32,
    pub frame_tick: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NetworkMessage {
    EntityCreate(EntityCreate),
    EntityProperties(PropertyDelta),
    EntityAcknowledge(EntityAcknowledge),
    InputPredict(InputPredict),
    EntityDestroy(EntityDestroy),
}

impl NetworkMessage {
    pub fn tag(&self) -> MessageTag {
        match self {
            Self::EntityCreate(_) => MessageTag::EntityCreate,
            Self::EntityProperties(_) => MessageTag::EntityProperties,
            Self::EntityAcknowledge(_) => MessageTag::EntityAcknowledge,
            Self::InputPredict(_) => MessageTag::InputPredict,
            Self::EntityDestroy(_) => MessageTag::EntityDestroy,
        }
    }

    pub fn entity_id(&self) -> u32 {
        match self {
            Self::EntityCreate(m) => m.entity_id,
            Self::EntityProperties(m) => m.entity_id,
            Self::EntityAcknowledge(m) => m.entity_id,
            Self::InputPredict(m) => m.entity_id,
            Self::EntityDestroy(m) => m.entity_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let body = match self {
            Self::EntityCreate(m) => archive(m)?,
            Self::EntityProperties(delta) => archive(&EntityPropertiesMessage::pack(delta))?,
            Self::EntityAcknowledge(m) => archive(m)?,
            Self::InputPredict(m) => archive(m)?,
            Self::EntityDestroy(m) => archive(m)?,
        };

        let size = body.len() + 1;
        if size > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::Oversized {
                size,
                max: MAX_MESSAGE_SIZE,
            });
        }

        let mut frame = Vec::with_capacity(size);
        frame.push(self.tag() as u8);
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let (&raw_tag, body) = frame.split_first().ok_or(ProtocolError::EmptyFrame)?;

        // The body starts one byte into the frame; copy it so the archive is aligned.
        let mut aligned = AlignedVec::<16>::with_capacity(body.len());
        aligned.extend_from_slice(body);

        Ok(match MessageTag::try_from(raw_tag)? {
            MessageTag::EntityCreate => Self::EntityCreate(unarchive(&aligned)?),
            MessageTag::EntityProperties => {
                let wire: EntityPropertiesMessage = unarchive(&aligned)?;
                Self::EntityProperties(wire.unpack()?)
            }
            MessageTag::EntityAcknowledge => Self::EntityAcknowledge(unarchive(&aligned)?),
            MessageTag::InputPredict => Self::InputPredict(unarchive(&aligned)?),
            MessageTag::EntityDestroy => Self::EntityDestroy(unarchive(&aligned)?),
        })
    }
}

fn archive<T>(value: &T) -> Result<AlignedVec, ProtocolError>
where
    T: for<'a> Serialize<HighSerializer<AlignedVec, ArenaHandle<'a>, rancor::Error>>,
{
    rkyv::to_bytes::<rancor::Error>(value).map_err(ProtocolError::Serialize)
}

fn unarchive<T>(bytes: &[u8]) -> Result<T, ProtocolError>
where
    T: Archive,
    T::Archived: for<'a> CheckBytes<HighValidator<'a, rancor::Error>>
        + Deserialize<T, HighDeserializer<rancor::Error>>,
{
    rkyv::from_bytes::<T, rancor::Error>(bytes).map_err(ProtocolError::Deserialize)
}
