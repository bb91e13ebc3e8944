use glam::{Mat4, Quat, Vec2, Vec3, Vec4};
use rkyv::{Archive, Deserialize, Serialize};

use super::protocol::ProtocolError;
use super::transform::{NetworkTransform, Transform};

/// Wire tag for each kind of property value. Values are fixed for wire compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PropertyTag {
    None = 0,
    Null = 1,
    String = 2,
    Int16 = 3,
    Int32 = 4,
    Single = 5,
    Double = 6,
    Boolean = 7,
    Vector2 = 8,
    Vector3 = 9,
    Vector4 = 10,
    Quaternion = 11,
    Matrix = 12,
    Transform = 13,
}

impl TryFrom<u8> for PropertyTag {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::None,
            1 => Self::Null,
            2 => Self::String,
            3 => Self::Int16,
            4 => Self::Int32,
            5 => Self::Single,
            6 => Self::Double,
            7 => Self::Boolean,
            8 => Self::Vector2,
            9 => Self::Vector3,
            10 => Self::Vector4,
            11 => Self::Quaternion,
            12 => Self::Matrix,
            13 => Self::Transform,
            other => return Err(ProtocolError::UnknownPropertyTag(other)),
        })
    }
}

impl PropertyTag {
    /// Number of floats a value of this kind occupies in the float-array slot.
    pub fn float_width(self) -> usize {
        match self {
            Self::Vector2 => 2,
            Self::Vector3 => 3,
            Self::Vector4 | Self::Quaternion => 4,
            Self::Matrix => 16,
            _ => 0,
        }
    }
}

/// A synchronised property value.
///
/// `None` marks a property that is present in a delta but carries no value;
/// applying it changes nothing. `Null` explicitly clears the property.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    None,
    Null,
    String(String),
    Int16(i16),
    Int32(i32),
    Single(f32),
    Double(f64),
    Boolean(bool),
    Vector2(Vec2),
    Vector3(Vec3),
    Vector4(Vec4),
    Quaternion(Quat),
    Matrix(Mat4),
    Transform(Transform),
}

impl PropertyValue {
    pub fn tag(&self) -> PropertyTag {
        match self {
            Self::None => PropertyTag::None,
            Self::Null => PropertyTag::Null,
            Self::String(_) => PropertyTag::String,
            Self::Int16(_) => PropertyTag::Int16,
            Self::Int32(_) => PropertyTag::Int32,
            Self::Single(_) => PropertyTag::Single,
            Self::Double(_) => PropertyTag::Double,
            Self::Boolean(_) => PropertyTag::Boolean,
            Self::Vector2(_) => PropertyTag::Vector2,
            Self::Vector3(_) => PropertyTag::Vector3,
            Self::Vector4(_) => PropertyTag::Vector4,
            Self::Quaternion(_) => PropertyTag::Quaternion,
            Self::Matrix(_) => PropertyTag::Matrix,
            Self::Transform(_) => PropertyTag::Transform,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::Int32(v) => Some(*v),
            Self::Int16(v) => Some(i32::from(*v)),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Self::Single(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_transform(&self) -> Option<&Transform> {
        match self {
            Self::Transform(v) => Some(v),
            _ => None,
        }
    }
}

/// A batch of property changes for one entity at one frame tick.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDelta {
    pub entity_id: u32,
    pub frame_tick: u32,
    pub properties: Vec<(String, PropertyValue)>,
}

impl PropertyDelta {
    pub fn new(entity_id: u32, frame_tick: u32) -> Self {
        Self {
            entity_id,
            frame_tick,
            properties: Vec::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.push((name.into(), value));
        self
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.properties
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

/// Wire layout of an entity properties message: names and tags run in
/// parallel, and each value lives in the typed array its tag selects.
#[derive(Debug, Clone, Default, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct EntityPropertiesMessage {
    pub entity_id: u32,
    pub frame_tick: u32,
    pub property_names: Vec<String>,
    pub property_types: Vec<u8>,
    pub values_string: Vec<String>,
    pub values_int16: Vec<i16>,
    pub values_int32: Vec<i32>,
    pub values_single: Vec<f32>,
    pub values_double: Vec<f64>,
    pub values_boolean: Vec<bool>,
    pub values_single_array: Vec<f32>,
    pub values_transform: Vec<NetworkTransform>,
}

impl EntityPropertiesMessage {
    pub fn pack(delta: &PropertyDelta) -> Self {
        let mut message = Self {
            entity_id: delta.entity_id,
            frame_tick: delta.frame_tick,
            property_names: Vec::with_capacity(delta.properties.len()),
            property_types: Vec::with_capacity(delta.properties.len()),
            ..Self::default()
        };

        for (name, value) in &delta.properties {
            message.property_names.push(name.clone());
            message.property_types.push(value.tag() as u8);

            match value {
                PropertyValue::None | PropertyValue::Null => {}
                PropertyValue::String(v) => message.values_string.push(v.clone()),
                PropertyValue::Int16(v) => message.values_int16.push(*v),
                PropertyValue::Int32(v) => message.values_int32.push(*v),
                PropertyValue::Single(v) => message.values_single.push(*v),
                PropertyValue::Double(v) => message.values_double.push(*v),
                PropertyValue::Boolean(v) => message.values_boolean.push(*v),
                PropertyValue::Vector2(v) => message.values_single_array.extend(v.to_array()),
                PropertyValue::Vector3(v) => message.values_single_array.extend(v.to_array()),
                PropertyValue::Vector4(v) => message.values_single_array.extend(v.to_array()),
                PropertyValue::Quaternion(v) => {
                    message.values_single_array.extend(v.to_array())
                }
                PropertyValue::Matrix(v) => {
                    message.values_single_array.extend(v.to_cols_array())
                }
                PropertyValue::Transform(v) => message.values_transform.push(v.to_network()),
            }
        }

        message
    }

    pub fn unpack(&self) -> Result<PropertyDelta, ProtocolError> {
        if self.property_names.len() != self.property_types.len() {
            return Err(ProtocolError::PropertyCountMismatch {
                names: self.property_names.len(),
                types: self.property_types.len(),
            });
        }

        let mut cursor = Cursors::default();
        let mut properties = Vec::with_capacity(self.property_names.len());

        for (name, &raw_tag) in self.property_names.iter().zip(&self.property_types) {
            let tag = PropertyTag::try_from(raw_tag)?;
            let value = match tag {
                PropertyTag::None => PropertyValue::None,
                PropertyTag::Null => PropertyValue::Null,
                PropertyTag::String => {
                    let value = take(&self.values_string, &mut cursor.string, tag)?;
                    PropertyValue::String(value.clone())
                }
                PropertyTag::Int16 => {
                    PropertyValue::Int16(*take(&self.values_int16, &mut cursor.int16, tag)?)
                }
                PropertyTag::Int32 => {
                    PropertyValue::Int32(*take(&self.values_int32, &mut cursor.int32, tag)?)
                }
                PropertyTag::Single => {
                    PropertyValue::Single(*take(&self.values_single, &mut cursor.single, tag)?)
                }
                PropertyTag::Double => {
                    PropertyValue::Double(*take(&self.values_double, &mut cursor.double, tag)?)
                }
                PropertyTag::Boolean => {
                    PropertyValue::Boolean(*take(&self.values_boolean, &mut cursor.boolean, tag)?)
                }
                PropertyTag::Vector2 => {
                    let f = self.take_floats(&mut cursor.single_array, tag)?;
                    PropertyValue::Vector2(Vec2::from_slice(f))
                }
                PropertyTag::Vector3 => {
                    let f = self.take_floats(&mut cursor.single_array, tag)?;
                    PropertyValue::Vector3(Vec3::from_slice(f))
                }
                PropertyTag::Vector4 => {
                    let f = self.take_floats(&mut cursor.single_array, tag)?;
                    PropertyValue::Vector4(Vec4::from_slice(f))
                }
                PropertyTag::Quaternion => {
                    let f = self.take_floats(&mut cursor.single_array, tag)?;
                    PropertyValue::Quaternion(Quat::from_slice(f))
                }
                PropertyTag::Matrix => {
                    let f = self.take_floats(&mut cursor.single_array, tag)?;
                    PropertyValue::Matrix(Mat4::from_cols_slice(f))
                }
                PropertyTag::Transform => {
                    let t = take(&self.values_transform, &mut cursor.transform, tag)?;
                    PropertyValue::Transform(Transform::from_network(t))
                }
            };
            properties.push((name.clone(), value));
        }

        cursor.check_exhausted(self)?;

        Ok(PropertyDelta {
            entity_id: self.entity_id,
            frame_tick: self.frame_tick,
            properties,
        })
    }

    fn take_floats(&self, cursor: &mut usize, tag: PropertyTag) -> Result<&[f32], ProtocolError> {
        let width = tag.float_width();
        let end = *cursor + width;
        let slice = self
            .values_single_array
            .get(*cursor..end)
            .ok_or(ProtocolError::MissingPropertyValue(tag))?;
        *cursor = end;
        Ok(slice)
    }
}

#[derive(Default)]
struct Cursors {
    string: usize,
    int16: usize,
    int32: usize,
    single: usize,
    double: usize,
    boolean: usize,
    single_array: usize,
    transform: usize,
}

impl Cursors {
    fn check_exhausted(&self, message: &EntityPropertiesMessage) -> Result<(), ProtocolError> {
        let leftovers = [
            (self.string, message.values_string.len(), PropertyTag::String),
            (self.int16, message.values_int16.len(), PropertyTag::Int16),
            (self.int32, message.values_int32.len(), PropertyTag::Int32),
            (self.single, message.values_single.len(), PropertyTag::Single),
            (self.double, message.values_double.len(), PropertyTag::Double),
            (self.boolean, message.values_boolean.len(), PropertyTag::Boolean),
            (
                self.single_array,
                message.values_single_array.len(),
                PropertyTag::Matrix,
            ),
            (
                self.transform,
                message.values_transform.len(),
                PropertyTag::Transform,
            ),
        ];

        match leftovers.iter().find(|(used, len, _)| used != len) {
            Some((_, _, tag)) => Err(ProtocolError::TrailingPropertyValues(*tag)),
            None => Ok(()),
        }
    }
}

fn take<'a, T>(
    values: &'a [T],
    cursor: &mut usize,
    tag: PropertyTag,
) -> Result<&'a T, ProtocolError> {
    let value = values
        .get(*cursor)
        .ok_or(ProtocolError::MissingPropertyValue(tag))?;
    *cursor += 1;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mixed_delta() -> PropertyDelta {
        PropertyDelta::new(5, 10)
            .with("health", PropertyValue::Int32(80))
            .with("name", PropertyValue::String("scout".to_string()))
            .with("target", PropertyValue::Null)
            .with("velocity", PropertyValue::Vector3(Vec3::new(1.0, 2.0, 3.0)))
            .with("armor", PropertyValue::Int16(-4))
            .with("facing", PropertyValue::Quaternion(Quat::from_rotation_z(0.5)))
            .with("alive", PropertyValue::Boolean(true))
            .with("anchor", PropertyValue::Vector2(Vec2::new(4.0, 5.0)))
            .with("skip", PropertyValue::None)
            .with(
                "transform",
                PropertyValue::Transform(Transform::from_position(Vec3::X)),
            )
    }

    #[test]
    fn pack_populates_only_used_arrays() {
        let message = EntityPropertiesMessage::pack(&mixed_delta());

        assert_eq!(message.property_names.len(), 10);
        assert_eq!(message.property_types[0], PropertyTag::Int32 as u8);
        assert_eq!(message.values_int32, vec![80]);
        assert_eq!(message.values_string, vec!["scout".to_string()]);
        assert_eq!(message.values_single_array.len(), 3 + 4 + 2);
        assert!(message.values_double.is_empty());
        assert_eq!(message.values_transform.len(), 1);
    }

    #[test]
    fn unpack_restores_values_in_order() {
        let delta = mixed_delta();
        let unpacked = EntityPropertiesMessage::pack(&delta).unpack().unwrap();

        assert_eq!(unpacked.entity_id, 5);
        assert_eq!(unpacked.frame_tick, 10);
        let names: Vec<&str> = unpacked.properties.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            [
                "health", "name", "target", "velocity", "armor", "facing", "alive", "anchor",
                "skip", "transform"
            ]
        );
        assert_eq!(unpacked.get("velocity"), delta.get("velocity"));
        assert_eq!(unpacked.get("anchor"), delta.get("anchor"));
        assert_eq!(unpacked.get("skip"), Some(&PropertyValue::None));
    }

    #[test]
    fn matrix_uses_sixteen_floats() {
        let matrix = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let delta = PropertyDelta::new(1, 1).with("world", PropertyValue::Matrix(matrix));
        let message = EntityPropertiesMessage::pack(&delta);

        assert_eq!(message.values_single_array.len(), 16);
        assert_eq!(
            message.unpack().unwrap().get("world"),
            Some(&PropertyValue::Matrix(matrix))
        );
    }

    #[test]
    fn mismatched_name_and_type_counts_are_rejected() {
        let mut message = EntityPropertiesMessage::pack(&mixed_delta());
        message.property_types.pop();

        assert!(matches!(
            message.unpack(),
            Err(ProtocolError::PropertyCountMismatch { names: 10, types: 9 })
        ));
    }

    #[test]
    fn missing_typed_value_is_rejected() {
        let mut message = EntityPropertiesMessage::pack(&mixed_delta());
        message.values_int32.clear();

        assert!(matches!(
            message.unpack(),
            Err(ProtocolError::MissingPropertyValue(PropertyTag::Int32))
        ));
    }

    #[test]
    fn trailing_values_are_rejected() {
        let mut message = EntityPropertiesMessage::pack(&mixed_delta());
        message.values_double.push(1.0);

        assert!(matches!(
            message.unpack(),
            Err(ProtocolError::TrailingPropertyValues(PropertyTag::Double))
        ));
    }

    #[test]
    fn unknown_property_tag_is_rejected() {
        let mut message = EntityPropertiesMessage::pack(&mixed_delta());
        message.property_types[2] = 200;

        assert!(matches!(
            message.unpack(),
            Err(ProtocolError::UnknownPropertyTag(200))
        ));
    }
}
