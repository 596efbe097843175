//! Property Bags
//!
//! Typed key/value state attached to every entity. Each key is declared
//! in the [`PrototypeTable`] with a value type and the channels that may
//! observe it, so the same bag can be archived for any purpose:
//!
//! ```text
//! [count: varint] { [id: varint][type: u8][value] } * count
//! ```
//!
//! Only properties whose declared policy intersects the archive policy
//! are counted and written. Values are exact (floats travel as raw bits).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Serialize, Deserialize};

use crate::archive::{Archive, ArchiveError, AoiChannels, MAX_COLLECTION_LEN};
use crate::core::vec3::Vector3;
use crate::game::prototype::PrototypeTable;

/// Property key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct PropertyId(pub u16);

impl fmt::Debug for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PropertyId({})", self.0)
    }
}

/// Declared value type of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PropertyValueType {
    /// Boolean.
    Bool = 0,
    /// Signed integer.
    Int = 1,
    /// 32-bit float.
    Float = 2,
    /// Id-like unsigned value (entity, prototype, party...).
    Id = 3,
    /// Vector.
    Vector = 4,
    /// UTF-8 string.
    String = 5,
}

impl PropertyValueType {
    /// Decode a wire tag.
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Bool),
            1 => Some(Self::Int),
            2 => Some(Self::Float),
            3 => Some(Self::Id),
            4 => Some(Self::Vector),
            5 => Some(Self::String),
            _ => None,
        }
    }
}

/// Property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// 32-bit float.
    Float(f32),
    /// Id-like unsigned value.
    Id(u64),
    /// Vector.
    Vector(Vector3),
    /// UTF-8 string.
    String(String),
}

impl PropertyValue {
    /// Type of this value.
    pub fn value_type(&self) -> PropertyValueType {
        match self {
            Self::Bool(_) => PropertyValueType::Bool,
            Self::Int(_) => PropertyValueType::Int,
            Self::Float(_) => PropertyValueType::Float,
            Self::Id(_) => PropertyValueType::Id,
            Self::Vector(_) => PropertyValueType::Vector,
            Self::String(_) => PropertyValueType::String,
        }
    }

    /// Zero value of a type.
    pub fn zero(value_type: PropertyValueType) -> Self {
        match value_type {
            PropertyValueType::Bool => Self::Bool(false),
            PropertyValueType::Int => Self::Int(0),
            PropertyValueType::Float => Self::Float(0.0),
            PropertyValueType::Id => Self::Id(0),
            PropertyValueType::Vector => Self::Vector(Vector3::ZERO),
            PropertyValueType::String => Self::String(String::new()),
        }
    }

    /// Integer content, if any.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Id content, if any.
    pub fn as_id(&self) -> Option<u64> {
        match self {
            Self::Id(v) => Some(*v),
            _ => None,
        }
    }

    /// String content, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    fn transfer_payload(&mut self, archive: &mut Archive) -> Result<(), ArchiveError> {
        match self {
            Self::Bool(v) => archive.transfer(v),
            Self::Int(v) => archive.transfer(v),
            Self::Float(v) => {
                let mut bits = v.to_bits();
                archive.transfer(&mut bits)?;
                *v = f32::from_bits(bits);
                Ok(())
            }
            Self::Id(v) => archive.transfer(v),
            Self::Vector(v) => {
                for axis in [&mut v.x, &mut v.y, &mut v.z] {
                    let mut bits = axis.to_bits();
                    archive.transfer(&mut bits)?;
                    *axis = f32::from_bits(bits);
                }
                Ok(())
            }
            Self::String(v) => archive.transfer(v),
        }
    }
}

/// Ordered property bag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyCollection {
    values: BTreeMap<PropertyId, PropertyValue>,
}

impl PropertyCollection {
    /// Empty bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of a property.
    pub fn get(&self, id: PropertyId) -> Option<&PropertyValue> {
        self.values.get(&id)
    }

    /// Set a value. Returns true if the stored value changed.
    pub fn set(&mut self, id: PropertyId, value: PropertyValue) -> bool {
        match self.values.get(&id) {
            Some(existing) if *existing == value => false,
            _ => {
                self.values.insert(id, value);
                true
            }
        }
    }

    /// Remove a value.
    pub fn remove(&mut self, id: PropertyId) -> Option<PropertyValue> {
        self.values.remove(&id)
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&PropertyId, &PropertyValue)> {
        self.values.iter()
    }

    /// Archive the whole bag, filtered by the archive policy.
    pub fn transfer(&mut self, archive: &mut Archive, table: &PrototypeTable) -> Result<(), ArchiveError> {
        if archive.is_packing() {
            let visible: Vec<PropertyId> = self
                .values
                .keys()
                .copied()
                .filter(|id| table.property(*id).is_some_and(|info| archive.allows(info.policy)))
                .collect();
            let mut count = visible.len();
            archive.transfer_len(&mut count, MAX_COLLECTION_LEN)?;
            for id in visible {
                if let Some(value) = self.values.get_mut(&id) {
                    transfer_entry(archive, table, id, value)?;
                }
            }
            Ok(())
        } else {
            let mut count = 0;
            archive.transfer_len(&mut count, MAX_COLLECTION_LEN)?;
            self.values.clear();
            for _ in 0..count {
                let (id, value) = read_entry(archive, table)?;
                self.values.insert(id, value);
            }
            Ok(())
        }
    }

    /// Archive a single property. Used for incremental updates.
    pub fn transfer_one(
        archive: &mut Archive,
        table: &PrototypeTable,
        id: &mut PropertyId,
        value: &mut PropertyValue,
    ) -> Result<(), ArchiveError> {
        if archive.is_packing() {
            transfer_entry(archive, table, *id, value)
        } else {
            let (read_id, read_value) = read_entry(archive, table)?;
            *id = read_id;
            *value = read_value;
            Ok(())
        }
    }
}

fn transfer_entry(
    archive: &mut Archive,
    table: &PrototypeTable,
    id: PropertyId,
    value: &mut PropertyValue,
) -> Result<(), ArchiveError> {
    let info = table.property(id).ok_or(ArchiveError::UnknownProperty(id.0 as u32))?;
    if !archive.allows(info.policy) {
        return Err(ArchiveError::PolicyViolation(id.0 as u32));
    }
    let mut raw_id = id.0 as u32;
    archive.transfer(&mut raw_id)?;
    let mut tag = value.value_type() as u8;
    archive.transfer(&mut tag)?;
    value.transfer_payload(archive)
}

fn read_entry(archive: &mut Archive, table: &PrototypeTable) -> Result<(PropertyId, PropertyValue), ArchiveError> {
    let mut raw_id = 0u32;
    archive.transfer(&mut raw_id)?;
    let id = u16::try_from(raw_id)
        .map(PropertyId)
        .map_err(|_| ArchiveError::UnknownProperty(raw_id))?;
    let info = table.property(id).ok_or(ArchiveError::UnknownProperty(raw_id))?;
    if !archive.allows(info.policy) {
        return Err(ArchiveError::PolicyViolation(raw_id));
    }

    let mut tag = 0u8;
    archive.transfer(&mut tag)?;
    let value_type = PropertyValueType::from_u8(tag)
        .filter(|t| *t == info.value_type)
        .ok_or(ArchiveError::BadValueType { property: raw_id, tag })?;

    let mut value = PropertyValue::zero(value_type);
    value.transfer_payload(archive)?;
    Ok((id, value))
}

/// Channels that may observe a property, for callers holding only an id.
pub fn property_policy(table: &PrototypeTable, id: PropertyId) -> AoiChannels {
    table.property(id).map(|info| info.policy).unwrap_or(AoiChannels::NONE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchivePurpose;
    use crate::game::prototype::props;
    use proptest::prelude::*;

    fn bag() -> PropertyCollection {
        let mut bag = PropertyCollection::new();
        bag.set(props::HEALTH, PropertyValue::Int(250));
        bag.set(props::PLAYER_NAME, PropertyValue::String("Storm".into()));
        bag.set(props::EXPERIENCE, PropertyValue::Int(12_345));
        bag.set(props::PARTY_ID, PropertyValue::Id(9));
        bag
    }

    fn encode(bag: &PropertyCollection, mut archive: Archive, table: &PrototypeTable) -> Vec<u8> {
        let mut copy = bag.clone();
        copy.transfer(&mut archive, table).unwrap();
        archive.into_bytes().unwrap()
    }

    fn decode(bytes: Vec<u8>, table: &PrototypeTable) -> PropertyCollection {
        let mut archive = Archive::unpack(bytes).unwrap();
        let mut bag = PropertyCollection::new();
        bag.transfer(&mut archive, table).unwrap();
        archive.finish().unwrap();
        bag
    }

    #[test]
    fn test_set_reports_change() {
        let mut bag = PropertyCollection::new();
        assert!(bag.set(props::HEALTH, PropertyValue::Int(5)));
        assert!(!bag.set(props::HEALTH, PropertyValue::Int(5)));
        assert!(bag.set(props::HEALTH, PropertyValue::Int(6)));
    }

    #[test]
    fn test_owner_only_property_gated() {
        let table = PrototypeTable::builtin();

        let proximity = decode(encode(&bag(), Archive::new_replication(AoiChannels::PROXIMITY), &table), &table);
        assert!(proximity.get(props::EXPERIENCE).is_none());
        assert!(proximity.get(props::PARTY_ID).is_none());
        assert_eq!(proximity.get(props::HEALTH), Some(&PropertyValue::Int(250)));

        let owner = decode(encode(&bag(), Archive::new_replication(AoiChannels::OWNER), &table), &table);
        assert_eq!(owner, bag());
    }

    #[test]
    fn test_persistent_carries_everything() {
        let table = PrototypeTable::builtin();
        let decoded = decode(encode(&bag(), Archive::new_persistent(), &table), &table);
        assert_eq!(decoded, bag());
    }

    #[test]
    fn test_decoder_rejects_field_outside_policy() {
        let table = PrototypeTable::builtin();
        let bytes = encode(&bag(), Archive::new_persistent(), &table);
        // Same payload relabelled as a proximity replication stream.
        let mut forged = Archive::new_replication(AoiChannels::PROXIMITY).into_bytes().unwrap();
        forged.extend_from_slice(&bytes[2..]);
        let mut archive = Archive::unpack(forged).unwrap();
        let mut out = PropertyCollection::new();
        assert!(matches!(out.transfer(&mut archive, &table), Err(ArchiveError::PolicyViolation(_))));
    }

    #[test]
    fn test_bad_type_tag() {
        let table = PrototypeTable::builtin();
        let mut archive = Archive::new_persistent();
        let mut count = 1usize;
        archive.transfer_len(&mut count, MAX_COLLECTION_LEN).unwrap();
        let mut id = props::HEALTH.0 as u32;
        archive.transfer(&mut id).unwrap();
        let mut tag = PropertyValueType::String as u8;
        archive.transfer(&mut tag).unwrap();
        let bytes = archive.into_bytes().unwrap();

        let mut archive = Archive::unpack(bytes).unwrap();
        let mut out = PropertyCollection::new();
        assert!(matches!(out.transfer(&mut archive, &table), Err(ArchiveError::BadValueType { .. })));
    }

    #[test]
    fn test_single_property_update() {
        let table = PrototypeTable::builtin();
        let mut archive = Archive::new_replication(AoiChannels::PROXIMITY);
        let mut id = props::HEALTH;
        let mut value = PropertyValue::Int(-3);
        PropertyCollection::transfer_one(&mut archive, &table, &mut id, &mut value).unwrap();
        let bytes = archive.into_bytes().unwrap();

        let mut archive = Archive::unpack_expecting(ArchivePurpose::Replication, AoiChannels::PROXIMITY, bytes).unwrap();
        let mut id = PropertyId::default();
        let mut value = PropertyValue::Bool(false);
        PropertyCollection::transfer_one(&mut archive, &table, &mut id, &mut value).unwrap();
        assert_eq!(id, props::HEALTH);
        assert_eq!(value, PropertyValue::Int(-3));
    }

    proptest! {
        #[test]
        fn prop_decode_matches_policy_filter(
            health in any::<i64>(),
            xp in any::<i64>(),
            party in any::<u64>(),
            speed in any::<f32>().prop_filter("finite", |f| f.is_finite()),
            policy_bits in 0u32..8,
        ) {
            let table = PrototypeTable::builtin();
            let policy = AoiChannels::from_bits_truncate(policy_bits);

            let mut bag = PropertyCollection::new();
            bag.set(props::HEALTH, PropertyValue::Int(health));
            bag.set(props::EXPERIENCE, PropertyValue::Int(xp));
            bag.set(props::PARTY_ID, PropertyValue::Id(party));
            bag.set(props::MOVE_SPEED, PropertyValue::Float(speed));

            let decoded = decode(encode(&bag, Archive::new_replication(policy), &table), &table);

            for (id, value) in bag.iter() {
                let visible = property_policy(&table, *id).intersects(policy);
                prop_assert_eq!(decoded.get(*id), if visible { Some(value) } else { None });
            }
            prop_assert!(decoded.len() <= bag.len());
        }
    }
}
