//! Prototype Table
//!
//! Static type data loaded once at startup: property declarations and
//! entity prototypes. Immutable after construction and shared across
//! game instances behind an `Arc`.

use std::collections::BTreeMap;

use serde::{Serialize, Deserialize};

use crate::archive::AoiChannels;
use crate::core::ids::PrototypeId;
use crate::game::entity::EntityKind;
use crate::game::properties::{PropertyId, PropertyValue, PropertyValueType};

/// Builtin property ids.
pub mod props {
    use super::PropertyId;

    /// Current health.
    pub const HEALTH: PropertyId = PropertyId(1);
    /// Maximum health.
    pub const HEALTH_MAX: PropertyId = PropertyId(2);
    /// Display name of a player.
    pub const PLAYER_NAME: PropertyId = PropertyId(3);
    /// Experience points.
    pub const EXPERIENCE: PropertyId = PropertyId(4);
    /// Currency balance.
    pub const CREDITS: PropertyId = PropertyId(5);
    /// Party the owning player belongs to.
    pub const PARTY_ID: PropertyId = PropertyId(6);
    /// Base movement speed, units per second.
    pub const MOVE_SPEED: PropertyId = PropertyId(7);
}

/// Builtin prototype ids.
pub mod protos {
    use super::PrototypeId;

    /// Player (account-bound, never placed).
    pub const PLAYER: PrototypeId = PrototypeId(1);
    /// Controllable avatar.
    pub const AVATAR: PrototypeId = PrototypeId(2);
    /// Non-player agent.
    pub const AGENT: PrototypeId = PrototypeId(3);
    /// Inventory item.
    pub const ITEM: PrototypeId = PrototypeId(4);
    /// Static world prop.
    pub const PROP: PrototypeId = PrototypeId(5);
}

/// Declaration of a property key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyInfo {
    /// Key.
    pub id: PropertyId,
    /// Name for logs and tooling.
    pub name: String,
    /// Channels allowed to observe the property.
    pub policy: AoiChannels,
    /// Declared value type.
    pub value_type: PropertyValueType,
    /// Value used when an entity does not override it.
    pub default: PropertyValue,
}

/// Static description of an entity type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityPrototype {
    /// Key.
    pub id: PrototypeId,
    /// Name for logs and tooling.
    pub name: String,
    /// Kind selecting the constructor in the entity factory.
    pub kind: EntityKind,
    /// Initial property values.
    pub properties: Vec<(PropertyId, PropertyValue)>,
}

/// Prototype table errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PrototypeError {
    /// Key registered twice.
    #[error("Duplicate {kind} id {id}")]
    Duplicate {
        /// Which table.
        kind: &'static str,
        /// Raw id.
        id: u64,
    },

    /// Default value does not match the declared type.
    #[error("Default for property {0} does not match its declared type")]
    DefaultTypeMismatch(u16),

    /// Prototype references an undeclared property.
    #[error("Prototype {prototype} references unknown property {property}")]
    UnknownProperty {
        /// Prototype id.
        prototype: u64,
        /// Property id.
        property: u16,
    },
}

/// Immutable lookup tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrototypeTable {
    properties: BTreeMap<PropertyId, PropertyInfo>,
    entities: BTreeMap<PrototypeId, EntityPrototype>,
}

impl PrototypeTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard properties and prototypes.
    pub fn builtin() -> Self {
        let everyone = AoiChannels::PROXIMITY | AoiChannels::PARTY | AoiChannels::OWNER;
        let party = AoiChannels::PARTY | AoiChannels::OWNER;
        let owner = AoiChannels::OWNER;

        let properties = [
            (props::HEALTH, "Health", everyone, PropertyValue::Int(100)),
            (props::HEALTH_MAX, "HealthMax", everyone, PropertyValue::Int(100)),
            (props::PLAYER_NAME, "PlayerName", everyone, PropertyValue::String(String::new())),
            (props::EXPERIENCE, "Experience", owner, PropertyValue::Int(0)),
            (props::CREDITS, "Credits", owner, PropertyValue::Int(0)),
            (props::PARTY_ID, "PartyId", party, PropertyValue::Id(0)),
            (props::MOVE_SPEED, "MoveSpeed", everyone, PropertyValue::Float(6.0)),
        ];

        let mut table = Self::new();
        for (id, name, policy, default) in properties {
            table.properties.insert(id, PropertyInfo {
                id,
                name: name.to_string(),
                policy,
                value_type: default.value_type(),
                default,
            });
        }

        let prototypes = [
            (protos::PLAYER, "Player", EntityKind::Player, vec![
                (props::CREDITS, PropertyValue::Int(0)),
            ]),
            (protos::AVATAR, "Avatar", EntityKind::Avatar, vec![
                (props::HEALTH, PropertyValue::Int(500)),
                (props::HEALTH_MAX, PropertyValue::Int(500)),
                (props::EXPERIENCE, PropertyValue::Int(0)),
                (props::MOVE_SPEED, PropertyValue::Float(8.0)),
            ]),
            (protos::AGENT, "Agent", EntityKind::Agent, vec![
                (props::HEALTH, PropertyValue::Int(100)),
                (props::HEALTH_MAX, PropertyValue::Int(100)),
            ]),
            (protos::ITEM, "Item", EntityKind::Item, vec![]),
            (protos::PROP, "Prop", EntityKind::Prop, vec![]),
        ];
        for (id, name, kind, properties) in prototypes {
            table.entities.insert(id, EntityPrototype { id, name: name.to_string(), kind, properties });
        }

        table
    }

    /// Declare a property.
    pub fn register_property(&mut self, info: PropertyInfo) -> Result<(), PrototypeError> {
        if self.properties.contains_key(&info.id) {
            return Err(PrototypeError::Duplicate { kind: "property", id: info.id.0 as u64 });
        }
        if info.default.value_type() != info.value_type {
            return Err(PrototypeError::DefaultTypeMismatch(info.id.0));
        }
        self.properties.insert(info.id, info);
        Ok(())
    }

    /// Declare an entity prototype.
    pub fn register_prototype(&mut self, prototype: EntityPrototype) -> Result<(), PrototypeError> {
        if self.entities.contains_key(&prototype.id) {
            return Err(PrototypeError::Duplicate { kind: "prototype", id: prototype.id.0 });
        }
        for (property, value) in &prototype.properties {
            match self.properties.get(property) {
                None => {
                    return Err(PrototypeError::UnknownProperty {
                        prototype: prototype.id.0,
                        property: property.0,
                    })
                }
                Some(info) if info.value_type != value.value_type() => {
                    return Err(PrototypeError::DefaultTypeMismatch(property.0))
                }
                Some(_) => {}
            }
        }
        self.entities.insert(prototype.id, prototype);
        Ok(())
    }

    /// Property declaration.
    pub fn property(&self, id: PropertyId) -> Option<&PropertyInfo> {
        self.properties.get(&id)
    }

    /// Entity prototype.
    pub fn prototype(&self, id: PrototypeId) -> Option<&EntityPrototype> {
        self.entities.get(&id)
    }

    /// Find a prototype by name.
    pub fn prototype_by_name(&self, name: &str) -> Option<&EntityPrototype> {
        self.entities.values().find(|p| p.name == name)
    }

    /// Number of entity prototypes.
    pub fn prototype_count(&self) -> usize {
        self.entities.len()
    }
}
