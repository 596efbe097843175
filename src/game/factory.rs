//! Entity Factory
//!
//! Maps an entity kind to the constructor that composes its capabilities.
//! Game rules can register their own constructor for a kind.

use std::collections::BTreeMap;

use tracing::warn;

use crate::core::ids::{EntityId, PrototypeId};
use crate::game::entity::{Entity, EntityKind};
use crate::game::locomotion::Locomotor;
use crate::game::properties::PropertyValue;
use crate::game::prototype::{props, EntityPrototype, PrototypeTable};

/// Builds a fresh entity for a prototype.
pub type EntityConstructor = fn(EntityId, &EntityPrototype, &PrototypeTable) -> Entity;

/// Kind to constructor registry.
#[derive(Debug, Clone)]
pub struct EntityFactory {
    constructors: BTreeMap<EntityKind, EntityConstructor>,
}

impl EntityFactory {
    /// Registry with the standard constructor for every kind.
    pub fn new() -> Self {
        let mut constructors: BTreeMap<EntityKind, EntityConstructor> = BTreeMap::new();
        for kind in [
            EntityKind::Player,
            EntityKind::Avatar,
            EntityKind::Agent,
            EntityKind::Item,
            EntityKind::Prop,
            EntityKind::Generic,
        ] {
            constructors.insert(kind, construct_standard);
        }
        Self { constructors }
    }

    /// Replace the constructor for a kind.
    pub fn register(&mut self, kind: EntityKind, constructor: EntityConstructor) {
        self.constructors.insert(kind, constructor);
    }

    /// Build an entity of a prototype. Warns and returns `None` for an unknown prototype.
    pub fn construct(&self, id: EntityId, prototype: PrototypeId, table: &PrototypeTable) -> Option<Entity> {
        let Some(proto) = table.prototype(prototype) else {
            warn!("construct(): unknown prototype {}", prototype);
            return None;
        };
        let constructor = self.constructors.get(&proto.kind).copied().unwrap_or(construct_standard);
        Some(constructor(id, proto, table))
    }
}

impl Default for EntityFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// Standard composition: prototype properties plus the kind's capabilities.
pub fn construct_standard(id: EntityId, proto: &EntityPrototype, table: &PrototypeTable) -> Entity {
    let mut entity = Entity::new(id, proto.id, proto.kind);
    for (property, value) in &proto.properties {
        entity.properties.set(*property, value.clone());
    }

    if proto.kind.locomotes() {
        let declared = table.property(props::MOVE_SPEED).map(|info| &info.default);
        let speed = match entity.property(props::MOVE_SPEED).or(declared) {
            Some(PropertyValue::Float(speed)) => *speed,
            _ => 0.0,
        };
        entity = entity.with_locomotor(Locomotor::new(speed));
    }
    if proto.kind.holds_inventory() {
        entity = entity.with_inventory();
    }
    entity
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::prototype::protos;

    fn frozen_agent(id: EntityId, proto: &EntityPrototype, table: &PrototypeTable) -> Entity {
        let mut entity = construct_standard(id, proto, table);
        entity.locomotor = None;
        entity
    }

    #[test]
    fn test_standard_capabilities() {
        let table = PrototypeTable::builtin();
        let factory = EntityFactory::new();

        let avatar = factory.construct(EntityId(1), protos::AVATAR, &table).unwrap();
        assert_eq!(avatar.locomotor().map(|l| l.move_speed()), Some(8.0));
        assert!(avatar.inventory().is_some());
        assert_eq!(avatar.property(props::HEALTH), Some(&PropertyValue::Int(500)));

        let item = factory.construct(EntityId(2), protos::ITEM, &table).unwrap();
        assert!(item.locomotor().is_none());
        assert!(item.inventory().is_none());

        assert!(factory.construct(EntityId(3), PrototypeId(999), &table).is_none());
    }

    #[test]
    fn test_registered_constructor_wins() {
        let table = PrototypeTable::builtin();
        let mut factory = EntityFactory::new();
        factory.register(EntityKind::Agent, frozen_agent);
        let agent = factory.construct(EntityId(1), protos::AGENT, &table).unwrap();
        assert!(agent.locomotor().is_none());
    }
}
