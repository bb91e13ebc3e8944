use std::collections::HashMap;

use glam::Vec3;
use proptest::prelude::*;

use protosync::{
    ClientReplicator, EntityAcknowledge, EntityCreate, EntityFactoryRegistry, NetworkMessage,
    PropertyDelta, PropertyValue, ReplicationConfig, Transform,
};

fn client() -> ClientReplicator {
    let mut registry = EntityFactoryRegistry::new();
    registry.register_plain("BasicUnit").unwrap();
    let mut client = ClientReplicator::new(ReplicationConfig::default(), registry);
    client.apply_message(NetworkMessage::EntityCreate(EntityCreate::new(
        5,
        "BasicUnit",
        &Transform::IDENTITY,
        0,
    )));
    client
}

/// Batches keyed by unique frame tick: (health, armor), either may be absent.
fn batches() -> impl Strategy<Value = Vec<(u32, Option<i32>, Option<i16>)>> {
    prop::collection::btree_map(
        1u32..10_000,
        (prop::option::of(any::<i32>()), prop::option::of(any::<i16>())),
        1..24,
    )
    .prop_map(|batches| {
        batches
            .into_iter()
            .map(|(tick, (health, armor))| (tick, health, armor))
            .collect::<Vec<_>>()
    })
    .prop_shuffle()
}

proptest! {
    #[test]
    fn each_property_keeps_its_newest_value(batches in batches()) {
        let mut client = client();

        for (tick, health, armor) in &batches {
            let mut delta = PropertyDelta::new(5, *tick);
            if let Some(health) = health {
                delta = delta.with("health", PropertyValue::Int32(*health));
            }
            if let Some(armor) = armor {
                delta = delta.with("armor", PropertyValue::Int16(*armor));
            }
            let frame = NetworkMessage::EntityProperties(delta).encode().unwrap();
            client.receive(&frame).unwrap();
        }

        let newest_health = batches
            .iter()
            .filter_map(|(tick, health, _)| health.map(|h| (*tick, h)))
            .max_by_key(|(tick, _)| *tick)
            .map(|(_, h)| PropertyValue::Int32(h));
        let newest_armor = batches
            .iter()
            .filter_map(|(tick, _, armor)| armor.map(|a| (*tick, a)))
            .max_by_key(|(tick, _)| *tick)
            .map(|(_, a)| PropertyValue::Int16(a));

        let record = client.entity(5).unwrap();
        prop_assert_eq!(record.property("health").cloned(), newest_health);
        prop_assert_eq!(record.property("armor").cloned(), newest_armor);
    }

    #[test]
    fn cumulative_acks_retire_up_to_the_highest(acks in prop::collection::vec(1u32..=20, 0..40)) {
        let mut client = client();
        for _ in 0..20 {
            client.predict(5, Vec3::X).unwrap();
        }

        let after: HashMap<u32, Transform> = client
            .prediction(5)
            .unwrap()
            .pending()
            .map(|p| (p.prediction_id, p.predicted_after))
            .collect();

        let mut highest = 0;
        for &id in &acks {
            let ack = NetworkMessage::EntityAcknowledge(EntityAcknowledge {
                entity_id: 5,
                prediction_id: id,
                frame_tick: id,
                transform: after[&id].to_network(),
            });
            client.apply_message(ack.clone());
            highest = highest.max(id);

            let expected: Vec<u32> = (highest + 1..=20).collect();
            prop_assert_eq!(client.pending_prediction_ids(5), expected.clone());

            // Processing the same ack again changes nothing.
            client.apply_message(ack);
            prop_assert_eq!(client.pending_prediction_ids(5), expected);
        }
    }
}
