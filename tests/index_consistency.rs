//! Index consistency under random mutation sequences.

mod common;

use common::admin_store;
use flatshard::{IndexKey, RecordId, TypeTag, Value};
use proptest::prelude::*;
use proptest::sample::Index;
use std::collections::BTreeMap;
use tempfile::TempDir;

#[derive(Clone, Debug)]
enum Op {
    Insert(u8),
    Update(Index, u8),
    Delete(Index),
}

/// A small value domain so keys collide often.
fn value_of(n: u8) -> Value {
    match n % 4 {
        0 => Value::Int(0),
        1 => Value::Int(1),
        2 => Value::from("a"),
        _ => Value::Float(0.5),
    }
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..4).prop_map(Op::Insert),
        (any::<Index>(), 0u8..4).prop_map(|(i, v)| Op::Update(i, v)),
        any::<Index>().prop_map(Op::Delete),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_lookups_match_live_records(ops in prop::collection::vec(op(), 1..24)) {
        let dir = TempDir::new().unwrap();
        let store = admin_store(&dir, 4);
        store.create_index("Value").unwrap().wait().unwrap();

        let mut issued: Vec<RecordId> = Vec::new();
        let mut live: BTreeMap<RecordId, Value> = BTreeMap::new();
        for op in ops {
            match op {
                Op::Insert(v) => {
                    let id = store.insert(value_of(v)).unwrap().wait().unwrap();
                    issued.push(id);
                    live.insert(id, value_of(v));
                }
                Op::Update(i, v) if !issued.is_empty() => {
                    let id = issued[i.index(issued.len())];
                    let found = store.update(id, value_of(v)).unwrap().wait().unwrap();
                    prop_assert_eq!(found, live.contains_key(&id));
                    if found {
                        live.insert(id, value_of(v));
                    }
                }
                Op::Delete(i) if !issued.is_empty() => {
                    let id = issued[i.index(issued.len())];
                    let removed = store.delete(id).unwrap().wait().unwrap();
                    prop_assert_eq!(removed, live.remove(&id).is_some());
                }
                _ => {}
            }
        }
        // Built from a scan of the final shards.
        store.create_index("Type").unwrap().wait().unwrap();

        for n in 0..4u8 {
            let value = value_of(n);
            let expected: Vec<RecordId> = live
                .iter()
                .filter(|(_, v)| **v == value)
                .map(|(id, _)| *id)
                .collect();
            let key = IndexKey::for_value(&value).unwrap();
            prop_assert_eq!(
                store.lookup_all("Value", key.clone()).unwrap().wait().unwrap(),
                expected.clone()
            );
            prop_assert_eq!(
                store.lookup("Value", key).unwrap().wait().unwrap(),
                expected.last().copied()
            );
        }
        for tag in [TypeTag::Int, TypeTag::Float, TypeTag::Str] {
            let expected: Vec<RecordId> = live
                .iter()
                .filter(|(_, v)| v.type_tag() == tag)
                .map(|(id, _)| *id)
                .collect();
            prop_assert_eq!(
                store
                    .lookup_all("Type", IndexKey::for_type(tag))
                    .unwrap()
                    .wait()
                    .unwrap(),
                expected
            );
        }
        prop_assert_eq!(store.count().unwrap().wait().unwrap(), live.len() as u64);
    }
}
