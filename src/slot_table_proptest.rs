#![cfg(test)]

// Property tests for SlotTable kept inside the crate so they do not
// require exposing the internal module.

use crate::slot_table::{SlotId, SlotTable};
use proptest::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};

// Key newtype with Borrow<str> to exercise borrowed lookup.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
struct Key(String);
impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
impl std::borrow::Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// Pool-indexed operations to improve shrinking: indices shrink to earlier keys,
// pool length shrinks, and op lists shrink in length.
#[derive(Clone, Debug)]
enum OpI {
    Insert(usize, i32),
    RemoveId(usize),
    RemoveKey(usize),
    Find(usize),
    Contains(String),
    RetainEven,
    Iterate,
}

fn key_from(pool: &[String], i: usize) -> Key {
    Key(pool[i].clone())
}

fn arb_scenario() -> impl Strategy<Value = (Vec<String>, Vec<OpI>)> {
    proptest::collection::vec("[a-z]{0,5}", 1..=8).prop_flat_map(|pool| {
        let idxs: Vec<usize> = (0..pool.len()).collect();
        let idx = proptest::sample::select(idxs);
        let contains_pool = proptest::sample::select(pool.clone());
        let op = prop_oneof![
            4 => (idx.clone(), any::<i32>()).prop_map(|(i, v)| OpI::Insert(i, v)),
            1 => idx.clone().prop_map(OpI::RemoveId),
            1 => idx.clone().prop_map(OpI::RemoveKey),
            2 => idx.clone().prop_map(OpI::Find),
            1 => prop_oneof![
                contains_pool.prop_map(|s: String| s),
                "[a-z]{0,5}".prop_map(|s| s)
            ]
            .prop_map(OpI::Contains),
            1 => Just(OpI::RetainEven),
            1 => Just(OpI::Iterate),
        ];
        proptest::collection::vec(op, 1..60).prop_map(move |ops| (pool.clone(), ops))
    })
}

// Runs one scenario against `sut` and a std HashMap model.
// Invariants exercised across random operation sequences:
// - Insert replaces: at most one entry per key, the replaced pair matches the model.
// - Every replaced or removed id is retired and never resolves again.
// - `find`/`contains_key` parity and id stability for live entries.
// - `iter` yields each live entry exactly once; key set equals the model's key set.
// - `len`/`is_empty` parity with the model after each op.
fn run_scenario<S: BuildHasher>(
    mut sut: SlotTable<Key, i32, S>,
    pool: Vec<String>,
    ops: Vec<OpI>,
) -> Result<(), TestCaseError> {
    let mut model: HashMap<Key, i32> = HashMap::new();
    let mut live: HashMap<Key, SlotId> = HashMap::new();
    let mut stale: Vec<SlotId> = Vec::new();

    for op in ops {
        match op {
            OpI::Insert(i, v) => {
                let k = key_from(&pool, i);
                let (id, replaced) = sut.insert(k.clone(), v);
                let prev_model = model.insert(k.clone(), v);
                prop_assert_eq!(replaced.map(|(_, old)| old), prev_model);
                if let Some(old_id) = live.insert(k, id) {
                    prop_assert_ne!(old_id, id, "replacement must mint a new id");
                    stale.push(old_id);
                }
            }
            OpI::RemoveId(i) => {
                let k = key_from(&pool, i);
                if let Some(id) = live.remove(&k) {
                    let (kk, vv) = sut.remove(id).expect("live id removable");
                    prop_assert!(kk == k);
                    prop_assert_eq!(Some(vv), model.remove(&k));
                    stale.push(id);
                } else {
                    prop_assert!(sut.find(&k).is_none());
                }
            }
            OpI::RemoveKey(i) => {
                let k = key_from(&pool, i);
                let removed = sut.remove_key(k.0.as_str()).map(|(_, v)| v);
                prop_assert_eq!(removed, model.remove(&k));
                if let Some(id) = live.remove(&k) {
                    stale.push(id);
                }
            }
            OpI::Find(i) => {
                let k = key_from(&pool, i);
                let s = sut.find(&k);
                prop_assert_eq!(s.is_some(), model.contains_key(&k));
                if let Some(id) = s {
                    let &lid = live.get(&k).expect("tracked live id present");
                    prop_assert_eq!(id, lid);
                    prop_assert_eq!(sut.value(id), model.get(&k));
                }
            }
            OpI::Contains(s) => {
                let has = sut.contains_key(s.as_str());
                let has_model = model.keys().any(|k| k.0 == s);
                prop_assert_eq!(has, has_model);
            }
            OpI::RetainEven => {
                let removed = sut.retain(|_, _, v| v % 2 == 0);
                for (k, v) in removed {
                    prop_assert!(v % 2 != 0);
                    prop_assert_eq!(model.remove(&k), Some(v));
                    if let Some(id) = live.remove(&k) {
                        stale.push(id);
                    }
                }
                prop_assert!(model.values().all(|v| v % 2 == 0));
            }
            OpI::Iterate => {
                let s_keys: BTreeSet<_> = sut.iter().map(|(_, k, _)| k.clone()).collect();
                let m_keys: BTreeSet<_> = model.keys().cloned().collect();
                prop_assert_eq!(s_keys, m_keys);
                prop_assert_eq!(sut.ids().len(), model.len());
            }
        }

        // Post-conditions after each op
        // 1) Retired ids must not resolve
        for &id in &stale {
            prop_assert!(sut.get(id).is_none());
        }
        // 2) Size parity
        prop_assert_eq!(sut.len(), model.len());
        prop_assert_eq!(sut.is_empty(), model.is_empty());
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine((pool, ops) in arb_scenario()) {
        run_scenario(SlotTable::new(), pool, ops)?;
    }
}

// Collision variant using a constant hasher to stress equality resolution.
#[derive(Clone, Default)]
struct ConstBuildHasher;
struct ConstHasher;
impl BuildHasher for ConstBuildHasher {
    type Hasher = ConstHasher;
    fn build_hasher(&self) -> Self::Hasher {
        ConstHasher
    }
}
impl Hasher for ConstHasher {
    fn write(&mut self, _bytes: &[u8]) {}
    fn finish(&self) -> u64 {
        0
    }
}

// Property: same invariants under worst-case collision behavior.
proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine_with_collisions((pool, ops) in arb_scenario()) {
        run_scenario(SlotTable::with_hasher(ConstBuildHasher), pool, ops)?;
    }
}
