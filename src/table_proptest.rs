#![cfg(test)]

// Property tests for InFlightTable kept inside the crate so they do not
// require feature gates to access internal modules.

use crate::table::{InFlightTable, InsertError, Slot};
use proptest::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::hash::{BuildHasher, Hasher};

// Key newtype with Borrow<str> to exercise borrowed lookup.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
struct Key(String);
impl std::borrow::Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// Pool-indexed operations so indices shrink toward earlier keys.
#[derive(Clone, Debug)]
enum Op {
    Insert(usize, u8),
    Remove(usize),
    RemoveStale(usize),
    Find(usize),
    Contains(String),
    Append(usize, u8),
    Keys,
}

fn arb_scenario() -> impl Strategy<Value = (Vec<String>, Vec<Op>)> {
    proptest::collection::vec("[a-z]{0,4}", 1..=6).prop_flat_map(|pool| {
        let idxs: Vec<usize> = (0..pool.len()).collect();
        let idx = proptest::sample::select(idxs);
        let contains_pool = proptest::sample::select(pool.clone());
        let op = prop_oneof![
            (idx.clone(), any::<u8>()).prop_map(|(i, v)| Op::Insert(i, v)),
            idx.clone().prop_map(Op::Remove),
            any::<usize>().prop_map(Op::RemoveStale),
            idx.clone().prop_map(Op::Find),
            prop_oneof![contains_pool, "[a-z]{0,4}"].prop_map(Op::Contains),
            (idx.clone(), any::<u8>()).prop_map(|(i, v)| Op::Append(i, v)),
            Just(Op::Keys),
        ];
        proptest::collection::vec(op, 1..60).prop_map(move |ops| (pool.clone(), ops))
    })
}

// State-machine equivalence against std HashMap. Values are append-only
// lists, the shape the controller keeps its waiters in.
// - insert_with runs `make` only on success and hands it the final slot.
// - find/contains_key parity; live slots stay stable until removed.
// - remove returns the model's (key, value) and retires the slot for good.
// - stale slots never resolve, never remove anything, including after the
//   same key is inserted again.
fn run_scenario<S: BuildHasher>(
    mut sut: InFlightTable<Key, Vec<u8>, S>,
    pool: Vec<String>,
    ops: Vec<Op>,
) -> Result<(), TestCaseError> {
    let mut model: HashMap<Key, Vec<u8>> = HashMap::new();
    let mut live: HashMap<Key, Slot> = HashMap::new();
    let mut stale: Vec<Slot> = Vec::new();

    for op in ops {
        match op {
            Op::Insert(i, v) => {
                let k = Key(pool[i].clone());
                let already = model.contains_key(&k);
                let mut seen = None;
                match sut.insert_with(k.clone(), |slot| {
                    seen = Some(slot);
                    vec![v]
                }) {
                    Ok(slot) => {
                        prop_assert!(!already, "insert must fail on duplicate");
                        prop_assert_eq!(seen, Some(slot), "make sees the final slot");
                        prop_assert!(live.insert(k.clone(), slot).is_none());
                        model.insert(k, vec![v]);
                    }
                    Err(InsertError::DuplicateKey(existing)) => {
                        prop_assert!(already, "duplicate error only when key exists");
                        prop_assert!(seen.is_none(), "make must not run on duplicate");
                        prop_assert_eq!(Some(&existing), live.get(&k));
                    }
                }
            }
            Op::Remove(i) => {
                let k = Key(pool[i].clone());
                if let Some(slot) = live.remove(&k) {
                    let (kk, vv) = sut.remove(slot).expect("live slot removable");
                    prop_assert_eq!(&kk, &k);
                    prop_assert_eq!(Some(vv), model.remove(&k));
                    stale.push(slot);
                } else {
                    prop_assert!(sut.find(&k).is_none());
                }
            }
            Op::RemoveStale(n) => {
                if !stale.is_empty() {
                    let slot = stale[n % stale.len()];
                    prop_assert!(sut.remove(slot).is_none());
                }
            }
            Op::Find(i) => {
                let k = Key(pool[i].clone());
                let found = sut.find(&k);
                prop_assert_eq!(found.is_some(), model.contains_key(&k));
                prop_assert_eq!(found.as_ref(), live.get(&k));
            }
            Op::Contains(s) => {
                let has_model = model.keys().any(|k| k.0 == s);
                prop_assert_eq!(sut.contains_key(s.as_str()), has_model);
            }
            Op::Append(i, v) => {
                let k = Key(pool[i].clone());
                match sut.find_mut(&k) {
                    Some((slot, list)) => {
                        prop_assert_eq!(Some(&slot), live.get(&k));
                        list.push(v);
                        model.get_mut(&k).expect("model has live key").push(v);
                    }
                    None => prop_assert!(!model.contains_key(&k)),
                }
            }
            Op::Keys => {
                let s_keys: BTreeSet<_> = sut.keys().cloned().collect();
                let m_keys: BTreeSet<_> = model.keys().cloned().collect();
                prop_assert_eq!(s_keys, m_keys);
            }
        }

        for &slot in &stale {
            prop_assert!(sut.get(slot).is_none());
        }
        for (k, &slot) in &live {
            prop_assert_eq!(sut.get(slot), model.get(k));
        }
        prop_assert_eq!(sut.len(), model.len());
        prop_assert_eq!(sut.is_empty(), model.is_empty());
    }
    Ok(())
}

// Constant hasher: every key collides, so equality alone resolves lookups.
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

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

    #[test]
    fn prop_state_machine((pool, ops) in arb_scenario()) {
        run_scenario(InFlightTable::new(), pool, ops)?;
    }

    #[test]
    fn prop_state_machine_with_collisions((pool, ops) in arb_scenario()) {
        run_scenario(InFlightTable::with_hasher(ConstBuildHasher), pool, ops)?;
    }
}
