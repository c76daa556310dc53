use std::collections::HashMap;

use proptest::prelude::*;
use proptest_derive::Arbitrary;

use crate::{FixedBlockKey, FixedBlockMap};

/// Keys are drawn from a small universe so sequences revisit, overwrite,
/// and resurrect the same keys.
const KEY_SPACE: usize = 64;

fn key_for(index: usize) -> FixedBlockKey {
    FixedBlockKey::from_string(&format!("prop:{}", index))
}

/// Actions to test against both implementations
#[derive(Arbitrary, Debug, Clone)]
enum Action {
    Put(#[proptest(strategy = "0..KEY_SPACE")] usize, u64),
    Get(#[proptest(strategy = "0..KEY_SPACE")] usize),
    Delete(#[proptest(strategy = "0..KEY_SPACE")] usize),
    Rehash,
    Grow(#[proptest(strategy = "0..512usize")] usize),
}

/// Test harness that executes actions on the map and a HashMap model.
struct Test {
    map: FixedBlockMap<u64>,
    model: HashMap<FixedBlockKey, u64>,
}

impl Test {
    fn new() -> Self {
        // sized so the 64-key universe can never exhaust the table
        Self {
            map: FixedBlockMap::new(256),
            model: HashMap::new(),
        }
    }

    fn execute(&mut self, action: Action) {
        match action {
            Action::Put(index, value) => {
                let key = key_for(index);
                self.map.put(key, value).expect("put with headroom failed");
                self.model.insert(key, value);
            }
            Action::Get(index) => {
                let key = key_for(index);
                assert_eq!(
                    self.map.get(key),
                    self.model.get(&key),
                    "get mismatch for key index {}",
                    index
                );
            }
            Action::Delete(index) => {
                let key = key_for(index);
                self.map.delete(key);
                self.model.remove(&key);
            }
            Action::Rehash => {
                self.map.rehash().expect("rehash with headroom failed");
            }
            Action::Grow(extra) => {
                let target = self.map.capacity() + extra;
                self.map.grow(target).expect("grow failed");
                assert!(self.map.capacity() >= target);
            }
        }

        assert_eq!(
            self.map.iter().count(),
            self.model.len(),
            "live entry count diverged from model"
        );
    }

    fn check_full_agreement(&self) {
        for (key, value) in &self.model {
            assert_eq!(self.map.get(*key), Some(value));
        }
        for (key, value) in self.map.iter() {
            assert_eq!(self.model.get(&key), Some(value));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        failure_persistence: None,
        ..ProptestConfig::default()
    })]

    #[test]
    fn proptest_vs_hashmap(actions in prop::collection::vec(any::<Action>(), 1..48)) {
        let mut test = Test::new();
        for action in actions {
            test.execute(action);
        }
        test.check_full_agreement();
    }

    #[test]
    fn proptest_snapshot_roundtrip(actions in prop::collection::vec(any::<Action>(), 1..32)) {
        let mut test = Test::new();
        for action in actions {
            test.execute(action);
        }

        let mut buf = Vec::new();
        let written = test.map.write_to(&mut buf).unwrap();
        prop_assert_eq!(written, buf.len());

        let mut restored: FixedBlockMap<u64> = FixedBlockMap::new(test.map.capacity());
        let read = restored.read_from(&mut buf.as_slice()).unwrap();
        prop_assert_eq!(read, written);

        for (key, value) in &test.model {
            prop_assert_eq!(restored.get(*key), Some(value));
        }
        prop_assert_eq!(restored.iter().count(), test.model.len());
    }
}
