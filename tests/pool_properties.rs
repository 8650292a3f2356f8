use proptest::prelude::*;
use stampede::pool::{Acquire, Pool, Reset, SlotId};

const CAPACITY: usize = 16;

#[derive(Default)]
struct Buffer {
    uses: u32,
}

impl Reset for Buffer {
    fn reset(&mut self) {
        self.uses = 0;
    }
}

#[derive(Clone, Debug)]
enum Op {
    Acquire,
    /// Releases the n-th held slot, modulo how many are held.
    Release(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![Just(Op::Acquire), any::<usize>().prop_map(Op::Release)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn outstanding_never_exceeds_capacity(ops in prop::collection::vec(op(), 10_000)) {
        let mut pool = Pool::new(CAPACITY, |_| Buffer::default());
        let mut held: Vec<SlotId> = Vec::new();

        for op in ops {
            match op {
                Op::Acquire => match pool.acquire() {
                    Acquire::Acquired(slot) => {
                        prop_assert!(!held.contains(&slot));
                        let buffer = pool.get_mut(slot).unwrap();
                        prop_assert_eq!(buffer.uses, 0);
                        buffer.uses += 1;
                        held.push(slot);
                    }
                    Acquire::Exhausted => prop_assert_eq!(held.len(), CAPACITY),
                },
                Op::Release(n) => {
                    if held.is_empty() {
                        continue;
                    }
                    let slot = held.swap_remove(n % held.len());
                    prop_assert!(pool.release(slot).is_ok());
                }
            }
            prop_assert!(pool.outstanding() <= CAPACITY);
            prop_assert_eq!(pool.outstanding(), held.len());
            prop_assert!(pool.max_used() <= CAPACITY);
        }
    }

    #[test]
    fn releasing_twice_always_fails(picks in prop::collection::vec(0..CAPACITY, 1..64)) {
        let mut pool = Pool::new(CAPACITY, |_| Buffer::default());
        let slots: Vec<SlotId> = (0..CAPACITY).filter_map(|_| pool.acquire().slot()).collect();
        for pick in picks {
            let slot = slots[pick];
            if pool.is_acquired(slot) {
                prop_assert!(pool.release(slot).is_ok());
            } else {
                prop_assert!(pool.release(slot).is_err());
            }
        }
    }
}
