//! Property 2: Z-order permutation
//!
//! After any sequence of acquire, restack and release operations, the
//! z-order holds each occupied layer exactly once over `[0, count)` and
//! every layer's stored depth matches its position.

use kpio_compositor::{BufferPool, HeapAllocator, LayerHandle, LayerManager, PixelFormat};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Acquire,
    Restack { pick: usize, z: usize },
    Release { pick: usize },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Acquire),
        4 => (0usize..16, 0usize..20).prop_map(|(pick, z)| Op::Restack { pick, z }),
        1 => (0usize..16).prop_map(|pick| Op::Release { pick }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn z_order_stays_a_permutation(
        capacity in 1usize..12,
        ops in prop::collection::vec(arb_op(), 1..64),
    ) {
        let pool = BufferPool::new(Box::new(HeapAllocator::new(1 << 16)), 1 << 16, 2);
        let mut m = LayerManager::new(capacity, 8, PixelFormat::Packed4, pool);
        let mut live: Vec<LayerHandle> = Vec::new();

        for op in ops {
            match op {
                Op::Acquire => match m.acquire() {
                    Some(h) => {
                        prop_assert_eq!(m.get(h).unwrap().z(), live.len());
                        live.push(h);
                    }
                    None => prop_assert_eq!(live.len(), capacity),
                },
                Op::Restack { pick, z } if !live.is_empty() => {
                    let h = live[pick % live.len()];
                    let before: Vec<LayerHandle> = m.z_order().to_vec();
                    m.set_z_order(h, z).unwrap();
                    prop_assert_eq!(m.get(h).unwrap().z(), z.min(live.len() - 1));

                    // Everyone else keeps their relative order
                    let others_before: Vec<_> = before.iter().filter(|&&o| o != h).collect();
                    let others_after: Vec<_> = m.z_order().iter().filter(|&&o| o != h).collect();
                    prop_assert_eq!(others_before, others_after);
                }
                Op::Release { pick } if !live.is_empty() => {
                    let h = live.remove(pick % live.len());
                    m.release(h).unwrap();
                    prop_assert!(m.get(h).is_err());
                }
                _ => {}
            }

            prop_assert!(m.check_z_order());
            prop_assert_eq!(m.count(), live.len());
            for (z, h) in m.z_order().iter().enumerate() {
                prop_assert_eq!(m.get(*h).unwrap().z(), z);
                prop_assert!(live.contains(h));
            }
        }
    }
}
