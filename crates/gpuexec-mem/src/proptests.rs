use std::collections::HashMap;

use crate::{
    align_down, align_up, FragmentPosition, FragmentStorage, HostPtrEntryKey, HostPtrManager,
    OverlapStatus, PAGE_SIZE,
};
use proptest::prelude::*;

const PAGE: u64 = PAGE_SIZE as u64;
const MAX_RANGE: usize = 16 * PAGE_SIZE;

fn host_ptr_strategy() -> impl Strategy<Value = u64> {
    prop_oneof![
        // Page aligned.
        (1u64..1024).prop_map(|page| page * PAGE),
        // Page plus a small offset, to hit the edge classifications.
        (1u64..1024, 1u64..PAGE).prop_map(|(page, delta)| page * PAGE + delta),
    ]
}

fn size_strategy() -> impl Strategy<Value = usize> {
    prop_oneof![
        1usize..=MAX_RANGE,
        (1usize..=16).prop_map(|pages| pages * PAGE_SIZE),
        (1usize..=16).prop_map(|pages| pages * PAGE_SIZE - 1),
    ]
}

#[derive(Debug, Clone)]
enum Op {
    Store { slot: u8 },
    Release { slot: u8 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..6).prop_map(|slot| Op::Store { slot }),
        (0u8..6).prop_map(|slot| Op::Release { slot }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

    #[test]
    fn decomposition_covers_range_with_contiguous_fragments(ptr in host_ptr_strategy(), size in size_strategy()) {
        let reqs = HostPtrManager::get_allocation_requirements(0, ptr, size);
        let expected_total = align_up(size as u64 + ptr % PAGE, PAGE);
        prop_assert_eq!(reqs.total_required_size as u64, expected_total);

        let fragments: Vec<_> = reqs.iter().copied().collect();
        prop_assert!(!fragments.is_empty() && fragments.len() <= 3);
        prop_assert_eq!(fragments.iter().map(|f| f.size as u64).sum::<u64>(), expected_total);

        // Packed from slot zero.
        prop_assert_eq!(reqs.required_fragments_count(), fragments.len());
        prop_assert!(reqs.fragments[..fragments.len()].iter().all(Option::is_some));

        prop_assert_eq!(fragments[0].ptr, align_down(ptr, PAGE));
        for pair in fragments.windows(2) {
            prop_assert_eq!(pair[0].ptr + pair[0].size as u64, pair[1].ptr);
            prop_assert_ne!(pair[0].position, pair[1].position);
        }
        for f in &fragments {
            prop_assert_eq!(f.ptr % PAGE, 0);
            prop_assert_eq!(f.size as u64 % PAGE, 0);
            if matches!(f.position, FragmentPosition::Leading | FragmentPosition::Trailing) {
                prop_assert_eq!(f.size, PAGE_SIZE);
            }
        }

        let last = fragments[fragments.len() - 1];
        prop_assert!(last.ptr + last.size as u64 >= ptr + size as u64);

        let leading = ptr % PAGE != 0;
        prop_assert_eq!(fragments[0].position == FragmentPosition::Leading, leading);
        let end = ptr + size as u64;
        let trailing = end % PAGE != 0 && align_down(end, PAGE) != align_down(ptr, PAGE);
        prop_assert_eq!(last.position == FragmentPosition::Trailing, trailing);
    }

    #[test]
    fn overlap_status_matches_interval_arithmetic(
        stored_page in 16u64..64,
        stored_pages in 1u64..8,
        query_ptr in (0u64..96 * PAGE),
        query_size in 1usize..(16 * PAGE_SIZE),
    ) {
        let hpm = HostPtrManager::new();
        let stored_ptr = stored_page * PAGE;
        let stored_size = (stored_pages * PAGE) as usize;
        hpm.store_fragment(0, FragmentStorage::new(stored_ptr, stored_size));

        let (found, status) = hpm.get_fragment_and_check_for_overlaps(0, query_ptr, query_size);

        let stored_end = stored_ptr + stored_size as u64;
        let query_end = query_ptr + query_size as u64;
        let contains = stored_ptr <= query_ptr && query_end <= stored_end;
        let touches = query_ptr < stored_end && stored_ptr < query_end;
        let expected = if contains && stored_ptr == query_ptr && stored_size == query_size {
            OverlapStatus::ExactSize
        } else if contains {
            OverlapStatus::Within
        } else if touches {
            OverlapStatus::OverlappingAndBigger
        } else {
            OverlapStatus::NotOverlapping
        };
        prop_assert_eq!(status, expected);
        prop_assert_eq!(found.is_some(), contains);
    }

    #[test]
    fn reference_counts_follow_a_model(ops in proptest::collection::vec(op_strategy(), 1..64)) {
        let hpm = HostPtrManager::new();
        let mut model: HashMap<u64, i32> = HashMap::new();

        for op in ops {
            match op {
                Op::Store { slot } => {
                    let ptr = (u64::from(slot) + 1) * PAGE;
                    hpm.store_fragment(0, FragmentStorage::new(ptr, PAGE_SIZE));
                    *model.entry(ptr).or_insert(0) += 1;
                }
                Op::Release { slot } => {
                    let ptr = (u64::from(slot) + 1) * PAGE;
                    let freed = hpm.release_host_ptr(0, ptr);
                    let expected = match model.get_mut(&ptr) {
                        Some(count) => {
                            *count -= 1;
                            *count == 0
                        }
                        None => false,
                    };
                    if expected {
                        model.remove(&ptr);
                    }
                    prop_assert_eq!(freed, expected);
                }
            }
        }

        prop_assert_eq!(hpm.get_fragment_count(), model.len());
        for (ptr, count) in model {
            let stored = hpm.get_fragment(HostPtrEntryKey::new(0, ptr));
            prop_assert_eq!(stored.map(|f| f.ref_count), Some(count));
        }
    }
}
