//! Property-Based Tests for the Segment Map
//!
//! A sequence of cache operations is replayed against both a
//! [`CachedObject`] and a flat byte model.
//!
//! # Test Properties
//!
//! 1. **Content**: cached bytes always equal the model
//! 2. **Disjointness**: segments never overlap and are never empty
//! 3. **Accounting**: byte counters equal the sum of segment lengths per state
//! 4. **Durability**: eviction never drops dirty or flushing bytes
//! 5. **Coalescing**: touching segments never share a state

#![cfg(test)]

use std::time::Instant;

use bytes::Bytes;
use proptest::prelude::*;

use super::object::CachedObject;
use super::segment::{ByteAccounting, SegmentState};
use crate::types::Tid;

const SPAN: u64 = 256;

#[derive(Debug, Clone)]
enum Step {
    Write { offset: u64, data: Vec<u8> },
    Fill { offset: u64, length: u64 },
    Flush { ok: bool },
    Discard { offset: u64, length: u64 },
    EvictAll,
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (0..SPAN, prop::collection::vec(any::<u8>(), 1..48))
            .prop_map(|(offset, data)| Step::Write { offset, data }),
        2 => (0..SPAN, 1u64..64).prop_map(|(offset, length)| Step::Fill { offset, length }),
        2 => any::<bool>().prop_map(|ok| Step::Flush { ok }),
        1 => (0..SPAN, 1u64..64).prop_map(|(offset, length)| Step::Discard { offset, length }),
        1 => Just(Step::EvictAll),
    ]
}

/// Flat model: `None` means "not cached".
struct Model {
    bytes: Vec<Option<u8>>,
    /// Backing store the reads fill from
    backing: Vec<u8>,
}

impl Model {
    fn new() -> Self {
        let size = (SPAN + 64) as usize;
        Self {
            bytes: vec![None; size],
            backing: (0..size).map(|i| (i % 251) as u8).collect(),
        }
    }
}

fn check(obj: &mut CachedObject, model: &Model, acct: &ByteAccounting) -> Result<(), TestCaseError> {
    let segments = obj.segment_info();
    let mut last_end = 0;
    let (mut clean, mut dirty, mut flushing) = (0, 0, 0);
    for pair in segments.windows(2) {
        let touching = pair[0].offset + pair[0].length == pair[1].offset;
        prop_assert!(
            !(touching && pair[0].state == pair[1].state),
            "uncoalesced {:?} segments at {}",
            pair[1].state,
            pair[1].offset
        );
    }
    for seg in &segments {
        prop_assert!(seg.length > 0);
        prop_assert!(seg.offset >= last_end, "overlap at {}", seg.offset);
        last_end = seg.offset + seg.length;
        match seg.state {
            SegmentState::Clean => clean += seg.length,
            SegmentState::Dirty => dirty += seg.length,
            SegmentState::Flushing(_) => flushing += seg.length,
            SegmentState::Reading(_) => {}
        }
    }
    prop_assert_eq!(acct.clean(), clean);
    prop_assert_eq!(acct.dirty(), dirty);
    prop_assert_eq!(acct.flushing(), flushing);

    let lookup = obj.lookup(0, model.bytes.len() as u64, Instant::now());
    for (start, data) in lookup.hits {
        for (i, byte) in data.iter().enumerate() {
            prop_assert_eq!(model.bytes[start as usize + i], Some(*byte));
        }
    }
    for (start, len) in lookup.missing {
        for i in start..start + len {
            prop_assert_eq!(model.bytes[i as usize], None);
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: the segment map agrees with the model after every step.
    #[test]
    fn prop_segment_map_matches_model(steps in prop::collection::vec(step_strategy(), 1..40)) {
        let acct = ByteAccounting::default();
        let mut obj = CachedObject::new();
        let mut model = Model::new();
        let mut next_tid = 1;
        let now = Instant::now();

        for step in steps {
            match step {
                Step::Write { offset, data } => {
                    for (i, b) in data.iter().enumerate() {
                        model.bytes[offset as usize + i] = Some(*b);
                    }
                    obj.write(offset, Bytes::from(data), now, &acct);
                }
                Step::Fill { offset, length } => {
                    let lookup = obj.lookup(offset, length, now);
                    for (start, len) in lookup.missing {
                        let tid = Tid(next_tid);
                        next_tid += 1;
                        let _rx = obj.begin_read(start, len, tid, now, &acct);
                        let from = start as usize;
                        let to = (start + len) as usize;
                        let data = Bytes::copy_from_slice(&model.backing[from..to]);
                        for i in from..to {
                            model.bytes[i] = Some(model.backing[i]);
                        }
                        obj.complete_read(tid, Ok(data), now, &acct);
                    }
                }
                Step::Flush { ok } => {
                    for (offset, _) in obj.dirty_extents() {
                        let tid = Tid(next_tid);
                        next_tid += 1;
                        let _rx = obj.begin_flush(offset, tid, &acct);
                        let result = if ok {
                            Ok(())
                        } else {
                            Err(crate::error::Error::Transport("down".into()))
                        };
                        obj.complete_flush(tid, result, &acct);
                    }
                }
                Step::Discard { offset, length } => {
                    obj.carve(offset, offset + length, &acct);
                    for i in offset..(offset + length).min(model.bytes.len() as u64) {
                        model.bytes[i as usize] = None;
                    }
                }
                Step::EvictAll => {
                    let dirty_before = acct.dirty();
                    for (offset, _) in obj.clean_segments() {
                        let start = offset as usize;
                        let len = obj.evict_clean(offset, &acct) as usize;
                        for byte in &mut model.bytes[start..start + len] {
                            *byte = None;
                        }
                    }
                    prop_assert_eq!(acct.dirty(), dirty_before);
                    prop_assert_eq!(acct.clean(), 0);
                }
            }
            check(&mut obj, &model, &acct)?;
        }
    }
}
