//! Property-Based Tests for Extent Mapping
//!
//! # Test Properties
//!
//! 1. **Coverage**: extents are contiguous in logical order, never empty, and
//!    their lengths sum to the requested length
//! 2. **Consistency**: every extent agrees with `StripeLayout::locate`
//! 3. **Roundtrip**: scattering a buffer over objects and assembling the
//!    object reads gives the original bytes back
//! 4. **Object bounds**: no extent crosses the end of its object

#![cfg(test)]

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use proptest::prelude::*;

use super::{assemble, file_to_extents, map_extents, StripeLayout};

// =============================================================================
// Property Strategies
// =============================================================================

/// Valid layouts: unit 1..=64, count 1..=6, 1..=4 units per object.
fn layout_strategy() -> impl Strategy<Value = StripeLayout> {
    (1u64..=64, 1u64..=6, 1u64..=4).prop_map(|(unit, count, per_object)| {
        StripeLayout::new(unit, count, unit * per_object)
    })
}

fn range_strategy() -> impl Strategy<Value = (u64, u64)> {
    (0u64..5000, 1u64..2000)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: extents tile the range exactly, in logical order.
    #[test]
    fn prop_extents_cover_range(
        layout in layout_strategy(),
        (offset, length) in range_strategy(),
    ) {
        let extents = map_extents("f", &layout, offset, length)?;

        let mut expected_buffer_offset = 0;
        for ex in &extents {
            prop_assert!(ex.length > 0);
            prop_assert_eq!(ex.buffer_offset, expected_buffer_offset);
            expected_buffer_offset += ex.length;
        }
        prop_assert_eq!(expected_buffer_offset, length);
    }

    /// Property: each extent starts where the layout says its logical offset lives.
    #[test]
    fn prop_extents_match_locate(
        layout in layout_strategy(),
        (offset, length) in range_strategy(),
    ) {
        for ex in map_extents("f", &layout, offset, length)? {
            let (object_no, object_off) = layout.locate(offset + ex.buffer_offset);
            prop_assert_eq!(ex.object_no, object_no);
            prop_assert_eq!(ex.offset, object_off);
            prop_assert!(ex.offset + ex.length <= layout.object_size);
        }
    }

    /// Property: assemble(scatter(buffer)) == buffer.
    #[test]
    fn prop_roundtrip_through_objects(
        layout in layout_strategy(),
        offset in 0u64..3000,
        data in prop::collection::vec(any::<u8>(), 1..1500),
    ) {
        let length = data.len() as u64;
        let buf = Bytes::from(data.clone());
        let grouped = file_to_extents("f", &layout, offset, length)?;

        // write phase: lay bytes into sparse objects
        let mut objects: HashMap<u64, Vec<u8>> = HashMap::new();
        for ox in &grouped {
            let payload = ox.gather(&buf);
            let obj = objects.entry(ox.object_no).or_default();
            let end = (ox.offset + ox.length) as usize;
            if obj.len() < end {
                obj.resize(end, 0);
            }
            obj[ox.offset as usize..end].copy_from_slice(&payload);
        }

        // read phase: read each object extent back and reassemble
        let mut parts = Vec::new();
        for ox in &grouped {
            let obj = &objects[&ox.object_no];
            let mut read = BytesMut::new();
            read.extend_from_slice(&obj[ox.offset as usize..ox.end() as usize]);
            for (buffer_offset, piece) in ox.scatter(&read.freeze()) {
                parts.push((offset + buffer_offset, piece));
            }
        }

        let out = assemble(offset, length, parts)?;
        prop_assert_eq!(&out[..], &data[..]);
    }

    /// Property: grouping preserves total length and never merges across objects.
    #[test]
    fn prop_grouping_preserves_bytes(
        layout in layout_strategy(),
        (offset, length) in range_strategy(),
    ) {
        let grouped = file_to_extents("f", &layout, offset, length)?;
        let total: u64 = grouped.iter().map(|g| g.length).sum();
        prop_assert_eq!(total, length);

        for g in &grouped {
            let inner: u64 = g.buffer_extents.iter().map(|b| b.length).sum();
            prop_assert_eq!(inner, g.length);
            prop_assert!(g.end() <= layout.object_size);
        }
    }
}
