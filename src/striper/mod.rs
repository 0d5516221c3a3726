//! Striper - Extent Mapping
//!
//! Stateless arithmetic that maps a logical byte range of a striped file onto
//! the backend objects holding it, and gathers per-object results back into
//! a linear buffer.
//!
//! # Layout
//!
//! ```text
//! stripe_count = 4, stripe_unit = u, object_size = 2u
//!
//!            obj 0   obj 1   obj 2   obj 3   │ obj 4   obj 5 ...
//! stripe 0   [ 0 ]   [ 1 ]   [ 2 ]   [ 3 ]   │
//! stripe 1   [ 4 ]   [ 5 ]   [ 6 ]   [ 7 ]   │
//! stripe 2                                   │ [ 8 ]   [ 9 ] ...
//!            └────── object set 0 ──────┘      └── object set 1
//! ```
//!
//! Each `[n]` is one stripe unit of logical data.

#[cfg(test)]
mod proptest;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::ObjectId;

// =============================================================================
// Layout
// =============================================================================

/// Striping parameters of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripeLayout {
    /// Bytes written to one object before moving to the next
    pub stripe_unit: u64,
    /// Number of objects a stripe is spread across
    pub stripe_count: u64,
    /// Maximum size of a backing object
    pub object_size: u64,
}

impl StripeLayout {
    pub const fn new(stripe_unit: u64, stripe_count: u64, object_size: u64) -> Self {
        Self {
            stripe_unit,
            stripe_count,
            object_size,
        }
    }

    /// Validate the layout
    pub fn validate(&self) -> Result<()> {
        if self.stripe_unit == 0 {
            return Err(Error::InvalidLayout("stripe_unit must be > 0".into()));
        }
        if self.stripe_count == 0 {
            return Err(Error::InvalidLayout("stripe_count must be > 0".into()));
        }
        if self.object_size < self.stripe_unit {
            return Err(Error::InvalidLayout(
                "object_size must be >= stripe_unit".into(),
            ));
        }
        if self.object_size % self.stripe_unit != 0 {
            return Err(Error::InvalidLayout(
                "object_size must be a multiple of stripe_unit".into(),
            ));
        }
        Ok(())
    }

    /// Stripe units held by one object.
    pub fn stripes_per_object(&self) -> u64 {
        self.object_size / self.stripe_unit
    }

    /// Logical bytes covered by one full object set.
    pub fn object_set_size(&self) -> u64 {
        self.object_size * self.stripe_count
    }

    /// Locate logical offset `x`: `(object_no, offset within object)`.
    pub fn locate(&self, x: u64) -> (u64, u64) {
        let block = x / self.stripe_unit;
        let stripe_no = block / self.stripe_count;
        let stripe_pos = block % self.stripe_count;
        let per_object = self.stripes_per_object();
        let object_set = stripe_no / per_object;
        let object_no = object_set * self.stripe_count + stripe_pos;
        let block_start = (stripe_no % per_object) * self.stripe_unit;
        (object_no, block_start + x % self.stripe_unit)
    }
}

/// Backend object name for object `object_no` of a striped file.
pub fn object_name(prefix: &str, object_no: u64) -> ObjectId {
    ObjectId::new(format!("{}.{:08x}", prefix, object_no))
}

// =============================================================================
// Extents
// =============================================================================

/// One contiguous piece of a logical range inside one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extent {
    pub object_no: u64,
    pub oid: ObjectId,
    /// Offset within the object
    pub offset: u64,
    pub length: u64,
    /// Offset within the logical range this extent came from
    pub buffer_offset: u64,
}

/// A piece of the caller's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferExtent {
    pub buffer_offset: u64,
    pub length: u64,
}

/// A contiguous object range together with the buffer pieces it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectExtent {
    pub object_no: u64,
    pub oid: ObjectId,
    pub offset: u64,
    pub length: u64,
    /// Buffer pieces in object order; their lengths sum to `length`
    pub buffer_extents: Vec<BufferExtent>,
}

impl ObjectExtent {
    /// Object offset one past the end of this extent.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Collect this extent's bytes out of the caller's buffer.
    pub fn gather(&self, buf: &Bytes) -> Bytes {
        if let [only] = self.buffer_extents.as_slice() {
            let start = only.buffer_offset as usize;
            return buf.slice(start..start + only.length as usize);
        }
        let mut out = BytesMut::with_capacity(self.length as usize);
        for be in &self.buffer_extents {
            let start = be.buffer_offset as usize;
            out.extend_from_slice(&buf[start..start + be.length as usize]);
        }
        out.freeze()
    }

    /// Split object data read for this extent into buffer-tagged parts.
    ///
    /// `data` must hold exactly `self.length` bytes.
    pub fn scatter(&self, data: &Bytes) -> Vec<(u64, Bytes)> {
        let mut parts = Vec::with_capacity(self.buffer_extents.len());
        let mut cursor = 0usize;
        for be in &self.buffer_extents {
            let len = be.length as usize;
            parts.push((be.buffer_offset, data.slice(cursor..cursor + len)));
            cursor += len;
        }
        parts
    }
}

/// Map `[offset, offset + length)` onto per-object extents, one per stripe
/// unit piece, in ascending logical order.
pub fn map_extents(
    prefix: &str,
    layout: &StripeLayout,
    offset: u64,
    length: u64,
) -> Result<Vec<Extent>> {
    layout.validate()?;
    let end = offset
        .checked_add(length)
        .ok_or_else(|| Error::InvalidLayout(format!("range {}+{} overflows", offset, length)))?;

    let mut extents = Vec::new();
    let mut cursor = offset;
    while cursor < end {
        let (object_no, object_off) = layout.locate(cursor);
        let unit_left = layout.stripe_unit - cursor % layout.stripe_unit;
        let take = unit_left.min(end - cursor);
        extents.push(Extent {
            object_no,
            oid: object_name(prefix, object_no),
            offset: object_off,
            length: take,
            buffer_offset: cursor - offset,
        });
        cursor += take;
    }
    Ok(extents)
}

/// Merge extents that continue each other inside the same object.
///
/// The result is ordered by first appearance in `extents`; two pieces of one
/// object that are not adjacent in object space stay separate.
pub fn group_by_object(extents: &[Extent]) -> Vec<ObjectExtent> {
    let mut grouped: Vec<ObjectExtent> = Vec::new();
    let mut last_for_object = std::collections::HashMap::new();

    for ex in extents {
        if let Some(&idx) = last_for_object.get(&ex.object_no) {
            let current: &mut ObjectExtent = &mut grouped[idx];
            if current.end() == ex.offset {
                current.length += ex.length;
                match current.buffer_extents.last_mut() {
                    Some(be) if be.buffer_offset + be.length == ex.buffer_offset => {
                        be.length += ex.length;
                    }
                    _ => current.buffer_extents.push(BufferExtent {
                        buffer_offset: ex.buffer_offset,
                        length: ex.length,
                    }),
                }
                continue;
            }
        }
        last_for_object.insert(ex.object_no, grouped.len());
        grouped.push(ObjectExtent {
            object_no: ex.object_no,
            oid: ex.oid.clone(),
            offset: ex.offset,
            length: ex.length,
            buffer_extents: vec![BufferExtent {
                buffer_offset: ex.buffer_offset,
                length: ex.length,
            }],
        });
    }
    grouped
}

/// Map a logical range straight to merged per-object extents.
pub fn file_to_extents(
    prefix: &str,
    layout: &StripeLayout,
    offset: u64,
    length: u64,
) -> Result<Vec<ObjectExtent>> {
    Ok(group_by_object(&map_extents(prefix, layout, offset, length)?))
}

// =============================================================================
// Inverse
// =============================================================================

/// Reassemble `[offset, offset + length)` from parts tagged with their
/// logical offset. Every byte must be covered by exactly one part.
pub fn assemble<I>(offset: u64, length: u64, parts: I) -> Result<Bytes>
where
    I: IntoIterator<Item = (u64, Bytes)>,
{
    let mut parts: Vec<(u64, Bytes)> = parts.into_iter().filter(|(_, b)| !b.is_empty()).collect();
    parts.sort_by_key(|(off, _)| *off);
    let end = offset + length;

    if let [(start, only)] = parts.as_slice() {
        if *start == offset && only.len() as u64 == length {
            return Ok(only.clone());
        }
    }

    let mut out = BytesMut::with_capacity(length as usize);
    let mut cursor = offset;
    for (start, data) in parts {
        let part_end = start + data.len() as u64;
        if start < cursor {
            return Err(Error::gap(
                offset,
                length,
                format!("part at {} overlaps data ending at {}", start, cursor),
            ));
        }
        if start > cursor {
            return Err(Error::gap(
                offset,
                length,
                format!("missing {} bytes at {}", start - cursor, cursor),
            ));
        }
        if part_end > end {
            return Err(Error::gap(
                offset,
                length,
                format!("part at {} runs {} bytes past the range", start, part_end - end),
            ));
        }
        out.extend_from_slice(&data);
        cursor = part_end;
    }

    if cursor != end {
        return Err(Error::gap(
            offset,
            length,
            format!("missing {} bytes at {}", end - cursor, cursor),
        ));
    }
    Ok(out.freeze())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const MIB: u64 = 1024 * 1024;

    fn triples(extents: &[Extent]) -> Vec<(u64, u64, u64)> {
        extents
            .iter()
            .map(|e| (e.object_no, e.offset, e.length))
            .collect()
    }

    #[test]
    fn test_write_10000_at_12000() {
        let layout = StripeLayout::new(4096, 4, 4 * MIB);
        let extents = map_extents("10000000000", &layout, 12000, 10000).unwrap();

        assert_eq!(
            triples(&extents),
            vec![(2, 3808, 288), (3, 0, 4096), (0, 4096, 4096), (1, 4096, 1520)]
        );
        assert_eq!(
            extents.iter().map(|e| e.buffer_offset).collect::<Vec<_>>(),
            vec![0, 288, 4384, 8480]
        );
        assert_eq!(extents[0].oid.as_str(), "10000000000.00000002");
    }

    #[test]
    fn test_crosses_object_set() {
        // two stripe units per object: logical unit 8 starts object set 1
        let layout = StripeLayout::new(4096, 4, 8192);
        let extents = map_extents("f", &layout, 7 * 4096 + 100, 4096).unwrap();
        assert_eq!(
            triples(&extents),
            vec![(3, 4096 + 100, 3996), (4, 0, 100)]
        );
    }

    #[test]
    fn test_single_object_layout() {
        let layout = StripeLayout::new(MIB, 1, 4 * MIB);
        let extents = map_extents("f", &layout, 3 * MIB, 2 * MIB).unwrap();
        assert_eq!(
            triples(&extents),
            vec![(0, 3 * MIB, MIB), (1, 0, MIB)]
        );
    }

    #[test]
    fn test_empty_range() {
        let layout = StripeLayout::new(4096, 4, 4 * MIB);
        assert!(map_extents("f", &layout, 500, 0).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_layouts() {
        for layout in [
            StripeLayout::new(0, 1, 4096),
            StripeLayout::new(4096, 0, 4096),
            StripeLayout::new(4096, 1, 2048),
            StripeLayout::new(4096, 1, 6144),
        ] {
            assert_matches!(map_extents("f", &layout, 0, 1), Err(Error::InvalidLayout(_)));
        }
    }

    #[test]
    fn test_group_merges_consecutive_stripes() {
        let layout = StripeLayout::new(4096, 2, 4 * MIB);
        // 4 units: obj0, obj1, obj0, obj1
        let grouped = file_to_extents("f", &layout, 0, 4 * 4096).unwrap();
        assert_eq!(grouped.len(), 2);

        assert_eq!(grouped[0].object_no, 0);
        assert_eq!((grouped[0].offset, grouped[0].length), (0, 8192));
        assert_eq!(
            grouped[0].buffer_extents,
            vec![
                BufferExtent { buffer_offset: 0, length: 4096 },
                BufferExtent { buffer_offset: 8192, length: 4096 },
            ]
        );
        assert_eq!(grouped[1].object_no, 1);
    }

    #[test]
    fn test_group_single_stripe_count_collapses() {
        let layout = StripeLayout::new(4096, 1, 4 * MIB);
        let grouped = file_to_extents("f", &layout, 100, 3 * 4096).unwrap();
        assert_eq!(grouped.len(), 1);
        assert_eq!(
            grouped[0].buffer_extents,
            vec![BufferExtent { buffer_offset: 0, length: 3 * 4096 }]
        );
    }

    #[test]
    fn test_gather_and_scatter() {
        let layout = StripeLayout::new(4, 2, 16);
        let buf = Bytes::from_static(b"aaaabbbbccccdddd");
        let grouped = file_to_extents("f", &layout, 0, 16).unwrap();

        let obj0 = grouped[0].gather(&buf);
        assert_eq!(&obj0[..], b"aaaacccc");

        let parts = grouped[0].scatter(&obj0);
        assert_eq!(parts[0], (0, Bytes::from_static(b"aaaa")));
        assert_eq!(parts[1], (8, Bytes::from_static(b"cccc")));
    }

    #[test]
    fn test_assemble_detects_gap() {
        let err = assemble(
            10,
            8,
            vec![(10, Bytes::from_static(b"abc")), (14, Bytes::from_static(b"defg"))],
        )
        .unwrap_err();
        assert_matches!(err, Error::GapError { offset: 10, length: 8, .. });
    }

    #[test]
    fn test_assemble_detects_overlap() {
        let err = assemble(
            0,
            6,
            vec![(0, Bytes::from_static(b"abcd")), (2, Bytes::from_static(b"cdef"))],
        )
        .unwrap_err();
        assert!(err.to_string().contains("overlaps"));
    }

    #[test]
    fn test_assemble_detects_short_tail_and_overrun() {
        assert_matches!(
            assemble(0, 6, vec![(0, Bytes::from_static(b"abcd"))]),
            Err(Error::GapError { .. })
        );
        assert_matches!(
            assemble(0, 3, vec![(0, Bytes::from_static(b"abcd"))]),
            Err(Error::GapError { .. })
        );
    }

    #[test]
    fn test_assemble_out_of_order_parts() {
        let out = assemble(
            100,
            6,
            vec![(103, Bytes::from_static(b"def")), (100, Bytes::from_static(b"abc"))],
        )
        .unwrap();
        assert_eq!(&out[..], b"abcdef");
    }
}
