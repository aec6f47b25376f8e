//! Active segment builder.
//!
//! Accumulates table slices (already serialized, so the size bound is
//! exact) until the store seals the segment. Builders are
//! layout-polymorphic: slices of different layouts share a segment.

use std::sync::Arc;

use uuid::Uuid;

use super::{Chunk, Segment};
use crate::bitmap::Bitmap;
use crate::error::Result;
use crate::slice::TableSlice;

pub struct SegmentBuilder {
    id: Uuid,
    slices: Vec<(Arc<TableSlice>, Vec<u8>)>,
    bytes: u64,
}

impl SegmentBuilder {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            slices: Vec::new(),
            bytes: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Serialized size of the accumulated slices.
    pub fn size(&self) -> u64 {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Append a slice to the active segment.
    pub fn add(&mut self, slice: Arc<TableSlice>) -> Result<()> {
        let blob = slice.encoded()?;
        self.bytes += blob.len() as u64;
        self.slices.push((slice, blob));
        Ok(())
    }

    /// Bitmap of every event ID currently in the builder.
    pub fn ids(&self) -> Bitmap {
        let mut bm = Bitmap::new();
        for (slice, _) in &self.slices {
            let (lo, hi) = slice.id_range();
            bm.pad_to(lo);
            bm.append_bits(true, hi - lo);
        }
        bm
    }

    /// The accumulated slices whose ID range intersects `ids`.
    pub fn lookup(&self, ids: &Bitmap) -> Vec<Arc<TableSlice>> {
        self.slices
            .iter()
            .filter(|(slice, _)| {
                let (lo, hi) = slice.id_range();
                ids.any_in(lo, hi)
            })
            .map(|(slice, _)| slice.clone())
            .collect()
    }

    /// Seal the accumulated slices into an immutable segment and reset
    /// the builder under a fresh UUID.
    pub fn finish(&mut self) -> Result<Segment> {
        let id = self.id;
        let slices = std::mem::take(&mut self.slices);
        self.bytes = 0;
        self.id = Uuid::new_v4();
        let image = Segment::encode(id, &slices)?;
        Segment::from_chunk(Chunk::from_bytes(image))
    }

    /// Discard the accumulated slices and adopt a fresh UUID.
    pub fn reset(&mut self) {
        self.slices.clear();
        self.bytes = 0;
        self.id = Uuid::new_v4();
    }
}

impl Default for SegmentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// -- Tests ----------------------------------------------------------------
