//! On-disk event segments.
//!
//! A segment is an immutable, memory-mappable blob of serialized table
//! slices plus a descriptor table. Binary layout:
//!
//! ```text
//! [magic: b"SPYG"]                  // 4 bytes
//! [version: u16 LE]                 // 2 bytes
//! [uuid: 16 bytes]
//! [meta_len: u64 LE]                // 8 bytes
//! [meta: bincode SegmentMeta]       // slice descriptors
//! [payload: serialized slices]      // descriptor (start, len) offsets
//! ```
//!
//! Chunks are reference counted and carry deletion steps that run when
//! the last reference drops; stale segment files get unlinked only after
//! every reader has released them.

pub mod builder;
pub mod store;

use std::ops::Deref;
use std::path::Path;
use std::sync::{Arc, Mutex};

use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bitmap::Bitmap;
use crate::error::{Error, Result};
use crate::slice::TableSlice;

pub use builder::SegmentBuilder;
pub use store::SegmentStore;

pub const SEGMENT_MAGIC: [u8; 4] = *b"SPYG";
pub const SEGMENT_VERSION: u16 = 1;
const HEADER_SIZE: usize = 4 + 2 + 16 + 8;

// -- Chunk ----------------------------------------------------------------

enum ChunkData {
    Owned(Vec<u8>),
    Mapped(Mmap),
}

/// A reference-counted byte blob with deletion steps run on release.
pub struct Chunk {
    data: ChunkData,
    deletion_steps: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl Chunk {
    pub fn from_bytes(bytes: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data: ChunkData::Owned(bytes),
            deletion_steps: Mutex::new(Vec::new()),
        })
    }

    /// Memory-map a file read-only.
    pub fn mmap(path: &Path) -> Result<Arc<Self>> {
        let file = std::fs::File::open(path)?;
        let map = unsafe { Mmap::map(&file) }?;
        Ok(Arc::new(Self {
            data: ChunkData::Mapped(map),
            deletion_steps: Mutex::new(Vec::new()),
        }))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self
    }

    /// Register a step to run when the last reference drops.
    pub fn add_deletion_step(&self, step: impl FnOnce() + Send + 'static) {
        self.deletion_steps
            .lock()
            .expect("deletion steps lock poisoned")
            .push(Box::new(step));
    }
}

impl Deref for Chunk {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.data {
            ChunkData::Owned(bytes) => bytes,
            ChunkData::Mapped(map) => map,
        }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        let steps = std::mem::take(
            &mut *self
                .deletion_steps
                .lock()
                .expect("deletion steps lock poisoned"),
        );
        for step in steps {
            step();
        }
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk").field("len", &self.len()).finish()
    }
}

// -- Meta -----------------------------------------------------------------

/// Descriptor of one slice inside a segment's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceDescriptor {
    pub offset: u64,
    pub rows: u64,
    /// Byte range within the payload.
    pub start: u64,
    pub len: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub slices: Vec<SliceDescriptor>,
}

impl SegmentMeta {
    /// Total number of events across all slices.
    pub fn events(&self) -> u64 {
        self.slices.iter().map(|d| d.rows).sum()
    }

    /// Bitmap of every event ID in the segment.
    pub fn ids(&self) -> Bitmap {
        let mut bm = Bitmap::new();
        for d in &self.slices {
            bm.pad_to(d.offset);
            bm.append_bits(true, d.rows);
        }
        bm
    }
}

// -- Segment --------------------------------------------------------------

/// An immutable sealed segment backed by a chunk.
#[derive(Debug)]
pub struct Segment {
    id: Uuid,
    meta: SegmentMeta,
    chunk: Arc<Chunk>,
    payload_start: usize,
}

impl Segment {
    /// Serialize a segment image from finished slice blobs.
    pub(crate) fn encode(id: Uuid, slices: &[(Arc<TableSlice>, Vec<u8>)]) -> Result<Vec<u8>> {
        let mut meta = SegmentMeta::default();
        let mut payload_len = 0u64;
        for (slice, blob) in slices {
            meta.slices.push(SliceDescriptor {
                offset: slice.offset(),
                rows: slice.rows(),
                start: payload_len,
                len: blob.len() as u64,
            });
            payload_len += blob.len() as u64;
        }
        let meta_bytes = bincode::serialize(&meta)?;
        let mut out =
            Vec::with_capacity(HEADER_SIZE + meta_bytes.len() + payload_len as usize);
        out.extend_from_slice(&SEGMENT_MAGIC);
        out.extend_from_slice(&SEGMENT_VERSION.to_le_bytes());
        out.extend_from_slice(id.as_bytes());
        out.extend_from_slice(&(meta_bytes.len() as u64).to_le_bytes());
        out.extend_from_slice(&meta_bytes);
        for (_, blob) in slices {
            out.extend_from_slice(blob);
        }
        Ok(out)
    }

    /// Parse a segment from a chunk, validating the header and the
    /// descriptor table against the payload bounds.
    pub fn from_chunk(chunk: Arc<Chunk>) -> Result<Self> {
        let bytes: &[u8] = &chunk;
        if bytes.len() < HEADER_SIZE {
            return Err(Error::Format("segment file too small".into()));
        }
        if bytes[0..4] != SEGMENT_MAGIC {
            return Err(Error::Format(format!(
                "not a segment file: bad magic {:?}",
                &bytes[0..4]
            )));
        }
        let version = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
        if version != SEGMENT_VERSION {
            return Err(Error::Format(format!(
                "unsupported segment version: {version}"
            )));
        }
        let id = Uuid::from_bytes(bytes[6..22].try_into().unwrap());
        let meta_len = u64::from_le_bytes(bytes[22..30].try_into().unwrap()) as usize;
        let payload_start = HEADER_SIZE + meta_len;
        if payload_start > bytes.len() {
            return Err(Error::Format("segment meta extends past file end".into()));
        }
        let meta: SegmentMeta = bincode::deserialize(&bytes[HEADER_SIZE..payload_start])
            .map_err(|e| Error::Format(format!("corrupt segment meta: {e}")))?;
        let payload_len = (bytes.len() - payload_start) as u64;
        for d in &meta.slices {
            let end = d.start.checked_add(d.len);
            if end.map_or(true, |end| end > payload_len) {
                return Err(Error::Format(
                    "slice descriptor extends past payload end".into(),
                ));
            }
        }
        Ok(Self {
            id,
            meta,
            chunk,
            payload_start,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn meta(&self) -> &SegmentMeta {
        &self.meta
    }

    pub fn chunk(&self) -> &Arc<Chunk> {
        &self.chunk
    }

    /// Bitmap of every event ID in the segment.
    pub fn ids(&self) -> Bitmap {
        self.meta.ids()
    }

    /// Deserialize the slices whose ID range intersects `ids`.
    pub fn lookup(&self, ids: &Bitmap) -> Result<Vec<Arc<TableSlice>>> {
        let bytes: &[u8] = &self.chunk;
        let payload = &bytes[self.payload_start..];
        let mut result = Vec::new();
        for d in &self.meta.slices {
            if !ids.any_in(d.offset, d.offset + d.rows) {
                continue;
            }
            let blob = &payload[d.start as usize..(d.start + d.len) as usize];
            let slice = TableSlice::from_bytes(blob)?;
            if slice.offset() != d.offset || slice.rows() != d.rows {
                return Err(Error::Format(
                    "slice payload disagrees with its descriptor".into(),
                ));
            }
            result.push(Arc::new(slice));
        }
        Ok(result)
    }
}

// -- Tests ----------------------------------------------------------------
