//! The segment store: active builder, sealed-segment LRU, and the
//! ID-interval range map.
//!
//! Layout under the state directory:
//!
//! ```text
//! <dir>/meta              serialized range map
//! <dir>/segment/<uuid>    sealed segment files
//! ```
//!
//! The range map covers every ID ever admitted; injection failure on
//! `put` means the importer violated its no-overlap contract. A corrupt
//! range map at startup is fatal; a missing one starts an empty store.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Chunk, Segment, SegmentBuilder};
use crate::bitmap::Bitmap;
use crate::error::{Error, Result};
use crate::range_map::RangeMap;
use crate::slice::TableSlice;

pub struct SegmentStore {
    dir: PathBuf,
    max_segment_size: u64,
    builder: SegmentBuilder,
    segments: RangeMap<Uuid>,
    cache: Mutex<LruCache<Uuid, Arc<Segment>>>,
}

impl SegmentStore {
    /// Open a store, loading persisted range-map state if present.
    pub fn new(dir: impl Into<PathBuf>, max_segment_size: u64, in_memory_segments: usize) -> Result<Self> {
        assert!(max_segment_size > 0, "max_segment_size must be positive");
        let dir = dir.into();
        std::fs::create_dir_all(dir.join("segment"))?;
        let capacity = NonZeroUsize::new(in_memory_segments.max(1)).expect("capacity is nonzero");
        let meta_path = dir.join("meta");
        let segments = if meta_path.exists() {
            let bytes = std::fs::read(&meta_path)?;
            bincode::deserialize(&bytes)
                .map_err(|e| Error::Format(format!("corrupt segment meta data: {e}")))?
        } else {
            RangeMap::new()
        };
        Ok(Self {
            dir,
            max_segment_size,
            builder: SegmentBuilder::new(),
            segments,
            cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join("meta")
    }

    fn segment_path(&self, id: Uuid) -> PathBuf {
        self.dir.join("segment").join(id.to_string())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// IDs of all admitted events.
    pub fn ids(&self) -> Bitmap {
        let mut bm = Bitmap::new();
        for (lo, hi, _) in self.segments.iter() {
            bm.pad_to(lo);
            bm.append_bits(true, hi - lo);
        }
        bm
    }

    // -- Ingest -----------------------------------------------------------

    /// Admit a slice into the active segment. Seals the segment once it
    /// exceeds the configured size.
    pub fn put(&mut self, slice: Arc<TableSlice>) -> Result<()> {
        debug!(offset = slice.offset(), rows = slice.rows(), "adds a table slice");
        let (lo, hi) = slice.id_range();
        self.builder.add(slice)?;
        self.segments.inject(lo, hi, self.builder.id())?;
        if self.builder.size() < self.max_segment_size {
            return Ok(());
        }
        self.flush()
    }

    /// Seal the active segment to disk. No-op when the builder is empty.
    pub fn flush(&mut self) -> Result<()> {
        if self.builder.is_empty() {
            return Ok(());
        }
        let segment = self.builder.finish()?;
        let id = segment.id();
        let path = self.segment_path(id);
        std::fs::write(&path, segment.chunk().as_bytes())?;
        debug!(segment = %id, path = %path.display(), "wrote new segment");
        self.cache_insert(Arc::new(segment));
        self.save_meta()
    }

    fn save_meta(&self) -> Result<()> {
        std::fs::write(self.meta_path(), bincode::serialize(&self.segments)?)?;
        Ok(())
    }

    fn cache_insert(&self, segment: Arc<Segment>) {
        self.cache
            .lock()
            .expect("segment cache lock poisoned")
            .put(segment.id(), segment);
    }

    // -- Retrieval --------------------------------------------------------

    /// The segments whose intervals intersect `ids`, deduplicated, in
    /// range order. Interleaved ID blocks can alternate between
    /// segments, so dedup checks the whole list, not just the last.
    fn select_segments(&self, ids: &Bitmap) -> Vec<Uuid> {
        let mut candidates: Vec<Uuid> = Vec::new();
        for (lo, hi, id) in self.segments.iter() {
            if ids.any_in(lo, hi) && !candidates.contains(id) {
                candidates.push(*id);
            }
        }
        candidates
    }

    /// Visit cache-resident candidates first. A prefetch hint for the
    /// streaming path; `get` keeps range order so results concatenate in
    /// ID order.
    fn order_candidates(&self, mut candidates: Vec<Uuid>) -> Vec<Uuid> {
        let cache = self.cache.lock().expect("segment cache lock poisoned");
        candidates.sort_by_key(|id| *id != self.builder.id() && !cache.contains(id));
        candidates
    }

    fn load_segment(&self, id: Uuid) -> Result<Arc<Segment>> {
        let path = self.segment_path(id);
        debug!(segment = %id, "loads segment from disk");
        let chunk = Chunk::mmap(&path)?;
        let segment = Segment::from_chunk(chunk)?;
        if segment.id() != id {
            return Err(Error::Format(format!(
                "segment file {id} contains segment {}",
                segment.id()
            )));
        }
        Ok(Arc::new(segment))
    }

    /// The cached segment, or load it and fill the cache.
    fn fetch(&self, id: Uuid) -> Result<Arc<Segment>> {
        if let Some(segment) = self
            .cache
            .lock()
            .expect("segment cache lock poisoned")
            .get(&id)
        {
            debug!(segment = %id, "cache hit");
            return Ok(segment.clone());
        }
        let segment = self.load_segment(id)?;
        self.cache_insert(segment.clone());
        Ok(segment)
    }

    /// Materialize every slice containing any of `ids`, in ID order.
    pub fn get(&self, ids: &Bitmap) -> Result<Vec<Arc<TableSlice>>> {
        let candidates = self.select_segments(ids);
        debug!(candidates = candidates.len(), "processes candidates");
        let mut result = Vec::new();
        for candidate in candidates {
            if candidate == self.builder.id() {
                result.extend(self.builder.lookup(ids));
            } else {
                result.extend(self.fetch(candidate)?.lookup(ids)?);
            }
        }
        Ok(result)
    }

    /// Pull-style variant of [`get`](Self::get): yields one slice per
    /// step without materializing all candidates at once.
    pub fn extract<'a>(&'a self, ids: &Bitmap) -> Extract<'a> {
        let candidates = self.order_candidates(self.select_segments(ids));
        Extract {
            store: self,
            ids: ids.clone(),
            candidates,
            next_candidate: 0,
            buffer: Vec::new(),
        }
    }

    // -- Erasure ----------------------------------------------------------

    /// Remove all events with IDs in `ids`, rewriting partially affected
    /// segments. Best-effort per candidate: one failure logs a warning
    /// and the loop continues.
    pub fn erase(&mut self, ids: &Bitmap) -> Result<()> {
        let candidates = self.select_segments(ids);
        if candidates.is_empty() {
            return Ok(());
        }
        let mut erased_events = 0u64;
        for candidate in candidates {
            if candidate == self.builder.id() {
                erased_events += self.erase_from_builder(ids);
                continue;
            }
            let cached = self
                .cache
                .lock()
                .expect("segment cache lock poisoned")
                .pop(&candidate);
            let segment = match cached {
                Some(segment) => segment,
                None => match self.load_segment(candidate) {
                    Ok(segment) => segment,
                    Err(e) => {
                        warn!(segment = %candidate, error = %e, "cannot load segment for erasure, skipping");
                        continue;
                    }
                },
            };
            match self.erase_from_segment(&segment, ids) {
                Ok(n) => erased_events += n,
                Err(e) => {
                    warn!(segment = %candidate, error = %e, "failed to erase from segment, skipping");
                }
            }
        }
        if erased_events > 0 {
            info!(events = erased_events, "erased events");
            self.save_meta()?;
        }
        Ok(())
    }

    /// Erase from the active builder by re-feeding the kept slices.
    fn erase_from_builder(&mut self, ids: &Bitmap) -> u64 {
        let segment_ids = self.builder.ids();
        let old_id = self.builder.id();
        self.segments.erase_value(&old_id);
        if segment_ids.is_subset(ids) {
            debug!(segment = %old_id, "erases the entire active segment");
            let events = segment_ids.count_ones();
            self.builder.reset();
            return events;
        }
        let slices = self.builder.lookup(&segment_ids);
        self.builder.reset();
        let mut erased = 0;
        for slice in slices {
            erased += self.refill(&slice, ids, None);
        }
        erased
    }

    /// Erase from a sealed segment by building a replacement. The stale
    /// file is unlinked once the last reader releases the old chunk.
    fn erase_from_segment(&mut self, segment: &Arc<Segment>, ids: &Bitmap) -> Result<u64> {
        let old_id = segment.id();
        let segment_ids = segment.ids();
        let stale_path = self.segment_path(old_id);
        if segment_ids.is_subset(ids) {
            debug!(segment = %old_id, "erases entire segment");
            self.segments.erase_value(&old_id);
            segment
                .chunk()
                .add_deletion_step(move || remove_file_logged(&stale_path));
            return Ok(segment_ids.count_ones());
        }
        let slices = segment.lookup(&segment_ids)?;
        self.segments.erase_value(&old_id);
        let mut replacement = SegmentBuilder::new();
        let mut erased = 0;
        for slice in slices {
            erased += self.refill(&slice, ids, Some(&mut replacement));
        }
        if replacement.is_empty() {
            debug!(segment = %old_id, "no rows left, dropping segment");
        } else {
            let new_segment = replacement.finish()?;
            let path = self.segment_path(new_segment.id());
            std::fs::write(&path, new_segment.chunk().as_bytes())?;
            debug!(old = %old_id, new = %new_segment.id(), "rewrote segment");
        }
        segment
            .chunk()
            .add_deletion_step(move || remove_file_logged(&stale_path));
        Ok(erased)
    }

    /// Split `slice` by the erase set and re-admit the kept rows either
    /// into a replacement builder or the active one. Returns the number
    /// of dropped rows.
    fn refill(
        &mut self,
        slice: &Arc<TableSlice>,
        erase_ids: &Bitmap,
        replacement: Option<&mut SegmentBuilder>,
    ) -> u64 {
        let (_, hi) = slice.id_range();
        let mut keep_mask = !erase_ids;
        if keep_mask.len() < hi {
            keep_mask.append_bits(true, hi - keep_mask.len());
        }
        let kept = slice.select(&keep_mask);
        let kept_rows: u64 = kept.iter().map(|s| s.rows()).sum();
        let builder = match replacement {
            Some(b) => b,
            None => &mut self.builder,
        };
        for part in kept {
            let (lo, hi) = part.id_range();
            let part = Arc::new(part);
            if let Err(e) = builder.add(part) {
                warn!(error = %e, "failed to re-add slice during erase");
                continue;
            }
            if let Err(e) = self.segments.inject(lo, hi, builder.id()) {
                warn!(error = %e, "failed to update range map during erase");
            }
        }
        slice.rows() - kept_rows
    }

    // -- Introspection ----------------------------------------------------

    /// Structured status report.
    pub fn status(&self) -> serde_json::Value {
        let segments: Vec<serde_json::Value> = self
            .segments
            .iter()
            .map(|(lo, hi, id)| {
                serde_json::json!({ "range": format!("[{lo}, {hi})"), "segment": id.to_string() })
            })
            .collect();
        let cached: Vec<String> = self
            .cache
            .lock()
            .expect("segment cache lock poisoned")
            .iter()
            .map(|(id, _)| id.to_string())
            .collect();
        serde_json::json!({
            "meta-path": self.meta_path().display().to_string(),
            "segment-path": self.dir.join("segment").display().to_string(),
            "max-segment-size": self.max_segment_size,
            "segments": segments,
            "cached": cached,
            "current-segment": {
                "id": self.builder.id().to_string(),
                "size": self.builder.size(),
            },
        })
    }
}

fn remove_file_logged(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "failed to remove stale segment file");
    }
}

/// Streaming lookup over the candidate segments of an ID set.
pub struct Extract<'a> {
    store: &'a SegmentStore,
    ids: Bitmap,
    candidates: Vec<Uuid>,
    next_candidate: usize,
    buffer: Vec<Arc<TableSlice>>,
}

impl Iterator for Extract<'_> {
    type Item = Result<Arc<TableSlice>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(slice) = self.buffer.pop() {
                return Some(Ok(slice));
            }
            if self.next_candidate >= self.candidates.len() {
                return None;
            }
            let candidate = self.candidates[self.next_candidate];
            self.next_candidate += 1;
            let mut slices = if candidate == self.store.builder.id() {
                self.store.builder.lookup(&self.ids)
            } else {
                match self.store.fetch(candidate) {
                    Ok(segment) => match segment.lookup(&self.ids) {
                        Ok(slices) => slices,
                        Err(e) => return Some(Err(e)),
                    },
                    Err(e) => return Some(Err(e)),
                }
            };
            // Pop from the back; keep delivery in slice order.
            slices.reverse();
            self.buffer = slices;
        }
    }
}

// -- Tests ----------------------------------------------------------------
