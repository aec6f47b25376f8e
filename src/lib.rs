//! Spyglass, a storage and indexing engine for structured security
//! telemetry.
//!
//! The engine ingests streams of column-typed event rows, assigns each
//! row a globally unique monotonic ID, persists rows in append-only
//! segments, and answers predicate queries through compact in-memory
//! synopses and on-disk bitmap value indices.
//!
//! Subsystems:
//! - [`value`] / [`schema`]: the tagged value model, borrowed views, and
//!   record types with flatten/unflatten.
//! - [`bitmap`] / [`coder`]: EWAH bitmaps and the coder/base machinery
//!   under every index.
//! - [`index`]: per-column value indices and the per-partition bundles.
//! - [`synopsis`] / [`meta_index`]: partition-level pruning.
//! - [`slice`]: row-major typed mini-batches with explicit ID offsets.
//! - [`segment`] / [`range_map`]: the on-disk event store.
//! - [`importer`]: ID allocation and credit-based ingest backpressure.
//! - [`expr`]: the boolean predicate trees all query paths share.

pub mod bitmap;
pub mod coder;
pub mod error;
pub mod expr;
pub mod importer;
pub mod index;
pub mod meta_index;
pub mod range_map;
pub mod schema;
pub mod segment;
pub mod slice;
pub mod synopsis;
pub mod value;

pub use bitmap::Bitmap;
pub use error::{Error, Result};
pub use expr::Expression;
pub use importer::{Consensus, Importer, ImporterConfig, LocalConsensus};
pub use index::{IndexFactory, Partition, ValueIndex};
pub use meta_index::MetaIndex;
pub use range_map::RangeMap;
pub use schema::{Attribute, Field, RecordType, Type};
pub use segment::{SegmentBuilder, SegmentStore};
pub use slice::{TableSlice, TableSliceBuilder};
pub use synopsis::SynopsisFactory;
pub use value::{Address, Pattern, Port, Proto, RelOp, Subnet, Value, ValueView};
