//! Partition-level pruning via per-column synopses.
//!
//! The meta-index keeps, per partition and per layout, one optional
//! synopsis per column. An expression lookup returns the partitions that
//! might contain matching events; pruning is sound (no false negatives)
//! but allows false positives, so negations conservatively return the
//! full universe.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::expr::{Expression, Extractor, Predicate};
use crate::schema::{RecordType, ATTR_SKIP};
use crate::slice::TableSlice;
use crate::synopsis::{Synopsis, SynopsisFactory};
use crate::value::{self, Value};

type TableSynopsis = Vec<Option<Synopsis>>;

#[derive(Debug, Serialize, Deserialize)]
pub struct MetaIndex {
    partition_synopses: HashMap<Uuid, HashMap<RecordType, TableSynopsis>>,
    /// Layouts for which no column yields a synopsis; skipped on add.
    blacklisted_layouts: HashSet<RecordType>,
    #[serde(skip, default)]
    factory: SynopsisFactory,
}

impl MetaIndex {
    pub fn new(factory: SynopsisFactory) -> Self {
        Self {
            partition_synopses: HashMap::new(),
            blacklisted_layouts: HashSet::new(),
            factory,
        }
    }

    pub fn partitions(&self) -> usize {
        self.partition_synopses.len()
    }

    /// Feed a slice's cells into the synopses of `partition`.
    pub fn add(&mut self, partition: Uuid, slice: &TableSlice) {
        let layout = slice.layout();
        if self.blacklisted_layouts.contains(layout) {
            return;
        }
        let partition_synopsis = self.partition_synopses.entry(partition).or_default();
        if !partition_synopsis.contains_key(layout) {
            let table: TableSynopsis = layout
                .fields
                .iter()
                .map(|field| {
                    if field.has_attribute(ATTR_SKIP) {
                        None
                    } else {
                        self.factory.make(&field.ty)
                    }
                })
                .collect();
            if table.iter().all(|s| s.is_none()) {
                debug!(layout = %layout, "no synopsis for layout, blacklisting");
                self.blacklisted_layouts.insert(layout.clone());
            }
            partition_synopsis.insert(layout.clone(), table);
        }
        let table = partition_synopsis
            .get_mut(layout)
            .expect("table synopsis just inserted");
        for (col, synopsis) in table.iter_mut().enumerate() {
            let Some(synopsis) = synopsis else { continue };
            for row in 0..slice.rows() as usize {
                let view = slice.at(row, col);
                if !view.is_nil() {
                    synopsis.add(view);
                }
            }
        }
    }

    /// All partition IDs, sorted.
    fn all_partitions(&self) -> Vec<Uuid> {
        let mut result: Vec<Uuid> = self.partition_synopses.keys().copied().collect();
        result.sort_unstable();
        result
    }

    /// The partitions that may contain events matching `expr`, sorted
    /// ascending for deterministic set operations.
    pub fn lookup(&self, expr: &Expression) -> Vec<Uuid> {
        match expr {
            Expression::Conjunction(xs) => {
                let mut iter = xs.iter();
                let mut result = match iter.next() {
                    Some(x) => self.lookup(x),
                    None => return Vec::new(),
                };
                for x in iter {
                    if result.is_empty() {
                        return result;
                    }
                    let other = self.lookup(x);
                    result.retain(|id| other.binary_search(id).is_ok());
                }
                result
            }
            Expression::Disjunction(xs) => {
                let mut result = Vec::new();
                for x in xs {
                    let other = self.lookup(x);
                    if other.len() == self.partition_synopses.len() {
                        return other;
                    }
                    result = union_sorted(&result, &other);
                }
                result
            }
            Expression::Negation(_) => {
                // A synopsis may report false positives; negating such a
                // result could drop real matches.
                self.all_partitions()
            }
            Expression::Predicate(predicate) => self.lookup_predicate(predicate),
        }
    }

    fn lookup_predicate(&self, predicate: &Predicate) -> Vec<Uuid> {
        if let Extractor::EventType = predicate.lhs {
            let mut result: Vec<Uuid> = self
                .partition_synopses
                .iter()
                .filter(|(_, tables)| {
                    tables.keys().any(|layout| {
                        let name = Value::String(layout.name.clone());
                        value::evaluate(&name, predicate.op, &predicate.rhs)
                    })
                })
                .map(|(id, _)| *id)
                .collect();
            result.sort_unstable();
            return result;
        }
        // Probe every matching synopsis of every partition; one "maybe"
        // includes the partition. An inconclusive synopsis (no answer)
        // counts as a maybe.
        let rhs = predicate.rhs.view();
        let probes: Vec<(Uuid, bool, bool)> = self
            .partition_synopses
            .par_iter()
            .map(|(id, tables)| {
                let mut matched = false;
                for (layout, table) in tables {
                    for (field, synopsis) in layout.fields.iter().zip(table) {
                        let Some(synopsis) = synopsis else { continue };
                        if !Expression::field_matches(&predicate.lhs, field) {
                            continue;
                        }
                        matched = true;
                        match synopsis.lookup(predicate.op, rhs) {
                            Some(false) => {}
                            Some(true) | None => return (*id, true, true),
                        }
                    }
                }
                (*id, matched, false)
            })
            .collect();
        let any_matched = probes.iter().any(|(_, matched, _)| *matched);
        if !any_matched {
            // No synopsis covers this predicate anywhere; every partition
            // stays a candidate.
            return self.all_partitions();
        }
        let mut result: Vec<Uuid> = probes
            .into_iter()
            .filter(|(_, _, include)| *include)
            .map(|(id, _, _)| id)
            .collect();
        result.sort_unstable();
        result
    }

    // -- Persistence ------------------------------------------------------

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, bincode::serialize(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path, factory: SynopsisFactory) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let mut meta: MetaIndex = bincode::deserialize(&bytes)
            .map_err(|e| Error::Format(format!("corrupt meta-index: {e}")))?;
        meta.factory = factory;
        Ok(meta)
    }

    pub fn load_or_default(path: &Path, factory: SynopsisFactory) -> Self {
        if path.exists() {
            match Self::load(path, factory.clone()) {
                Ok(meta) => return meta,
                Err(e) => warn!(error = %e, "failed to load meta-index, starting empty"),
            }
        }
        Self::new(factory)
    }
}

fn union_sorted(a: &[Uuid], b: &[Uuid]) -> Vec<Uuid> {
    let mut result = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                result.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                result.push(b[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                result.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    result.extend_from_slice(&a[i..]);
    result.extend_from_slice(&b[j..]);
    result
}

// -- Tests ----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Attribute, Field, Type, ATTR_TIMESTAMP};

    fn layout() -> RecordType {
        RecordType::new(
            "conn",
            vec![
                Field::new("ts", Type::Time).with_attributes(vec![Attribute::flag(ATTR_TIMESTAMP)]),
                Field::new("host", Type::String),
                Field::new("bytes", Type::Count),
            ],
        )
    }

    fn slice(offset: u64, rows: &[(i64, &str, u64)]) -> TableSlice {
        let rows = rows
            .iter()
            .map(|(ts, host, bytes)| {
                vec![
                    Value::Time(*ts),
                    Value::String(host.to_string()),
                    Value::Count(*bytes),
                ]
            })
            .collect();
        TableSlice::new(layout(), offset, rows)
    }

    fn meta_with_two_partitions() -> (MetaIndex, Uuid, Uuid) {
        let mut meta = MetaIndex::new(SynopsisFactory::standard());
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        meta.add(p1, &slice(0, &[(100, "early.example.com", 1)]));
        meta.add(p1, &slice(1, &[(200, "mid.example.com", 2)]));
        meta.add(p2, &slice(100, &[(5000, "late.example.com", 3)]));
        (meta, p1, p2)
    }

    fn lookup(meta: &MetaIndex, input: &str) -> Vec<Uuid> {
        meta.lookup(&Expression::parse(input).unwrap())
    }

    #[test]
    fn test_timestamp_pruning() {
        let (meta, p1, p2) = meta_with_two_partitions();
        let hits = lookup(&meta, "#timestamp < @300");
        assert_eq!(hits, sorted(vec![p1]));
        let hits = lookup(&meta, "#timestamp > @1000");
        assert_eq!(hits, sorted(vec![p2]));
        let hits = lookup(&meta, "#timestamp >= @100");
        assert_eq!(hits, sorted(vec![p1, p2]));
    }

    #[test]
    fn test_string_bloom_pruning() {
        let (meta, p1, _p2) = meta_with_two_partitions();
        let hits = lookup(&meta, "host == \"early.example.com\"");
        assert_eq!(hits, vec![p1]);
        // Absent values prune (with overwhelming probability) every
        // partition.
        let hits = lookup(&meta, "host == \"nowhere.invalid\"");
        assert!(hits.len() <= 1);
    }

    #[test]
    fn test_unsummarized_column_keeps_universe() {
        let (meta, p1, p2) = meta_with_two_partitions();
        // Count columns have no synopsis, so the predicate cannot prune.
        let hits = lookup(&meta, "bytes == 999");
        assert_eq!(hits, sorted(vec![p1, p2]));
    }

    #[test]
    fn test_negation_returns_universe() {
        let (meta, p1, p2) = meta_with_two_partitions();
        let hits = lookup(&meta, "!(#timestamp < @300)");
        assert_eq!(hits, sorted(vec![p1, p2]));
    }

    #[test]
    fn test_conjunction_intersects() {
        let (meta, p1, p2) = meta_with_two_partitions();
        let hits = lookup(
            &meta,
            "#timestamp < @300 && host == \"early.example.com\"",
        );
        assert_eq!(hits, vec![p1]);
        let hits = lookup(&meta, "#timestamp < @300 && #timestamp > @1000");
        assert!(hits.is_empty());
        let _ = p2;
    }

    #[test]
    fn test_disjunction_unions() {
        let (meta, p1, p2) = meta_with_two_partitions();
        let hits = lookup(&meta, "#timestamp < @300 || #timestamp > @1000");
        assert_eq!(hits, sorted(vec![p1, p2]));
    }

    #[test]
    fn test_event_type_extractor() {
        let (meta, p1, p2) = meta_with_two_partitions();
        let hits = lookup(&meta, "#type == \"conn\"");
        assert_eq!(hits, sorted(vec![p1, p2]));
        let hits = lookup(&meta, "#type == \"dns\"");
        assert!(hits.is_empty());
    }

    #[test]
    fn test_soundness_no_false_negatives() {
        // Every partition holding a matching row must be in the result.
        let (meta, p1, _p2) = meta_with_two_partitions();
        for q in ["#timestamp == @100", "#timestamp == @200", "host == \"mid.example.com\""] {
            let hits = lookup(&meta, q);
            assert!(hits.contains(&p1), "partition dropped for {q}");
        }
    }

    #[test]
    fn test_blacklisted_layout() {
        let mut meta = MetaIndex::new(SynopsisFactory::standard());
        // A layout with only count columns yields no synopsis at all.
        let bare = RecordType::new("bare", vec![Field::new("n", Type::Count)]);
        let slice = TableSlice::new(bare.clone(), 0, vec![vec![Value::Count(1)]]);
        let p = Uuid::new_v4();
        meta.add(p, &slice);
        assert!(meta.blacklisted_layouts.contains(&bare));
        // Further adds of the same layout are ignored without error.
        meta.add(p, &TableSlice::new(bare, 1, vec![vec![Value::Count(2)]]));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let (meta, p1, _) = meta_with_two_partitions();
        let path = dir.path().join("meta");
        meta.save(&path).unwrap();
        let loaded = MetaIndex::load(&path, SynopsisFactory::standard()).unwrap();
        assert_eq!(loaded.partitions(), 2);
        assert_eq!(lookup(&loaded, "#timestamp < @300"), vec![p1]);
    }

    fn sorted(mut ids: Vec<Uuid>) -> Vec<Uuid> {
        ids.sort_unstable();
        ids
    }
}
