//! Integration tests for the storage pipeline: segment rollover,
//! selective erasure, cache-size independence, and the full
//! importer -> store/index -> query path.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use uuid::Uuid;

use spyglass::expr::Expression;
use spyglass::importer::{Consensus, Importer, ImporterConfig};
use spyglass::index::{IndexFactory, Partition};
use spyglass::meta_index::MetaIndex;
use spyglass::schema::{Attribute, Field, RecordType, Type, ATTR_TIMESTAMP};
use spyglass::segment::SegmentStore;
use spyglass::slice::TableSlice;
use spyglass::synopsis::SynopsisFactory;
use spyglass::value::{Value, ValueView};
use spyglass::{Bitmap, Result};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn event_layout() -> RecordType {
    RecordType::new(
        "event",
        vec![
            Field::new("seq", Type::Count),
            Field::new("msg", Type::String),
        ],
    )
}

/// A slice whose rows carry their own global ID, so payload integrity is
/// checkable after any rewrite.
fn make_slice(offset: u64, rows: u64) -> Arc<TableSlice> {
    let rows = (0..rows)
        .map(|i| {
            let id = offset + i;
            vec![Value::Count(id), Value::String(format!("event-{id}"))]
        })
        .collect();
    Arc::new(TableSlice::new(event_layout(), offset, rows))
}

/// Collect all row IDs of the returned slices, in delivery order.
fn delivered_ids(slices: &[Arc<TableSlice>]) -> Vec<u64> {
    slices
        .iter()
        .flat_map(|s| {
            let (lo, hi) = s.id_range();
            lo..hi
        })
        .collect()
}

/// Check that every row still carries the payload written at ingest.
fn assert_payloads_intact(slices: &[Arc<TableSlice>]) {
    for slice in slices {
        for row in 0..slice.rows() as usize {
            let id = slice.offset() + row as u64;
            assert_eq!(slice.at(row, 0), ValueView::Count(id));
            assert_eq!(
                slice.at(row, 1),
                ValueView::String(&format!("event-{id}")),
                "payload damaged for id {id}"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Segment rollover and erasure
// ---------------------------------------------------------------------------

#[test]
fn rollover_and_selective_erase() {
    let dir = TempDir::new().unwrap();
    let mut store = SegmentStore::new(dir.path(), 4096, 4).unwrap();
    for i in 0..10u64 {
        store.put(make_slice(i * 1000, 1000)).unwrap();
    }
    store.flush().unwrap();
    let sealed = std::fs::read_dir(dir.path().join("segment")).unwrap().count();
    assert!(sealed >= 2, "expected at least two sealed segments, got {sealed}");

    store.erase(&Bitmap::from_ids(2500..7500)).unwrap();

    let slices = store.get(&Bitmap::filled(10_000, true)).unwrap();
    let ids = delivered_ids(&slices);
    let expect: Vec<u64> = (0..2500).chain(7500..10_000).collect();
    assert_eq!(ids, expect, "erase must drop exactly [2500, 7500)");
    assert_payloads_intact(&slices);
}

#[test]
fn erase_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let mut store = SegmentStore::new(dir.path(), 4096, 4).unwrap();
        for i in 0..4u64 {
            store.put(make_slice(i * 1000, 1000)).unwrap();
        }
        store.flush().unwrap();
        store.erase(&Bitmap::from_ids(1000..2000)).unwrap();
    }
    let store = SegmentStore::new(dir.path(), 4096, 4).unwrap();
    let slices = store.get(&Bitmap::filled(4000, true)).unwrap();
    let ids = delivered_ids(&slices);
    let expect: Vec<u64> = (0..1000).chain(2000..4000).collect();
    assert_eq!(ids, expect);
    assert_payloads_intact(&slices);
}

#[test]
fn erase_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let mut store = SegmentStore::new(dir.path(), 4096, 4).unwrap();
    for i in 0..3u64 {
        store.put(make_slice(i * 1000, 1000)).unwrap();
    }
    store.erase(&Bitmap::from_ids(500..1500)).unwrap();
    store.erase(&Bitmap::from_ids(500..1500)).unwrap();
    let ids = delivered_ids(&store.get(&Bitmap::filled(3000, true)).unwrap());
    let expect: Vec<u64> = (0..500).chain(1500..3000).collect();
    assert_eq!(ids, expect);
}

// ---------------------------------------------------------------------------
// Cache-size independence
// ---------------------------------------------------------------------------

#[test]
fn get_results_independent_of_cache_capacity() {
    let mut baseline: Option<Vec<u64>> = None;
    for capacity in [1usize, 2, 64] {
        let dir = TempDir::new().unwrap();
        let mut store = SegmentStore::new(dir.path(), 2048, capacity).unwrap();
        for i in 0..8u64 {
            store.put(make_slice(i * 500, 500)).unwrap();
        }
        store.flush().unwrap();
        let query = Bitmap::from_ids([0, 700, 1800, 2600, 3999]);
        let slices = store.get(&query).unwrap();
        assert_payloads_intact(&slices);
        let mut ids = delivered_ids(&slices);
        ids.sort_unstable();
        match &baseline {
            Some(expect) => assert_eq!(&ids, expect, "capacity {capacity} changed results"),
            None => baseline = Some(ids),
        }
    }
}

#[test]
fn extract_streams_same_rows_as_get() {
    let dir = TempDir::new().unwrap();
    let mut store = SegmentStore::new(dir.path(), 2048, 2).unwrap();
    for i in 0..6u64 {
        store.put(make_slice(i * 500, 500)).unwrap();
    }
    let query = Bitmap::filled(3000, true);
    let via_get: Vec<u64> = delivered_ids(&store.get(&query).unwrap());
    let streamed: Vec<Arc<TableSlice>> = store
        .extract(&query)
        .collect::<Result<Vec<_>>>()
        .unwrap();
    let mut via_extract = delivered_ids(&streamed);
    let mut via_get_sorted = via_get.clone();
    via_extract.sort_unstable();
    via_get_sorted.sort_unstable();
    assert_eq!(via_extract, via_get_sorted);
}

// ---------------------------------------------------------------------------
// Importer-driven ingest and query
// ---------------------------------------------------------------------------

struct CountingConsensus {
    counter: std::sync::atomic::AtomicU64,
}

impl Consensus for CountingConsensus {
    fn add(&self, _key: &str, delta: u64) -> Result<u64> {
        Ok(self
            .counter
            .fetch_add(delta, std::sync::atomic::Ordering::SeqCst))
    }
}

fn telemetry_layout() -> RecordType {
    RecordType::new(
        "conn",
        vec![
            Field::new("ts", Type::Time).with_attributes(vec![Attribute::flag(ATTR_TIMESTAMP)]),
            Field::new("orig_h", Type::Address),
            Field::new("msg", Type::String),
        ],
    )
}

fn conn_slice(rows: &[(i64, &str, &str)]) -> TableSlice {
    let rows = rows
        .iter()
        .map(|(ts, host, msg)| {
            vec![
                Value::Time(*ts),
                Value::Address(host.parse().unwrap()),
                Value::String(msg.to_string()),
            ]
        })
        .collect();
    TableSlice::new(telemetry_layout(), 0, rows)
}

#[test]
fn importer_to_query_pipeline() {
    let dir = TempDir::new().unwrap();
    let consensus = Arc::new(CountingConsensus {
        counter: std::sync::atomic::AtomicU64::new(0),
    });
    let (sink, stamped) = crossbeam_channel::unbounded();
    let mut config = ImporterConfig::new(dir.path().join("importer"));
    config.max_table_slice_size = 10;
    config.blocks_per_replenish = 10;
    let importer = Importer::spawn(config, consensus, vec![sink]).unwrap();

    // Wait out the initial replenish, then push three slices.
    let mut credit = 0;
    for _ in 0..500 {
        credit = importer.request_credit(3).unwrap();
        if credit >= 3 {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(credit, 3);
    importer
        .send_batch(vec![
            conn_slice(&[
                (100, "10.0.0.1", "login"),
                (110, "10.0.0.2", "logout"),
            ]),
            conn_slice(&[(200, "192.168.1.5", "probe")]),
            conn_slice(&[(300, "10.0.0.1", "login")]),
        ])
        .unwrap();

    let mut store = SegmentStore::new(dir.path(), 1 << 20, 4).unwrap();
    let mut meta = MetaIndex::new(SynopsisFactory::standard());
    let mut partition = Partition::new(Uuid::new_v4(), IndexFactory::standard());
    for _ in 0..3 {
        let slice = stamped.recv_timeout(Duration::from_secs(5)).unwrap();
        store.put(slice.clone()).unwrap();
        meta.add(partition.id(), &slice);
        partition.add(&slice).unwrap();
    }
    importer.exit();

    // IDs are slice-block aligned and strictly increasing.
    let all = store.get(&store.ids()).unwrap();
    let offsets: Vec<u64> = {
        let mut o: Vec<u64> = all.iter().map(|s| s.offset()).collect();
        o.sort_unstable();
        o
    };
    assert_eq!(offsets, vec![0, 10, 20]);

    // Meta-index prunes, the partition narrows to IDs, the store
    // materializes, and the expression filters rows.
    let expr = Expression::parse("orig_h in 10.0.0.0/24 && msg == \"login\"").unwrap();
    let candidates = meta.lookup(&expr);
    assert_eq!(candidates, vec![partition.id()]);
    let ids = partition.lookup(&expr).unwrap();
    assert_eq!(ids.ones().collect::<Vec<_>>(), vec![0, 20]);
    let matches: Vec<String> = store
        .get(&ids)
        .unwrap()
        .iter()
        .flat_map(|slice| {
            (0..slice.rows() as usize)
                .filter(|&row| ids.get(slice.offset() + row as u64))
                .filter(|&row| expr.matches_event(slice.layout(), slice.row(row)))
                .map(|row| format!("{:?}", slice.at(row, 2)))
                .collect::<Vec<_>>()
        })
        .collect();
    assert_eq!(matches.len(), 2);

    // A query for absent data prunes everything.
    let absent = Expression::parse("orig_h == 172.16.0.9").unwrap();
    let hits = partition.lookup(&absent).unwrap();
    assert!(hits.ones().next().is_none());
}

#[test]
fn erase_then_query_consistency() {
    let dir = TempDir::new().unwrap();
    let mut store = SegmentStore::new(dir.path(), 2048, 4).unwrap();
    for i in 0..4u64 {
        store.put(make_slice(i * 1000, 1000)).unwrap();
    }
    // Erase a range crossing a slice boundary and query around it.
    store.erase(&Bitmap::from_ids(900..1100)).unwrap();
    let around = store.get(&Bitmap::from_ids(850..1150)).unwrap();
    let ids: Vec<u64> = delivered_ids(&around);
    assert!(ids.contains(&899));
    assert!(ids.contains(&1100));
    assert!(!ids.contains(&900));
    assert!(!ids.contains(&1099));
    assert_payloads_intact(&around);
}
