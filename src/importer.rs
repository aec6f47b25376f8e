//! The ingress pipeline: ID assignment and credit-based backpressure.
//!
//! The importer owns a FIFO of ID ranges carved out of a replicated
//! counter. Every inbound slice gets stamped with a contiguous
//! `max_table_slice_size`-wide block, so IDs per stream are strictly
//! monotonic and never overlap across streams. Credit granted to
//! upstream sources is bounded by the IDs on hand, which is what keeps
//! the counter from ever being overcommitted.
//!
//! The importer runs as a message-driven component on its own thread.
//! While a replenishment request is in flight it stashes unrelated
//! messages and re-delivers them in arrival order once the reply lands.

use std::collections::VecDeque;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::slice::TableSlice;

/// How long between telemetry reports.
const TELEMETRY_INTERVAL: Duration = Duration::from_secs(10);
/// Two replenishments inside this window grow the request size.
const REPLENISH_BACKOFF: Duration = Duration::from_secs(10);
/// Extra blocks added per premature replenishment.
const REPLENISH_GROWTH: u64 = 100;

// -- Consensus ------------------------------------------------------------

/// The replicated counter the importer draws IDs from. `add` atomically
/// adds `delta` to `key` and returns the pre-increment value.
pub trait Consensus: Send + Sync + 'static {
    fn add(&self, key: &str, delta: u64) -> Result<u64>;
}

/// Single-node consensus stand-in: a counter persisted in one file.
pub struct LocalConsensus {
    path: PathBuf,
    lock: Mutex<()>,
}

impl LocalConsensus {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

impl Consensus for LocalConsensus {
    fn add(&self, key: &str, delta: u64) -> Result<u64> {
        let _guard = self.lock.lock().expect("consensus lock poisoned");
        if key != "id" {
            return Err(Error::InvalidArgument(format!(
                "unknown consensus key: {key}"
            )));
        }
        let prior = match std::fs::read_to_string(&self.path) {
            Ok(text) => text
                .trim()
                .parse::<u64>()
                .map_err(|_| Error::Parse(format!("corrupt counter file: {text:?}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        let next = prior
            .checked_add(delta)
            .ok_or_else(|| Error::Overflow("consensus counter wrapped".into()))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, next.to_string())?;
        Ok(prior)
    }
}

// -- ID generators --------------------------------------------------------

/// A half-open range `[next, last)` of IDs available for assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdGenerator {
    next: u64,
    last: u64,
}

impl IdGenerator {
    pub fn new(next: u64, last: u64) -> Self {
        Self { next, last }
    }

    pub fn remaining(&self) -> u64 {
        self.last - self.next
    }

    pub fn at_end(&self) -> bool {
        self.next == self.last
    }

    /// Carve `n` IDs off the front, returning the first.
    fn advance(&mut self, n: u64) -> u64 {
        let first = self.next;
        self.next = (self.next + n).min(self.last);
        first
    }
}

// -- Messages -------------------------------------------------------------

/// Messages understood by the importer.
pub enum Message {
    /// A source asks for permission to send `desired` more slices.
    RequestCredit {
        desired: i32,
        reply: Sender<i32>,
    },
    /// A batch of slices from a source that holds credit.
    Batch(Vec<TableSlice>),
    /// Consensus reply carrying a fresh ID block.
    IdBlock { start: u64, count: u64 },
    /// Consensus request failed; clears the awaiting flag.
    ReplenishFailed(String),
    /// Structured status request.
    Status { reply: Sender<serde_json::Value> },
    /// Emit a final report, persist outstanding ID ranges, and stop.
    Exit,
}

/// Throughput accumulator between telemetry reports.
#[derive(Debug, Default, Clone, Copy)]
struct Measurement {
    events: u64,
    duration: Duration,
}

// -- State ----------------------------------------------------------------

pub struct ImporterConfig {
    pub dir: PathBuf,
    pub max_table_slice_size: u64,
    pub blocks_per_replenish: u64,
}

impl ImporterConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_table_slice_size: 100,
            blocks_per_replenish: 100,
        }
    }
}

/// Importer state, separate from the message loop so the credit and ID
/// accounting is testable without threads.
pub struct ImporterState {
    dir: PathBuf,
    consensus: Arc<dyn Consensus>,
    downstream: Vec<Sender<Arc<TableSlice>>>,
    id_generators: VecDeque<IdGenerator>,
    max_table_slice_size: u64,
    blocks_per_replenish: u64,
    in_flight_slices: i32,
    awaiting_ids: bool,
    last_replenish: Option<Instant>,
    /// Channel the consensus reply comes back on.
    self_sender: Sender<Message>,
    measurement: Measurement,
    last_report: Instant,
}

impl ImporterState {
    fn new(
        config: ImporterConfig,
        consensus: Arc<dyn Consensus>,
        downstream: Vec<Sender<Arc<TableSlice>>>,
        self_sender: Sender<Message>,
    ) -> Result<Self> {
        let mut state = Self {
            dir: config.dir,
            consensus,
            downstream,
            id_generators: VecDeque::new(),
            max_table_slice_size: config.max_table_slice_size.max(1),
            blocks_per_replenish: config.blocks_per_replenish.max(1),
            in_flight_slices: 0,
            awaiting_ids: false,
            last_replenish: None,
            self_sender,
            measurement: Measurement::default(),
            last_report: Instant::now(),
        };
        state.read_state()?;
        Ok(state)
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join("available_ids")
    }

    /// Restore outstanding ID ranges, one `<first> <last>` line each.
    fn read_state(&mut self) -> Result<()> {
        self.id_generators.clear();
        let path = self.state_path();
        if !path.exists() {
            return Ok(());
        }
        let file = std::fs::File::open(&path)?;
        for line in std::io::BufReader::new(file).lines() {
            let line = line?;
            let mut parts = line.split_whitespace();
            let parsed = match (parts.next(), parts.next(), parts.next()) {
                (Some(first), Some(last), None) => {
                    match (first.parse::<u64>(), last.parse::<u64>()) {
                        (Ok(first), Ok(last)) if first <= last => Some((first, last)),
                        _ => None,
                    }
                }
                _ => None,
            };
            match parsed {
                Some((first, last)) => {
                    debug!(first, last, "found persisted ID range");
                    self.id_generators.push_back(IdGenerator::new(first, last));
                }
                None => {
                    return Err(Error::Parse(format!(
                        "invalid line in {}: {line:?}",
                        path.display()
                    )))
                }
            }
        }
        Ok(())
    }

    /// Persist outstanding ID ranges so a crash leaks at most the block
    /// currently being requested. An exhausted generator list removes
    /// the file; re-reading consumed ranges would hand out IDs twice.
    fn write_state(&self) -> Result<()> {
        if self.available_ids() == 0 {
            let path = self.state_path();
            if path.exists() {
                std::fs::remove_file(path)?;
            }
            return Ok(());
        }
        std::fs::create_dir_all(&self.dir)?;
        let mut out = Vec::new();
        for g in &self.id_generators {
            if !g.at_end() {
                writeln!(&mut out, "{} {}", g.next, g.last)?;
            }
        }
        std::fs::write(self.state_path(), out)?;
        debug!(available = self.available_ids(), "saved available IDs");
        Ok(())
    }

    /// Total IDs on hand, clamped into `i32` for credit arithmetic.
    pub fn available_ids(&self) -> i32 {
        let total: u64 = self.id_generators.iter().map(|g| g.remaining()).sum();
        total.min(i32::MAX as u64) as i32
    }

    /// First ID of a fresh slice-sized block from the front generator.
    fn next_id_block(&mut self) -> u64 {
        let generator = self
            .id_generators
            .front_mut()
            .expect("credit granted without IDs on hand");
        let first = generator.advance(self.max_table_slice_size);
        if generator.at_end() {
            self.id_generators.pop_front();
        }
        first
    }

    /// Grant credit to a source, never exceeding the IDs on hand.
    fn acquire_credit(&mut self, desired: i32) -> i32 {
        if desired <= 0 {
            return 0;
        }
        let max_available = self.available_ids() / self.max_table_slice_size as i32;
        let max_possible = i32::MAX - self.in_flight_slices;
        let max_credit = (max_available - self.in_flight_slices).max(0);
        let grant = desired.min(max_credit).min(max_possible);
        if max_credit <= desired {
            debug!(grant, max_credit, "limited credit, replenishing");
            self.replenish();
        }
        self.in_flight_slices += grant;
        grant
    }

    /// Ask consensus for more IDs. The request runs on a helper thread
    /// and the reply arrives as a message, so the importer keeps its
    /// stash-and-resume semantics while waiting.
    fn replenish(&mut self) {
        if self.awaiting_ids {
            return;
        }
        let now = Instant::now();
        if let Some(last) = self.last_replenish {
            if now - last < REPLENISH_BACKOFF {
                debug!(
                    from = self.blocks_per_replenish,
                    to = self.blocks_per_replenish + REPLENISH_GROWTH,
                    "replenished twice within the backoff window, growing request"
                );
                self.blocks_per_replenish += REPLENISH_GROWTH;
            }
        }
        self.last_replenish = Some(now);
        self.awaiting_ids = true;
        let n = self.max_table_slice_size * self.blocks_per_replenish;
        debug!(blocks = self.blocks_per_replenish, ids = n, "replenishing ID blocks");
        let consensus = self.consensus.clone();
        let reply = self.self_sender.clone();
        std::thread::spawn(move || {
            let message = match consensus.add("id", n) {
                Ok(start) => Message::IdBlock { start, count: n },
                Err(e) => Message::ReplenishFailed(e.to_string()),
            };
            let _ = reply.send(message);
        });
    }

    fn handle_id_block(&mut self, start: u64, count: u64) {
        debug!(start, count, "got new IDs");
        if start.checked_add(count).is_none() {
            error!("ID space exhausted, dropping block");
            self.awaiting_ids = false;
            return;
        }
        self.id_generators
            .push_back(IdGenerator::new(start, start + count));
        self.awaiting_ids = false;
        if let Err(e) = self.write_state() {
            error!(error = %e, "failed to persist ID ranges");
        }
    }

    /// Stamp and forward a batch of slices.
    fn process_batch(&mut self, slices: Vec<TableSlice>) {
        let started = Instant::now();
        debug!(
            slices = slices.len(),
            in_flight = self.in_flight_slices,
            available = self.available_ids(),
            "processing batch"
        );
        if (slices.len() as i32) > self.in_flight_slices {
            warn!("received more slices than granted credit");
        }
        self.in_flight_slices = (self.in_flight_slices - slices.len() as i32).max(0);
        let mut events = 0u64;
        for mut slice in slices {
            debug_assert!(slice.rows() <= self.max_table_slice_size);
            events += slice.rows();
            slice.set_offset(self.next_id_block());
            let slice = Arc::new(slice);
            self.downstream
                .retain(|sink| sink.send(slice.clone()).is_ok());
        }
        self.measurement.events += events;
        self.measurement.duration += started.elapsed();
    }

    fn send_report(&mut self) {
        if self.measurement.events > 0 {
            let elapsed = self.last_report.elapsed();
            let rate = self.measurement.events as f64 / elapsed.as_secs_f64().max(1e-9);
            info!(
                events = self.measurement.events,
                elapsed_ms = elapsed.as_millis() as u64,
                busy_ms = self.measurement.duration.as_millis() as u64,
                events_per_sec = rate as u64,
                "importer throughput"
            );
            self.measurement = Measurement::default();
        }
        self.last_report = Instant::now();
    }

    fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "in-flight-slices": self.in_flight_slices,
            "max-table-slice-size": self.max_table_slice_size,
            "blocks-per-replenish": self.blocks_per_replenish,
            "awaiting-ids": self.awaiting_ids,
            "available-ids": self.available_ids(),
            "next-id": self.id_generators.front().map(|g| g.next),
        })
    }
}

// -- Message loop ---------------------------------------------------------

/// Handle to a running importer.
pub struct Importer {
    sender: Sender<Message>,
    thread: Option<JoinHandle<()>>,
}

impl Importer {
    /// Spawn the importer on its own thread.
    pub fn spawn(
        config: ImporterConfig,
        consensus: Arc<dyn Consensus>,
        downstream: Vec<Sender<Arc<TableSlice>>>,
    ) -> Result<Self> {
        if downstream.is_empty() {
            return Err(Error::MissingComponent("importer requires a downstream sink"));
        }
        let (sender, receiver) = unbounded();
        let state = ImporterState::new(config, consensus, downstream, sender.clone())?;
        let thread = std::thread::Builder::new()
            .name("importer".into())
            .spawn(move || run(state, receiver))?;
        Ok(Self {
            sender,
            thread: Some(thread),
        })
    }

    pub fn sender(&self) -> Sender<Message> {
        self.sender.clone()
    }

    /// Ask for permission to send `desired` more slices; blocks for the
    /// reply.
    pub fn request_credit(&self, desired: i32) -> Result<i32> {
        let (reply, response) = unbounded();
        self.sender
            .send(Message::RequestCredit { desired, reply })
            .map_err(|_| Error::MissingComponent("importer is gone"))?;
        response
            .recv()
            .map_err(|_| Error::MissingComponent("importer is gone"))
    }

    pub fn send_batch(&self, slices: Vec<TableSlice>) -> Result<()> {
        self.sender
            .send(Message::Batch(slices))
            .map_err(|_| Error::MissingComponent("importer is gone"))
    }

    pub fn status(&self) -> Result<serde_json::Value> {
        let (reply, response) = unbounded();
        self.sender
            .send(Message::Status { reply })
            .map_err(|_| Error::MissingComponent("importer is gone"))?;
        response
            .recv()
            .map_err(|_| Error::MissingComponent("importer is gone"))
    }

    /// Shut down and wait for the final report.
    pub fn exit(mut self) {
        let _ = self.sender.send(Message::Exit);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Importer {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.sender.send(Message::Exit);
            let _ = thread.join();
        }
    }
}

/// Dispatch one message. Returns `false` when the loop should stop.
fn dispatch(state: &mut ImporterState, message: Message) -> bool {
    match message {
        Message::RequestCredit { desired, reply } => {
            let grant = state.acquire_credit(desired);
            let _ = reply.send(grant);
        }
        Message::Batch(slices) => state.process_batch(slices),
        Message::IdBlock { start, count } => state.handle_id_block(start, count),
        Message::ReplenishFailed(reason) => {
            error!(reason, "consensus replenish failed");
            state.awaiting_ids = false;
        }
        Message::Status { reply } => {
            let _ = reply.send(state.status());
        }
        Message::Exit => {
            state.send_report();
            if let Err(e) = state.write_state() {
                error!(error = %e, "failed to persist ID ranges on exit");
            }
            return false;
        }
    }
    true
}

fn run(mut state: ImporterState, receiver: Receiver<Message>) {
    let telemetry = crossbeam_channel::tick(TELEMETRY_INTERVAL);
    // Messages deferred while a consensus request is in flight, replayed
    // in arrival order once the reply lands.
    let mut stash: VecDeque<Message> = VecDeque::new();
    loop {
        let message = crossbeam_channel::select! {
            recv(receiver) -> message => match message {
                Ok(message) => message,
                Err(_) => break,
            },
            recv(telemetry) -> _ => {
                state.send_report();
                continue;
            }
        };
        let defer = state.awaiting_ids
            && !matches!(
                message,
                Message::IdBlock { .. } | Message::ReplenishFailed(_) | Message::Exit
            );
        if defer {
            stash.push_back(message);
            continue;
        }
        if !dispatch(&mut state, message) {
            return;
        }
        // Replay the stash; a nested replenish re-defers the remainder.
        while !state.awaiting_ids {
            let Some(next) = stash.pop_front() else { break };
            if !dispatch(&mut state, next) {
                return;
            }
        }
    }
}

// -- Tests ----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::schema::{Field, RecordType, Type};
    use crate::value::Value;

    /// In-memory consensus for tests.
    struct TestConsensus {
        counter: AtomicU64,
    }

    impl TestConsensus {
        fn new(start: u64) -> Arc<Self> {
            Arc::new(Self {
                counter: AtomicU64::new(start),
            })
        }
    }

    impl Consensus for TestConsensus {
        fn add(&self, _key: &str, delta: u64) -> Result<u64> {
            Ok(self.counter.fetch_add(delta, Ordering::SeqCst))
        }
    }

    fn layout() -> RecordType {
        RecordType::new("event", vec![Field::new("n", Type::Count)])
    }

    fn make_slice(rows: usize) -> TableSlice {
        let rows = (0..rows).map(|i| vec![Value::Count(i as u64)]).collect();
        TableSlice::new(layout(), 0, rows)
    }

    fn state_with(
        dir: &std::path::Path,
        generators: &[(u64, u64)],
        sink: Sender<Arc<TableSlice>>,
    ) -> ImporterState {
        // Replies to self are not consumed in state-only tests.
        let (self_sender, _replies) = unbounded();
        std::mem::forget(_replies);
        let mut config = ImporterConfig::new(dir);
        config.max_table_slice_size = 100;
        let mut state = ImporterState::new(
            config,
            TestConsensus::new(1_000_000),
            vec![sink],
            self_sender,
        )
        .unwrap();
        for &(first, last) in generators {
            state.id_generators.push_back(IdGenerator::new(first, last));
        }
        state
    }

    #[test]
    fn test_credit_bounded_by_available_ids() {
        let dir = tempfile::TempDir::new().unwrap();
        let (sink, _rx) = unbounded();
        let mut state = state_with(dir.path(), &[(0, 500)], sink);
        // 500 IDs at 100 per slice: at most 5 slices of credit.
        let grant = state.acquire_credit(10);
        assert_eq!(grant, 5);
        assert_eq!(state.in_flight_slices, 5);
        // Limiting the grant triggered a replenish request.
        assert!(state.awaiting_ids);
        // Everything is committed now.
        let grant = state.acquire_credit(10);
        assert_eq!(grant, 0);
    }

    #[test]
    fn test_credit_uncapped_when_ids_abound() {
        let dir = tempfile::TempDir::new().unwrap();
        let (sink, _rx) = unbounded();
        let mut state = state_with(dir.path(), &[(0, 100_000)], sink);
        let grant = state.acquire_credit(10);
        assert_eq!(grant, 10);
        assert!(!state.awaiting_ids);
        assert_eq!(state.in_flight_slices, 10);
    }

    #[test]
    fn test_batch_assigns_monotonic_contiguous_blocks() {
        let dir = tempfile::TempDir::new().unwrap();
        let (sink, rx) = unbounded();
        let mut state = state_with(dir.path(), &[(0, 1000)], sink);
        assert_eq!(state.acquire_credit(3), 3);
        state.process_batch(vec![make_slice(100), make_slice(40), make_slice(100)]);
        let received: Vec<Arc<TableSlice>> = rx.try_iter().collect();
        assert_eq!(received.len(), 3);
        // Each slice starts its own block; blocks are contiguous and
        // strictly increasing even for short slices.
        assert_eq!(received[0].offset(), 0);
        assert_eq!(received[1].offset(), 100);
        assert_eq!(received[2].offset(), 200);
        assert_eq!(state.in_flight_slices, 0);
    }

    #[test]
    fn test_generator_fifo_across_blocks() {
        let dir = tempfile::TempDir::new().unwrap();
        let (sink, rx) = unbounded();
        let mut state = state_with(dir.path(), &[(0, 100), (5000, 5100)], sink);
        assert_eq!(state.acquire_credit(2), 2);
        state.process_batch(vec![make_slice(10), make_slice(10)]);
        let received: Vec<Arc<TableSlice>> = rx.try_iter().collect();
        // First block exhausts the first generator, then the FIFO moves on.
        assert_eq!(received[0].offset(), 0);
        assert_eq!(received[1].offset(), 5000);
        assert!(state.id_generators.is_empty());
    }

    #[test]
    fn test_replenish_growth_within_window() {
        let dir = tempfile::TempDir::new().unwrap();
        let (sink, _rx) = unbounded();
        let mut state = state_with(dir.path(), &[], sink);
        let before = state.blocks_per_replenish;
        state.replenish();
        state.awaiting_ids = false; // simulate the reply having landed
        state.replenish();
        assert_eq!(state.blocks_per_replenish, before + REPLENISH_GROWTH);
    }

    #[test]
    fn test_replenish_deduplicates_while_awaiting() {
        let dir = tempfile::TempDir::new().unwrap();
        let (sink, _rx) = unbounded();
        let mut state = state_with(dir.path(), &[], sink);
        state.replenish();
        let blocks = state.blocks_per_replenish;
        state.replenish(); // no-op while awaiting
        assert_eq!(state.blocks_per_replenish, blocks);
    }

    #[test]
    fn test_state_persistence_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let (sink, _rx) = unbounded();
        {
            let mut state = state_with(dir.path(), &[(10, 110), (500, 700)], sink.clone());
            state.write_state().unwrap();
        }
        let state = state_with(dir.path(), &[], sink);
        // read_state ran in the constructor.
        assert_eq!(state.available_ids(), 300);
        assert_eq!(
            state.id_generators.front(),
            Some(&IdGenerator::new(10, 110))
        );
    }

    #[test]
    fn test_state_file_parse_error() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("available_ids"), "10 banana\n").unwrap();
        let (self_sender, _r) = unbounded();
        let (sink, _rx) = unbounded();
        let result = ImporterState::new(
            ImporterConfig::new(dir.path()),
            TestConsensus::new(0),
            vec![sink],
            self_sender,
        );
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    #[test]
    fn test_end_to_end_loop_with_replenish() {
        let dir = tempfile::TempDir::new().unwrap();
        let consensus = TestConsensus::new(0);
        let (sink, rx) = unbounded();
        let mut config = ImporterConfig::new(dir.path());
        config.max_table_slice_size = 100;
        config.blocks_per_replenish = 10;
        let importer = Importer::spawn(config, consensus, vec![sink]).unwrap();
        // No IDs on hand: the first request grants nothing and kicks off
        // a replenish; poll until the reply lands.
        let mut credit = 0;
        for _ in 0..200 {
            credit = importer.request_credit(4).unwrap();
            if credit > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(credit, 4);
        importer
            .send_batch(vec![make_slice(100), make_slice(100)])
            .unwrap();
        importer.send_batch(vec![make_slice(50)]).unwrap();
        let mut offsets = Vec::new();
        for _ in 0..3 {
            let slice = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            offsets.push(slice.offset());
        }
        assert_eq!(offsets, vec![0, 100, 200]);
        let status = importer.status().unwrap();
        assert_eq!(status["in-flight-slices"], 1);
        importer.exit();
        // Outstanding IDs were persisted for reclamation on restart.
        let persisted = std::fs::read_to_string(dir.path().join("available_ids")).unwrap();
        assert!(!persisted.trim().is_empty());
    }

    #[test]
    fn test_spawn_requires_downstream() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = Importer::spawn(
            ImporterConfig::new(dir.path()),
            TestConsensus::new(0),
            vec![],
        );
        assert!(matches!(result, Err(Error::MissingComponent(_))));
    }
}
