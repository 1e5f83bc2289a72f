// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The three-tier backpressure manager.

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};

use otb_repr::Record;
use otb_secrets::DerivedKey;

use crate::frame::FrameCrypto;
use crate::metrics::SpoolMetrics;
use crate::segment::{recover_dir, DeadLetter, SegmentMeta, SegmentReader, SegmentWriter};
use crate::SpoolError;

/// What to do with a record when both bounded tiers are full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DropPolicy {
    /// Discard the head of the memory queue to make room for the new record.
    #[default]
    Oldest,
    /// Discard the incoming record.
    Newest,
    /// Return an error to the producer.
    Reject,
}

/// Sizing and policy for one backpressure manager.
#[derive(Debug, Clone)]
pub struct SpoolConfig {
    /// Directory for Tier B segments.
    pub spool_dir: PathBuf,
    /// Directory for Tier C (dead-letter) segments.
    pub dlq_dir: PathBuf,
    /// Tier A capacity in records.
    pub memory_capacity: usize,
    /// Tier B cap in total bytes. Zero disables the disk spool.
    pub max_spool_bytes: u64,
    /// Tier B cap in segment files.
    pub max_segments: usize,
    /// Roll the active segment when it reaches this size.
    pub segment_max_bytes: u64,
    /// Roll the active segment when it reaches this age.
    pub segment_max_age: Duration,
    pub drop_policy: DropPolicy,
    /// Whether to fsync segments at close. On for production; tests that
    /// hammer the spool may turn it off.
    pub fsync: bool,
}

impl SpoolConfig {
    pub fn new(spool_dir: PathBuf, dlq_dir: PathBuf) -> SpoolConfig {
        SpoolConfig {
            spool_dir,
            dlq_dir,
            memory_capacity: 10_000,
            max_spool_bytes: 1 << 30,
            max_segments: 1024,
            segment_max_bytes: 8 << 20,
            segment_max_age: Duration::from_secs(60),
            drop_policy: DropPolicy::default(),
            fsync: true,
        }
    }
}

/// A consistent snapshot of the manager's accounting.
///
/// The identity `received == dequeued + dropped_for_overflow + dlq_moved +
/// in_flight` holds at any quiescent point. A record the consumer later
/// dead-letters is counted under `dlq_moved`, not `dequeued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SpoolCounts {
    pub received: u64,
    pub dequeued: u64,
    pub dropped_for_overflow: u64,
    pub dlq_moved: u64,
    pub spool_errors: u64,
    pub in_flight: u64,
}

struct OpenReader {
    reader: SegmentReader,
    consumed: u64,
}

struct Inner {
    ring: VecDeque<Record>,
    segments: VecDeque<SegmentMeta>,
    writer: Option<SegmentWriter>,
    reader: Option<OpenReader>,
    next_seq: u64,
    spool_records: u64,
    spool_bytes: u64,
    dlq_writer: Option<SegmentWriter>,
    dlq_next_seq: u64,
}

/// The per-target three-tier bounded FIFO.
///
/// Multi-producer non-blocking enqueue, single-consumer blocking dequeue
/// with a deadline. The FIFO invariant across tiers: the ring always holds
/// records older than everything in the spool, because enqueues divert to
/// the spool whenever it is non-empty and the ring is only refilled from
/// the spool's head.
pub struct BackpressureManager {
    config: SpoolConfig,
    crypto: FrameCrypto,
    inner: Mutex<Inner>,
    notify: Notify,
    metrics: SpoolMetrics,
    received: AtomicU64,
    dequeued: AtomicU64,
    dropped: AtomicU64,
    dlq_moved: AtomicU64,
    spool_errors: AtomicU64,
    shutdown: AtomicBool,
}

impl BackpressureManager {
    /// Opens the manager, replaying any spool left by a previous process
    /// from its head and truncating a torn tail segment.
    pub fn open(
        config: SpoolConfig,
        key: &DerivedKey,
        metrics: SpoolMetrics,
    ) -> Result<BackpressureManager, SpoolError> {
        let crypto = FrameCrypto::new(key);
        let (segments, next_seq) = recover_dir(&config.spool_dir, &crypto)?;
        let (dlq_segments, dlq_next_seq) = recover_dir(&config.dlq_dir, &crypto)?;
        // DLQ segments are never consumed automatically; recovery only
        // establishes the next sequence number.
        drop(dlq_segments);

        let spool_records = segments.iter().map(|s| s.records).sum();
        let spool_bytes = segments.iter().map(|s| s.bytes).sum();
        metrics.spool_records.set(spool_records as i64);
        metrics.spool_bytes.set(spool_bytes as i64);

        Ok(BackpressureManager {
            config,
            crypto,
            inner: Mutex::new(Inner {
                ring: VecDeque::new(),
                segments,
                writer: None,
                reader: None,
                next_seq,
                spool_records,
                spool_bytes,
                dlq_writer: None,
                dlq_next_seq,
            }),
            notify: Notify::new(),
            metrics,
            received: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            dlq_moved: AtomicU64::new(0),
            spool_errors: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Non-blocking enqueue. Applies the three-tier protocol: ring while the
    /// spool is empty, then spool, then the drop policy.
    pub fn enqueue(&self, record: Record) -> Result<(), SpoolError> {
        let mut inner = self.inner.lock().expect("backpressure lock poisoned");

        if inner.spool_records == 0 && inner.ring.len() < self.config.memory_capacity {
            inner.ring.push_back(record);
            self.record_received();
            self.metrics.queue_depth.set(inner.ring.len() as i64);
            self.notify.notify_one();
            return Ok(());
        }

        let image = bincode::serialize(&record).map_err(|e| SpoolError::Codec(e.to_string()))?;
        let frame = self.crypto.seal(&image);

        if self.spool_has_room(&inner, frame.len() as u64) {
            match self.append_spool(&mut inner, &frame) {
                Ok(()) => {
                    self.record_received();
                    self.notify.notify_one();
                    return Ok(());
                }
                Err(e) => {
                    // Disk full or I/O error: surface as a counter and fall
                    // back to the drop policy.
                    warn!("spool append failed: {}", e);
                    self.spool_errors.fetch_add(1, Ordering::Relaxed);
                    self.metrics.spool_errors.inc();
                }
            }
        }

        self.apply_drop_policy(&mut inner, record)
    }

    /// Blocking dequeue with a deadline. Returns `Ok(None)` when the
    /// deadline passes with nothing available or the manager is shut down;
    /// cancellation (dropping the future) never loses a record.
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<Record>, SpoolError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().expect("backpressure lock poisoned");
                if let Some(record) = inner.ring.pop_front() {
                    self.record_dequeued();
                    self.metrics.queue_depth.set(inner.ring.len() as i64);
                    return Ok(Some(record));
                }
                if inner.spool_records > 0 {
                    let record = self.read_spool_head(&mut inner)?;
                    self.record_dequeued();
                    return Ok(Some(record));
                }
                if self.shutdown.load(Ordering::SeqCst) {
                    return Ok(None);
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    /// Appends a record to the dead-letter queue with the reason the sink
    /// refused it. DLQ entries are never consumed by the gateway.
    pub fn dead_letter(&self, record: Record, reason: &str) -> Result<(), SpoolError> {
        let entry = DeadLetter {
            reason: reason.to_owned(),
            record,
        };
        let image = bincode::serialize(&entry).map_err(|e| SpoolError::Codec(e.to_string()))?;
        let frame = self.crypto.seal(&image);

        let mut inner = self.inner.lock().expect("backpressure lock poisoned");
        if inner.dlq_writer.is_none() {
            let seq = inner.dlq_next_seq;
            inner.dlq_next_seq += 1;
            inner.dlq_writer = Some(SegmentWriter::create(&self.config.dlq_dir, seq)?);
        }
        let writer = inner.dlq_writer.as_mut().expect("just ensured");
        writer.append(&frame)?;
        if writer.bytes >= self.config.segment_max_bytes {
            let writer = inner.dlq_writer.take().expect("just used");
            writer.finish(self.config.fsync)?;
        }
        self.dlq_moved.fetch_add(1, Ordering::Relaxed);
        self.metrics.dlq_moved.inc();
        debug!(reason, "record moved to dead-letter queue");
        Ok(())
    }

    /// Moves every record still in the memory tier onto the disk spool,
    /// ignoring the byte cap. Called at shutdown so a bounded drain deadline
    /// cannot lose in-memory records.
    pub fn flush_memory_to_spool(&self) -> Result<usize, SpoolError> {
        let mut inner = self.inner.lock().expect("backpressure lock poisoned");
        self.flush_locked(&mut inner)
    }

    /// Marks the manager shut down, waking all blocked consumers, flushes
    /// the memory tier to disk, and closes the active segment writers
    /// durably.
    pub fn close(&self) -> Result<(), SpoolError> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        let mut inner = self.inner.lock().expect("backpressure lock poisoned");
        self.flush_locked(&mut inner)?;
        if let Some(writer) = inner.dlq_writer.take() {
            writer.finish(self.config.fsync)?;
        }
        Ok(())
    }

    /// Makes the memory tier durable while preserving the consumer view
    /// order across a restart. Ring records are older than everything on
    /// disk (enqueues divert to the spool while it is non-empty), so they
    /// are merged in front of the unconsumed remainder of the head segment
    /// rather than appended behind the tail. The consumed prefix of the
    /// head segment is dropped in the same pass, which is what makes a
    /// clean stop replay without duplicates.
    fn flush_locked(&self, inner: &mut Inner) -> Result<usize, SpoolError> {
        use std::io::Write;

        if let Some(writer) = inner.writer.take() {
            let meta = writer.finish(self.config.fsync)?;
            inner.segments.push_back(meta);
        }
        let consumed = inner.reader.as_ref().map_or(0, |r| r.consumed);
        if inner.ring.is_empty() && consumed == 0 {
            return Ok(0);
        }

        let flushed = inner.ring.len();
        let mut frames = Vec::with_capacity(flushed);
        for record in inner.ring.drain(..) {
            let image =
                bincode::serialize(&record).map_err(|e| SpoolError::Codec(e.to_string()))?;
            frames.push(self.crypto.seal(&image));
        }
        self.metrics.queue_depth.set(0);

        if let Some(head) = inner.segments.front().cloned() {
            inner.reader = None;
            let tmp = head.path.with_extension("seg.tmp");
            let mut file = std::fs::File::create(&tmp)?;
            let mut bytes = 0u64;
            let mut records = 0u64;
            for frame in &frames {
                file.write_all(frame)?;
                bytes += frame.len() as u64;
                records += 1;
            }
            let mut reader = SegmentReader::open(&head.path)?;
            for _ in 0..consumed {
                reader.next_frame_raw()?;
            }
            while let Some(frame) = reader.next_frame_raw()? {
                file.write_all(&frame)?;
                bytes += frame.len() as u64;
                records += 1;
            }
            file.sync_all()?;
            fs::rename(&tmp, &head.path)?;

            let flushed_bytes: u64 = frames.iter().map(|f| f.len() as u64).sum();
            inner.spool_records += flushed as u64;
            inner.spool_bytes += flushed_bytes;
            let head = inner.segments.front_mut().expect("head exists");
            head.records = records;
            head.bytes = bytes;
        } else {
            for frame in &frames {
                self.append_spool(inner, frame)?;
            }
            if let Some(writer) = inner.writer.take() {
                let meta = writer.finish(self.config.fsync)?;
                inner.segments.push_back(meta);
            }
        }
        self.metrics.spool_records.set(inner.spool_records as i64);
        self.metrics.spool_bytes.set(inner.spool_bytes as i64);
        Ok(flushed)
    }

    /// Records currently queued across both consumable tiers.
    pub fn depth(&self) -> u64 {
        let inner = self.inner.lock().expect("backpressure lock poisoned");
        inner.ring.len() as u64 + inner.spool_records
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    pub fn spool_bytes(&self) -> u64 {
        self.inner.lock().expect("backpressure lock poisoned").spool_bytes
    }

    /// A consistent accounting snapshot.
    pub fn counts(&self) -> SpoolCounts {
        let in_flight = self.depth();
        let dequeued_gross = self.dequeued.load(Ordering::Relaxed);
        let dlq_moved = self.dlq_moved.load(Ordering::Relaxed);
        SpoolCounts {
            received: self.received.load(Ordering::Relaxed),
            dequeued: dequeued_gross - dlq_moved,
            dropped_for_overflow: self.dropped.load(Ordering::Relaxed),
            dlq_moved,
            spool_errors: self.spool_errors.load(Ordering::Relaxed),
            in_flight,
        }
    }

    /// Spawns the dispatcher: a thread that migrates spool-head records into
    /// the ring as the ring drains, so a healthy consumer reads from memory
    /// even while a backlog drains from disk.
    pub fn start_dispatcher(self: &Arc<Self>) -> DispatcherHandle {
        let manager = Arc::clone(self);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("spool-dispatcher".into())
            .spawn(move || {
                while !stop_flag.load(Ordering::SeqCst) {
                    match manager.fill_ring_from_spool(128) {
                        Ok(0) => std::thread::park_timeout(Duration::from_millis(25)),
                        Ok(_) => {}
                        Err(e) => {
                            warn!("spool dispatcher error: {}", e);
                            std::thread::park_timeout(Duration::from_millis(250));
                        }
                    }
                }
            })
            .expect("spawning dispatcher thread");
        DispatcherHandle {
            stop,
            thread: Some(thread),
        }
    }

    /// Moves up to `max` records from the spool head into the ring.
    fn fill_ring_from_spool(&self, max: usize) -> Result<usize, SpoolError> {
        let mut inner = self.inner.lock().expect("backpressure lock poisoned");
        let mut moved = 0;
        while moved < max
            && inner.ring.len() < self.config.memory_capacity
            && inner.spool_records > 0
        {
            let record = self.read_spool_head(&mut inner)?;
            inner.ring.push_back(record);
            moved += 1;
        }
        if moved > 0 {
            self.metrics.queue_depth.set(inner.ring.len() as i64);
            self.notify.notify_one();
        }
        Ok(moved)
    }

    fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.metrics.received.inc();
    }

    fn record_dequeued(&self) {
        self.dequeued.fetch_add(1, Ordering::Relaxed);
        self.metrics.dequeued.inc();
    }

    fn spool_has_room(&self, inner: &Inner, frame_len: u64) -> bool {
        if self.config.max_spool_bytes == 0 {
            return false;
        }
        let open_segments = inner.segments.len() + usize::from(inner.writer.is_some());
        inner.spool_bytes + frame_len <= self.config.max_spool_bytes
            && open_segments <= self.config.max_segments
    }

    fn append_spool(&self, inner: &mut Inner, frame: &[u8]) -> Result<(), SpoolError> {
        if inner.writer.is_none() {
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.writer = Some(SegmentWriter::create(&self.config.spool_dir, seq)?);
        }
        let writer = inner.writer.as_mut().expect("just ensured");
        writer.append(frame)?;
        inner.spool_records += 1;
        inner.spool_bytes += frame.len() as u64;
        self.metrics.spool_records.set(inner.spool_records as i64);
        self.metrics.spool_bytes.set(inner.spool_bytes as i64);

        let roll = writer.bytes >= self.config.segment_max_bytes
            || writer.created.elapsed() >= self.config.segment_max_age;
        if roll {
            let writer = inner.writer.take().expect("just used");
            let meta = writer.finish(self.config.fsync)?;
            inner.segments.push_back(meta);
        }
        Ok(())
    }

    /// Reads, decrypts, and removes the record at the spool's head. The
    /// caller holds the lock and has checked `spool_records > 0`.
    fn read_spool_head(&self, inner: &mut Inner) -> Result<Record, SpoolError> {
        if inner.reader.is_none() {
            if inner.segments.is_empty() {
                // The only spooled records are in the active writer; seal it
                // so they become readable.
                let writer = inner
                    .writer
                    .take()
                    .expect("spool_records > 0 implies a segment exists");
                let meta = writer.finish(self.config.fsync)?;
                inner.segments.push_back(meta);
            }
            let head = inner.segments.front().expect("checked non-empty");
            inner.reader = Some(OpenReader {
                reader: SegmentReader::open(&head.path)?,
                consumed: 0,
            });
        }

        let head_records = inner.segments.front().expect("reader implies head").records;
        let open = inner.reader.as_mut().expect("just ensured");
        match open.reader.next_frame(&self.crypto)? {
            Some((image, frame_len)) => {
                open.consumed += 1;
                let exhausted = open.consumed >= head_records;
                inner.spool_records -= 1;
                inner.spool_bytes = inner.spool_bytes.saturating_sub(frame_len);
                self.metrics.spool_records.set(inner.spool_records as i64);
                self.metrics.spool_bytes.set(inner.spool_bytes as i64);
                if exhausted {
                    let meta = inner.segments.pop_front().expect("head exists");
                    inner.reader = None;
                    fs::remove_file(&meta.path)?;
                }
                bincode::deserialize(&image).map_err(|e| SpoolError::Codec(e.to_string()))
            }
            None => Err(SpoolError::Corrupt(
                "segment ended before its recorded record count".into(),
            )),
        }
    }

    fn apply_drop_policy(&self, inner: &mut Inner, record: Record) -> Result<(), SpoolError> {
        match self.config.drop_policy {
            DropPolicy::Reject => Err(SpoolError::Rejected),
            DropPolicy::Newest => {
                self.record_received();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.metrics.dropped_for_overflow.inc();
                Ok(())
            }
            DropPolicy::Oldest => {
                self.record_received();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.metrics.dropped_for_overflow.inc();
                if inner.ring.pop_front().is_some() {
                    inner.ring.push_back(record);
                    self.metrics.queue_depth.set(inner.ring.len() as i64);
                    self.notify.notify_one();
                }
                // If the ring was empty the overflow is entirely on disk and
                // the incoming record itself is the one discarded.
                Ok(())
            }
        }
    }
}

/// Owns the dispatcher thread; stops and joins it on drop.
pub struct DispatcherHandle {
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            let _ = thread.join();
        }
    }
}
