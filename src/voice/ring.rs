//! Block ring between the audio producer and the pipeline
//!
//! A fixed set of slots rotates in ring order. The producer (driver
//! callback or replay thread) fills the slot it owns, flips it to ready and
//! posts its index on a bounded channel; it never blocks. The consumer takes
//! ready slots in completion order through [`FrameSource::next_block`] and
//! hands them back by dropping the [`BlockGuard`].
//!
//! When the consumer falls behind and the next slot is still owned, the
//! producer discards that block instead of overwriting a slot being read.
//! Every completed block carries a sequence number, so the consumer sees the
//! gap as [`Error::Overrun`].
//!
//! Slot states are tagged with the producer generation. After
//! [`FrameSource::reconnect`] a stale producer can no longer claim, complete
//! or release any slot. A peripheral fault is latched in the shared state
//! until the consumer reads it, so it survives a full completion channel.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::{Error, Result};

/// Slots in the reference design
pub const DEFAULT_SLOTS: usize = 3;

/// How often a blocked consumer re-checks for shutdown
const POLL_INTERVAL: Duration = Duration::from_millis(100);

const FREE: u64 = 0;
const WRITING: u64 = 1;
const READY: u64 = 2;
const READING: u64 = 3;

/// Slot state word: generation in the high bits, state in the low two
const fn tag(generation: u64, state: u64) -> u64 {
    (generation << 2) | state
}

struct Slot {
    state: AtomicU64,
    samples: Mutex<Box<[i32]>>,
}

impl Slot {
    fn transition(&self, generation: u64, from: u64, to: u64) -> bool {
        self.state
            .compare_exchange(
                tag(generation, from),
                tag(generation, to),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

struct Shared {
    slots: Box<[Slot]>,
    block_len: usize,
    generation: AtomicU64,
    overruns: AtomicU64,
    faults: AtomicU64,
    fault: Mutex<Option<String>>,
    shutdown: AtomicBool,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    fn take_fault(&self) -> Option<String> {
        self.fault.lock().ok().and_then(|mut pending| pending.take())
    }
}

enum Signal {
    Ready { slot: usize, seq: u64 },
    Fault,
}

/// Producer half, owned by the audio callback
pub struct BlockProducer {
    shared: Arc<Shared>,
    tx: SyncSender<Signal>,
    generation: u64,
    slot: usize,
    filled: usize,
    owned: bool,
    seq: u64,
}

/// Reports peripheral faults from a context other than the data callback
#[derive(Clone)]
pub struct FaultReporter {
    shared: Arc<Shared>,
    tx: SyncSender<Signal>,
    generation: u64,
}

/// Consumer half: the pipeline's view of the ring
pub struct FrameSource {
    shared: Arc<Shared>,
    rx: Receiver<Signal>,
    generation: u64,
    expected_seq: u64,
    deferred: Option<(usize, u64)>,
    delivered: u64,
}

/// Makes a blocked [`FrameSource::next_block`] return [`Error::Shutdown`]
#[derive(Clone)]
pub struct ShutdownHandle {
    shared: Arc<Shared>,
}

/// Read-only view of a completed block
///
/// The slot goes back to the producer when the guard is dropped.
pub struct BlockGuard<'a> {
    samples: Option<MutexGuard<'a, Box<[i32]>>>,
    slot: &'a Slot,
    generation: u64,
    seq: u64,
}

impl FrameSource {
    /// Ring of `slots` blocks of `block_len` raw samples each
    ///
    /// # Errors
    ///
    /// Returns a configuration error for fewer than two slots or empty blocks
    pub fn new(slots: usize, block_len: usize) -> Result<(Self, BlockProducer)> {
        if slots < 2 {
            return Err(Error::Config(format!(
                "ring needs at least 2 slots, got {slots}"
            )));
        }
        if block_len == 0 {
            return Err(Error::Config("ring block length must be non-zero".to_string()));
        }

        let slots = (0..slots)
            .map(|_| Slot {
                state: AtomicU64::new(tag(0, FREE)),
                samples: Mutex::new(vec![0; block_len].into_boxed_slice()),
            })
            .collect();
        let shared = Arc::new(Shared {
            slots,
            block_len,
            generation: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
            faults: AtomicU64::new(0),
            fault: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        });

        let mut source = Self {
            shared,
            rx: mpsc::sync_channel(0).1,
            generation: 0,
            expected_seq: 0,
            deferred: None,
            delivered: 0,
        };
        let producer = source.reconnect();
        Ok((source, producer))
    }

    /// Fresh producer for a restarted audio source
    ///
    /// Any block still queued from the previous producer is discarded, along
    /// with a fault it reported but the consumer never read. The previous
    /// producer and its fault reporters become inert.
    #[must_use]
    pub fn reconnect(&mut self) -> BlockProducer {
        let (tx, rx) = mpsc::sync_channel(self.shared.slots.len());
        self.rx = rx;
        self.generation += 1;
        self.expected_seq = 0;
        self.deferred = None;

        self.shared
            .generation
            .store(self.generation, Ordering::Release);
        for slot in &*self.shared.slots {
            slot.state
                .store(tag(self.generation, FREE), Ordering::Release);
        }
        if let Some(stale) = self.shared.take_fault() {
            tracing::debug!(reason = %stale, "discarding fault from previous source");
        }

        BlockProducer {
            shared: Arc::clone(&self.shared),
            tx,
            generation: self.generation,
            slot: 0,
            filled: 0,
            owned: false,
            seq: 0,
        }
    }

    /// Wait for the next completed block
    ///
    /// # Errors
    ///
    /// - [`Error::Overrun`] when blocks were dropped before this one; the
    ///   block itself is returned by the next call
    /// - [`Error::AudioFault`] when the peripheral reported a fault, after
    ///   the blocks completed before it
    /// - [`Error::SourceClosed`] when the producer is gone
    /// - [`Error::Shutdown`] after [`ShutdownHandle::shutdown`]
    pub fn next_block(&mut self) -> Result<BlockGuard<'_>> {
        loop {
            if let Some((slot, seq)) = self.deferred.take() {
                return self.open(slot, seq);
            }
            if self.shared.shutdown.load(Ordering::Acquire) {
                return Err(Error::Shutdown);
            }

            let signal = match self.rx.try_recv() {
                Ok(signal) => signal,
                Err(TryRecvError::Empty) => {
                    // a fault latched while the channel was full has no wake-up queued
                    if let Some(reason) = self.shared.take_fault() {
                        return Err(Error::AudioFault(reason));
                    }
                    match self.rx.recv_timeout(POLL_INTERVAL) {
                        Ok(signal) => signal,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => return Err(self.closed()),
                    }
                }
                Err(TryRecvError::Disconnected) => return Err(self.closed()),
            };

            match signal {
                Signal::Ready { slot, seq } => {
                    if seq > self.expected_seq {
                        let lost = seq - self.expected_seq;
                        self.expected_seq = seq;
                        self.deferred = Some((slot, seq));
                        return Err(Error::Overrun { lost });
                    }
                    return self.open(slot, seq);
                }
                Signal::Fault => {
                    // None when the latch was already read on an empty channel
                    if let Some(reason) = self.shared.take_fault() {
                        return Err(Error::AudioFault(reason));
                    }
                }
            }
        }
    }

    fn closed(&self) -> Error {
        self.shared
            .take_fault()
            .map_or(Error::SourceClosed, Error::AudioFault)
    }

    fn open(&mut self, slot: usize, seq: u64) -> Result<BlockGuard<'_>> {
        let entry = self
            .shared
            .slots
            .get(slot)
            .ok_or_else(|| Error::Audio(format!("slot {slot} out of range")))?;
        if !entry.transition(self.generation, READY, READING) {
            return Err(Error::Audio(format!("slot {slot} signalled but not ready")));
        }
        let samples = entry
            .samples
            .lock()
            .map_err(|_| Error::Audio("slot lock poisoned".to_string()))?;

        self.expected_seq = seq + 1;
        self.delivered += 1;
        Ok(BlockGuard {
            samples: Some(samples),
            slot: entry,
            generation: self.generation,
            seq,
        })
    }

    /// Handle for stopping a blocked consumer from another thread
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Blocks the producer had to discard
    #[must_use]
    pub fn overruns(&self) -> u64 {
        self.shared.overruns.load(Ordering::Relaxed)
    }

    /// Faults reported by the current and previous producers
    #[must_use]
    pub fn faults(&self) -> u64 {
        self.shared.faults.load(Ordering::Relaxed)
    }

    /// Blocks handed to the consumer
    #[must_use]
    pub const fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Raw samples per block
    #[must_use]
    pub fn block_len(&self) -> usize {
        self.shared.block_len
    }

    /// Number of slots in the ring
    #[must_use]
    pub fn slots(&self) -> usize {
        self.shared.slots.len()
    }
}

impl ShutdownHandle {
    /// Ask the consumer to stop
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
    }
}

impl BlockProducer {
    /// Append raw samples, completing blocks as they fill
    ///
    /// Never blocks. Samples belonging to a block that found its slot still
    /// owned by the consumer are discarded.
    pub fn write(&mut self, mut samples: &[i32]) {
        let block_len = self.shared.block_len;

        while !samples.is_empty() {
            if self.owned && !self.shared.is_current(self.generation) {
                self.owned = false;
            }
            if self.filled == 0 {
                self.owned = self.acquire();
            }

            let take = (block_len - self.filled).min(samples.len());
            if self.owned {
                let slot = &self.shared.slots[self.slot];
                if let Ok(mut dst) = slot.samples.try_lock() {
                    dst[self.filled..self.filled + take].copy_from_slice(&samples[..take]);
                } else {
                    // consumer still holds the lock; drop the block
                    slot.transition(self.generation, WRITING, FREE);
                    self.owned = false;
                    self.shared.overruns.fetch_add(1, Ordering::Relaxed);
                }
            }

            self.filled += take;
            samples = &samples[take..];

            if self.filled == block_len {
                self.complete();
            }
        }
    }

    /// Reporter for the driver's error callback
    #[must_use]
    pub fn fault_reporter(&self) -> FaultReporter {
        FaultReporter {
            shared: Arc::clone(&self.shared),
            tx: self.tx.clone(),
            generation: self.generation,
        }
    }

    /// Raw samples per block
    #[must_use]
    pub fn block_len(&self) -> usize {
        self.shared.block_len
    }

    fn acquire(&self) -> bool {
        if self.shared.slots[self.slot].transition(self.generation, FREE, WRITING) {
            return true;
        }
        // blocks from a replaced producer are not overruns
        if self.shared.is_current(self.generation) {
            self.shared.overruns.fetch_add(1, Ordering::Relaxed);
        }
        false
    }

    fn complete(&mut self) {
        let slot = &self.shared.slots[self.slot];
        if self.owned && slot.transition(self.generation, WRITING, READY) {
            let signal = Signal::Ready {
                slot: self.slot,
                seq: self.seq,
            };
            if let Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) =
                self.tx.try_send(signal)
            {
                slot.transition(self.generation, READY, FREE);
                self.shared.overruns.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.seq += 1;
        self.slot = (self.slot + 1) % self.shared.slots.len();
        self.filled = 0;
        self.owned = false;
    }
}

impl Drop for BlockProducer {
    fn drop(&mut self) {
        // a block cut off mid-write goes back to the ring
        if self.owned {
            self.shared.slots[self.slot].transition(self.generation, WRITING, FREE);
        }
    }
}

impl FaultReporter {
    /// Latch a fault for the consumer
    ///
    /// The fault stays pending until [`FrameSource::next_block`] returns it,
    /// even when the completion channel is full. A later fault replaces an
    /// unread one. Faults from a replaced producer are ignored.
    pub fn report(&self, reason: impl Into<String>) {
        if !self.shared.is_current(self.generation) {
            return;
        }
        self.shared.faults.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut pending) = self.shared.fault.lock() {
            *pending = Some(reason.into());
        }
        // wake a blocked consumer; with a full channel it sees the latch on its next call
        if self.tx.try_send(Signal::Fault).is_err() {
            tracing::trace!("fault latched without wake-up");
        }
    }
}

impl BlockGuard<'_> {
    /// Sequence number of this block since the producer started
    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }
}

impl Deref for BlockGuard<'_> {
    type Target = [i32];

    fn deref(&self) -> &[i32] {
        match &self.samples {
            Some(samples) => samples,
            None => &[],
        }
    }
}

impl Drop for BlockGuard<'_> {
    fn drop(&mut self) {
        // unlock before the slot becomes visible to the producer again
        drop(self.samples.take());
        self.slot
            .state
            .store(tag(self.generation, FREE), Ordering::Release);
    }
}
