//! Bounded ring buffer with blocking backpressure
//!
//! This module decouples the hot path (instrumented call sites) from the cold
//! path (SQLite I/O). Producers copy rows into a fixed slot array; one drain
//! worker per table moves them out in batches.
//!
//! # Design
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │ PRODUCER THREADS (Hot Path)                                     │
//! │   insert(row) → slot[(head+1) % capacity], head += 1            │
//! │   Blocks on `not_full` while head - tail == capacity            │
//! └─────────────────────────────────────────────────────────────────┘
//!                          │
//!                          │ wake `work_ready` once backlog ≥ batch
//!                          ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │ DRAIN WORKER (Cold Path)                                        │
//! │   while backlog ≥ batch { write_batch(); notify not_full }      │
//! │   Idle: wait on `work_ready` until woken or done                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `head` is the last index produced and `tail` the last index consumed.
//! Both only grow; only the physical slot wraps. At all times
//! `tail <= head <= tail + capacity`.
//!
//! # Backpressure
//!
//! Unlike a drop-on-full queue, a full buffer blocks the producer until the
//! worker advances `tail`. No row is ever dropped, overwritten or reordered.
//! If storage wedges, producers block indefinitely once the buffer is full.
//!
//! # Wait Conditions
//!
//! One lock guards all state. Two condition variables carry the two
//! predicates: `not_full` for producers and `work_ready` for the worker.
//! Every waiter re-checks its predicate after waking.

use parking_lot::{Condvar, Mutex, MutexGuard};

/// Drain worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting for backlog or shutdown
    Idle,
    /// Running batches (also the state before the first check)
    Draining,
    /// Observed shutdown and left its loop
    Terminated,
}

struct RingState<R> {
    slots: Vec<Option<R>>,
    head: u64,
    tail: u64,
    done: bool,
    worker: WorkerState,
}

impl<R> RingState<R> {
    fn backlog(&self) -> u64 {
        self.head - self.tail
    }
}

/// A contiguous run of rows moved out of the buffer
#[derive(Debug)]
pub struct Batch<R> {
    /// Index of the first row (`tail + 1` at selection time)
    pub first: u64,
    /// Index of the last row, inclusive
    pub last: u64,
    pub rows: Vec<R>,
}

/// Snapshot of the counters, taken under the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSnapshot {
    pub head: u64,
    pub tail: u64,
    pub done: bool,
    pub worker: WorkerState,
}

/// Bounded, array-backed queue addressed by monotonically increasing counters
pub struct RingBuffer<R> {
    state: Mutex<RingState<R>>,
    not_full: Condvar,
    work_ready: Condvar,
    capacity: u64,
    batch_size: u64,
}

impl<R> RingBuffer<R> {
    /// Create a ring buffer
    ///
    /// # Panics
    ///
    /// Panics if `capacity` or `batch_size` is 0, or if `batch_size` exceeds
    /// `capacity` (the worker could never see a full batch).
    pub fn new(capacity: usize, batch_size: usize) -> Self {
        assert!(capacity > 0, "Ring buffer capacity must be > 0");
        assert!(batch_size > 0, "Batch size must be > 0");
        assert!(
            batch_size <= capacity,
            "Batch size must not exceed ring buffer capacity"
        );

        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);

        Self {
            state: Mutex::new(RingState {
                slots,
                head: 0,
                tail: 0,
                done: false,
                worker: WorkerState::Draining,
            }),
            not_full: Condvar::new(),
            work_ready: Condvar::new(),
            capacity: capacity as u64,
            batch_size: batch_size as u64,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size as usize
    }

    fn slot(&self, index: u64) -> usize {
        (index % self.capacity) as usize
    }

    /// Enqueue a row, blocking while the buffer is full
    ///
    /// `drain_inline` runs (without the lock) only when the buffer is full and
    /// the worker has already terminated, so a producer never waits on a
    /// worker that is gone.
    pub fn insert(&self, row: R, mut drain_inline: impl FnMut()) {
        let mut state = self.state.lock();
        while state.backlog() >= self.capacity {
            if state.done && state.worker == WorkerState::Terminated {
                MutexGuard::unlocked(&mut state, &mut drain_inline);
                continue;
            }
            self.work_ready.notify_one();
            self.not_full.wait(&mut state);
        }

        let index = state.head + 1;
        let slot = self.slot(index);
        state.slots[slot] = Some(row);
        state.head = index;

        let wake = state.worker == WorkerState::Idle && state.backlog() >= self.batch_size;
        drop(state);

        if wake {
            self.work_ready.notify_one();
        }
    }

    /// Move the next batch out of the buffer
    ///
    /// Selects `[tail + 1, min(head, tail + batch_size)]` under the lock.
    /// `tail` does not move until [`RingBuffer::complete_batch`], so the
    /// emptied slots stay reserved while the batch is written.
    pub fn take_batch(&self) -> Option<Batch<R>> {
        let mut state = self.state.lock();
        if state.head == state.tail {
            return None;
        }

        let first = state.tail + 1;
        let last = state.head.min(state.tail + self.batch_size);
        let mut rows = Vec::with_capacity((last - first + 1) as usize);
        for index in first..=last {
            let slot = self.slot(index);
            if let Some(row) = state.slots[slot].take() {
                rows.push(row);
            }
        }
        debug_assert_eq!(rows.len() as u64, last - first + 1);

        Some(Batch { first, last, rows })
    }

    /// Advance `tail` past a written batch and wake blocked producers
    ///
    /// Returns the remaining backlog.
    pub fn complete_batch(&self, last: u64) -> u64 {
        let remaining = {
            let mut state = self.state.lock();
            debug_assert!(last > state.tail && last <= state.head);
            state.tail = last;
            state.backlog()
        };
        self.not_full.notify_all();
        remaining
    }

    /// Drain worker loop
    ///
    /// `Idle → Draining → Idle → … → Terminated`. Batches run only while the
    /// backlog holds at least one full batch; the residue below that is left
    /// for an explicit flush. Returns once shutdown has been observed.
    pub fn run_worker(&self, mut drain: impl FnMut()) {
        let mut state = self.state.lock();
        while !state.done {
            while state.backlog() >= self.batch_size {
                state.worker = WorkerState::Draining;
                MutexGuard::unlocked(&mut state, &mut drain);
                self.not_full.notify_all();
            }
            state.worker = WorkerState::Idle;
            if !state.done {
                self.work_ready.wait(&mut state);
            }
            state.worker = WorkerState::Draining;
        }
        state.worker = WorkerState::Terminated;
        drop(state);

        // Producers blocked on a full buffer now drain inline.
        self.not_full.notify_all();
    }

    /// Request worker shutdown
    pub fn shut_down(&self) {
        self.state.lock().done = true;
        self.work_ready.notify_all();
    }

    /// Number of rows produced but not yet consumed
    pub fn backlog(&self) -> u64 {
        self.state.lock().backlog()
    }

    pub fn is_empty(&self) -> bool {
        self.backlog() == 0
    }

    pub fn snapshot(&self) -> RingSnapshot {
        let state = self.state.lock();
        RingSnapshot {
            head: state.head,
            tail: state.tail,
            done: state.done,
            worker: state.worker,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_ring_buffer_creation() {
        let ring: RingBuffer<u32> = RingBuffer::new(8, 4);
        assert_eq!(ring.capacity(), 8);
        assert_eq!(ring.batch_size(), 4);
        assert!(ring.is_empty());
        assert_eq!(ring.take_batch().map(|b| b.rows), None);
    }

    #[test]
    #[should_panic(expected = "Ring buffer capacity must be > 0")]
    fn test_zero_capacity_panics() {
        let _: RingBuffer<u32> = RingBuffer::new(0, 1);
    }

    #[test]
    #[should_panic(expected = "Batch size must not exceed ring buffer capacity")]
    fn test_batch_larger_than_capacity_panics() {
        let _: RingBuffer<u32> = RingBuffer::new(4, 8);
    }

    #[test]
    fn test_batch_range_is_bounded() {
        let ring = RingBuffer::new(8, 4);
        for i in 0..6u32 {
            ring.insert(i, || {});
        }

        let batch = ring.take_batch().unwrap();
        assert_eq!((batch.first, batch.last), (1, 4));
        assert_eq!(batch.rows, vec![0, 1, 2, 3]);
        assert_eq!(ring.complete_batch(batch.last), 2);

        let batch = ring.take_batch().unwrap();
        assert_eq!((batch.first, batch.last), (5, 6));
        assert_eq!(batch.rows, vec![4, 5]);
        assert_eq!(ring.complete_batch(batch.last), 0);
        assert!(ring.take_batch().is_none());
    }

    #[test]
    fn test_slots_wrap_but_counters_grow() {
        let ring = RingBuffer::new(4, 4);
        for round in 0..3u32 {
            for i in 0..4 {
                ring.insert(round * 4 + i, || {});
            }
            let batch = ring.take_batch().unwrap();
            assert_eq!(batch.rows, (round * 4..round * 4 + 4).collect::<Vec<_>>());
            ring.complete_batch(batch.last);
        }
        let snap = ring.snapshot();
        assert_eq!((snap.head, snap.tail), (12, 12));
    }

    #[test]
    fn test_full_buffer_blocks_until_tail_advances() {
        let ring = Arc::new(RingBuffer::new(2, 1));
        ring.insert(1u32, || {});
        ring.insert(2u32, || {});

        let inserted = Arc::new(AtomicUsize::new(0));
        let producer = {
            let ring = Arc::clone(&ring);
            let inserted = Arc::clone(&inserted);
            thread::spawn(move || {
                ring.insert(3u32, || {});
                inserted.store(1, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(inserted.load(Ordering::SeqCst), 0);

        let batch = ring.take_batch().unwrap();
        assert_eq!(batch.rows, vec![1]);
        ring.complete_batch(batch.last);

        producer.join().unwrap();
        assert_eq!(inserted.load(Ordering::SeqCst), 1);
        let snap = ring.snapshot();
        assert_eq!((snap.head, snap.tail), (3, 1));
    }

    #[test]
    fn test_worker_terminates_on_shutdown() {
        let ring = Arc::new(RingBuffer::<u32>::new(8, 4));
        let worker = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || ring.run_worker(|| {}))
        };

        ring.shut_down();
        worker.join().unwrap();
        let snap = ring.snapshot();
        assert!(snap.done);
        assert_eq!(snap.worker, WorkerState::Terminated);
    }

    #[test]
    fn test_producer_drains_inline_after_worker_terminated() {
        let ring = Arc::new(RingBuffer::new(2, 2));
        let worker = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || ring.run_worker(|| {}))
        };
        ring.shut_down();
        worker.join().unwrap();

        ring.insert(1u32, || {});
        ring.insert(2u32, || {});

        let drained = AtomicUsize::new(0);
        ring.insert(3u32, || {
            if let Some(batch) = ring.take_batch() {
                drained.fetch_add(batch.rows.len(), Ordering::SeqCst);
                ring.complete_batch(batch.last);
            }
        });

        assert_eq!(drained.load(Ordering::SeqCst), 2);
        assert_eq!(ring.backlog(), 1);
    }
}
