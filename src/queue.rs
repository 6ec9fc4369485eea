//! Completion queue shared by the acceptor and the worker pool.
//!
//! The acceptor thread translates readiness events into slot keys pushed
//! onto an unbounded MPMC channel; workers block on the channel. A per-slot
//! [`Gate`] coalesces notifications so that each connection has at most one
//! completion either queued or being serviced at any time. A connection's
//! next notification therefore never overtakes the servicing of its
//! previous one, which is what serializes per-connection events across the
//! worker pool.
//!
//! Shutdown: [`CompletionQueue::close`] drops the internal sender, so every
//! worker blocked in [`CompletionQueue::recv`] wakes with a disconnected
//! indicator and exits.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

use crossbeam::channel::{self, Receiver, Sender};

const IDLE: u8 = 0;
const QUEUED: u8 = 1;
const RUNNING: u8 = 2;
const RERUN: u8 = 3;

/// Per-slot notification state.
///
/// `Idle -> Queued` on readiness (the only transition that enqueues),
/// `Queued -> Running` when a worker picks the slot up, `Running -> Rerun`
/// when readiness arrives mid-service, and `Rerun -> Running` /
/// `Running -> Idle` when the worker finishes a drain pass.
struct Gate(AtomicU8);

impl Gate {
    const fn new() -> Self {
        Gate(AtomicU8::new(IDLE))
    }

    /// Record observed readiness. Returns true when the caller must push
    /// the slot onto the channel.
    fn notify(&self) -> bool {
        loop {
            match self.0.load(Ordering::Acquire) {
                IDLE => {
                    if self
                        .0
                        .compare_exchange(IDLE, QUEUED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return true;
                    }
                }
                RUNNING => {
                    if self
                        .0
                        .compare_exchange(RUNNING, RERUN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return false;
                    }
                }
                // Already queued or already flagged for a re-run.
                _ => return false,
            }
        }
    }

    /// A worker took ownership of the slot's completion.
    fn begin(&self) {
        self.0.store(RUNNING, Ordering::Release);
    }

    /// The worker drained the socket. Returns true when readiness arrived
    /// mid-service and the worker must run another pass.
    fn finish(&self) -> bool {
        match self
            .0
            .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => false,
            Err(cur) if cur == RERUN => {
                self.0.store(RUNNING, Ordering::Release);
                true
            }
            // Reset raced in (slot released); nothing left to service.
            Err(_) => false,
        }
    }

    fn reset(&self) {
        self.0.store(IDLE, Ordering::Release);
    }
}

/// The shared queue of finished (ready) per-connection operations.
pub struct CompletionQueue {
    tx: Mutex<Option<Sender<usize>>>,
    rx: Receiver<usize>,
    gates: Vec<Gate>,
}

impl CompletionQueue {
    /// Queue for a pool of `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = channel::unbounded();
        let gates = (0..capacity).map(|_| Gate::new()).collect();
        CompletionQueue {
            tx: Mutex::new(Some(tx)),
            rx,
            gates,
        }
    }

    /// Readiness observed for `slot`; enqueue it unless a completion is
    /// already pending or being serviced.
    pub fn notify(&self, slot: usize) {
        if self.gates[slot].notify() {
            if let Some(tx) = self.tx.lock().unwrap().as_ref() {
                // Unbounded channel: send only fails after close, when
                // workers are exiting anyway.
                let _ = tx.send(slot);
            }
        }
    }

    /// Block until the next completion. `None` once the queue is closed.
    pub fn recv(&self) -> Option<usize> {
        self.rx.recv().ok()
    }

    /// A worker took ownership of `slot`'s completion.
    pub fn begin(&self, slot: usize) {
        self.gates[slot].begin();
    }

    /// The servicing worker drained `slot`'s socket. True means readiness
    /// arrived in the meantime and the worker keeps going.
    pub fn finish(&self, slot: usize) -> bool {
        self.gates[slot].finish()
    }

    /// Clear `slot`'s gate so a recycled slot starts clean.
    pub fn reset(&self, slot: usize) {
        self.gates[slot].reset();
    }

    /// Close the queue; every blocked worker wakes and exits.
    pub fn close(&self) {
        self.tx.lock().unwrap().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_enqueues_once() {
        let queue = CompletionQueue::new(4);

        queue.notify(2);
        queue.notify(2);
        queue.notify(2);

        assert_eq!(queue.recv(), Some(2));
        assert!(queue.rx.is_empty());
    }

    #[test]
    fn test_notify_while_running_requests_rerun() {
        let queue = CompletionQueue::new(1);

        queue.notify(0);
        assert_eq!(queue.recv(), Some(0));
        queue.begin(0);

        // Readiness during service: no duplicate queue entry, one re-run.
        queue.notify(0);
        assert!(queue.rx.is_empty());
        assert!(queue.finish(0));
        assert!(!queue.finish(0));

        // Idle again: the next readiness enqueues.
        queue.notify(0);
        assert_eq!(queue.recv(), Some(0));
    }

    #[test]
    fn test_reset_clears_rerun() {
        let queue = CompletionQueue::new(1);

        queue.notify(0);
        assert_eq!(queue.recv(), Some(0));
        queue.begin(0);
        queue.notify(0);

        // Slot released mid-service: the pending re-run is discarded.
        queue.reset(0);
        assert!(!queue.finish(0));
    }

    #[test]
    fn test_close_wakes_receivers() {
        let queue = std::sync::Arc::new(CompletionQueue::new(1));

        let waiter = {
            let queue = std::sync::Arc::clone(&queue);
            std::thread::spawn(move || queue.recv())
        };

        queue.close();
        assert_eq!(waiter.join().unwrap(), None);
    }

    #[test]
    fn test_notify_after_close_is_harmless() {
        let queue = CompletionQueue::new(1);
        queue.close();
        queue.notify(0);
        assert_eq!(queue.recv(), None);
    }
}
