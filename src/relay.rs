//! Backend notification relay
//!
//! Register writes the backend has to act on leave the trap handler
//! through [`NotifyRelay`]. Blocking notifications are delivered before
//! the trap returns (status transitions, queue ready); non-blocking ones
//! are queued and picked up by the backend's own context (queue kicks).

use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

/// Outbound interface of the register state machine.
pub trait NotifyRelay: Send + Sync {
    /// Deliver `value` written at `gpa`; the backend has processed it on return.
    fn notify_sync(&self, gpa: u64, value: u32);

    /// Queue `value` written at `gpa`; returns without waiting for the backend.
    fn notify_async(&self, gpa: u64, value: u32);

    /// Deliver `event` on the path its kind names.
    fn send(&self, event: MmioEvent) {
        match event.kind {
            NotifyKind::Blocking => self.notify_sync(event.gpa, event.value),
            NotifyKind::NonBlocking => self.notify_async(event.gpa, event.value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    Blocking,
    NonBlocking,
}

/// One relayed register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioEvent {
    pub gpa: u64,
    pub value: u32,
    pub kind: NotifyKind,
}

impl MmioEvent {
    pub fn blocking(gpa: u64, value: u32) -> Self {
        Self { gpa, value, kind: NotifyKind::Blocking }
    }

    pub fn non_blocking(gpa: u64, value: u32) -> Self {
        Self { gpa, value, kind: NotifyKind::NonBlocking }
    }
}

/// Out-of-guest device implementation consuming relayed writes.
pub trait VirtioBackend: Send {
    fn on_event(&mut self, event: MmioEvent);
}

/// Default depth of the non-blocking queue.
pub const RELAY_QUEUE_DEPTH: usize = 64;

/// Relay in front of a backend living in the same address space.
///
/// Non-blocking events sit in a bounded FIFO until `drain()`. A blocking
/// event first flushes that FIFO so the backend sees one vCPU's writes in
/// the order the vCPU issued them.
pub struct BackendRelay<B: VirtioBackend> {
    backend: Mutex<B>,
    pending: Mutex<VecDeque<MmioEvent>>,
    depth: usize,
    dropped: AtomicUsize,
}

impl<B: VirtioBackend> BackendRelay<B> {
    pub fn new(backend: B) -> Self {
        Self::with_depth(backend, RELAY_QUEUE_DEPTH)
    }

    pub fn with_depth(backend: B, depth: usize) -> Self {
        Self {
            backend: Mutex::new(backend),
            pending: Mutex::new(VecDeque::with_capacity(depth)),
            depth,
            dropped: AtomicUsize::new(0),
        }
    }

    /// Hand every queued non-blocking event to the backend.
    /// Returns the number of events delivered.
    pub fn drain(&self) -> usize {
        let mut backend = self.backend.lock();
        self.drain_locked(&mut backend)
    }

    fn drain_locked(&self, backend: &mut B) -> usize {
        let mut delivered = 0;
        // Pop one at a time so producers are never blocked behind the backend.
        loop {
            let Some(ev) = self.pending.lock().pop_front() else {
                break;
            };
            backend.on_event(ev);
            delivered += 1;
        }
        delivered
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Non-blocking events lost to a full queue.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Run `f` against the backend (e.g. to inspect state in the backend's context).
    pub fn with_backend<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        f(&mut self.backend.lock())
    }
}

impl<B: VirtioBackend> NotifyRelay for BackendRelay<B> {
    fn notify_sync(&self, gpa: u64, value: u32) {
        let mut backend = self.backend.lock();
        self.drain_locked(&mut backend);
        backend.on_event(MmioEvent::blocking(gpa, value));
    }

    fn notify_async(&self, gpa: u64, value: u32) {
        let mut pending = self.pending.lock();
        if pending.len() >= self.depth {
            drop(pending);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            log::warn!("[RELAY] queue full, dropping notify {:#x}={:#x}", gpa, value);
            return;
        }
        pending.push_back(MmioEvent::non_blocking(gpa, value));
    }
}
