//! Generational handle registry.
//!
//! Each slot packs `generation << 32 | refcount` into one atomic word, so a
//! stale handle can never bump the refcount of a recycled slot. Releasing the
//! last strong reference only queues the slot; the value is destroyed and the
//! generation advanced once the frame that last touched it has retired.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use rgfx_protocol::{FrameId, ResourceType};

use crate::handle::Handle;

const REFS_MASK: u64 = 0xFFFF_FFFF;

fn pack(generation: u32, refs: u32) -> u64 {
    (u64::from(generation) << 32) | u64::from(refs)
}

fn generation_of(word: u64) -> u32 {
    (word >> 32) as u32
}

fn refs_of(word: u64) -> u32 {
    (word & REFS_MASK) as u32
}

struct Slot<T> {
    state: AtomicU64,
    kind: AtomicU8,
    last_used: AtomicU64,
    value: RwLock<Option<T>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            state: AtomicU64::new(pack(1, 0)),
            kind: AtomicU8::new(ResourceType::None as u8),
            last_used: AtomicU64::new(0),
            value: RwLock::new(None),
        }
    }
}

/// Slot waiting for its frame to retire.
#[derive(Debug, Clone, Copy)]
struct PendingDestroy {
    index: u32,
    generation: u32,
    frame: u64,
}

/// Anything that can answer "is this handle still alive".
pub trait HandleValidator: Send + Sync {
    fn is_alive(&self, handle: Handle) -> bool;
}

pub struct HandleRegistry<T> {
    name: &'static str,
    slots: Box<[Slot<T>]>,
    /// Bit set = slot allocated (alive or awaiting destruction).
    used: Box<[AtomicU64]>,
    pending_tx: Sender<PendingDestroy>,
    pending_rx: Receiver<PendingDestroy>,
    current_frame: AtomicU64,
    live: AtomicUsize,
}

impl<T> HandleRegistry<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.clamp(1, u32::MAX as usize - 1);
        let words = capacity.div_ceil(64);
        let used: Box<[AtomicU64]> = (0..words)
            .map(|w| {
                // Bits past the capacity are permanently taken.
                let valid = capacity.saturating_sub(w * 64).min(64);
                let mask = if valid == 64 { 0 } else { !0u64 << valid };
                AtomicU64::new(mask)
            })
            .collect();
        let (pending_tx, pending_rx) = crossbeam_channel::unbounded();

        Self {
            name,
            slots: (0..capacity).map(|_| Slot::new()).collect(),
            used,
            pending_tx,
            pending_rx,
            current_frame: AtomicU64::new(0),
            live: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of handles with a positive refcount.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    fn claim_slot(&self) -> Option<u32> {
        for (word_index, word) in self.used.iter().enumerate() {
            let mut current = word.load(Ordering::Relaxed);
            while current != u64::MAX {
                let bit = (!current).trailing_zeros();
                match word.compare_exchange_weak(
                    current,
                    current | (1u64 << bit),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Some((word_index * 64) as u32 + bit),
                    Err(actual) => current = actual,
                }
            }
        }
        None
    }

    fn free_slot(&self, index: u32) {
        let word = &self.used[index as usize / 64];
        word.fetch_and(!(1u64 << (index % 64)), Ordering::AcqRel);
    }

    fn slot(&self, handle: Handle) -> Option<&Slot<T>> {
        if !handle.is_valid() {
            return None;
        }
        self.slots.get(handle.index() as usize)
    }

    /// Allocate a slot holding `value` with one strong reference.
    /// Returns the invalid handle when the registry is full.
    pub fn allocate(&self, kind: ResourceType, value: T) -> Handle {
        let Some(index) = self.claim_slot() else {
            warn!(registry = self.name, capacity = self.capacity(), "handle registry exhausted");
            return Handle::invalid();
        };

        let slot = &self.slots[index as usize];
        *slot.value.write() = Some(value);
        slot.kind.store(kind as u8, Ordering::Relaxed);
        slot.last_used
            .store(self.current_frame.load(Ordering::Relaxed), Ordering::Relaxed);

        let generation = generation_of(slot.state.load(Ordering::Acquire));
        slot.state.store(pack(generation, 1), Ordering::Release);
        self.live.fetch_add(1, Ordering::Relaxed);

        let handle = Handle::new(index, generation, kind);
        trace!(registry = self.name, %handle, "allocated");
        handle
    }

    /// Add a strong reference. Returns the invalid handle if `handle` is dead.
    pub fn acquire(&self, handle: Handle) -> Handle {
        let Some(slot) = self.slot(handle) else {
            return Handle::invalid();
        };
        if slot.kind.load(Ordering::Relaxed) != handle.kind() as u8 {
            return Handle::invalid();
        }

        let mut word = slot.state.load(Ordering::Acquire);
        loop {
            if generation_of(word) != handle.generation() || refs_of(word) == 0 {
                return Handle::invalid();
            }
            if refs_of(word) == u32::MAX {
                warn!(registry = self.name, %handle, "refcount saturated");
                return Handle::invalid();
            }
            match slot.state.compare_exchange_weak(
                word,
                word + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return handle,
                Err(actual) => word = actual,
            }
        }
    }

    /// Drop a strong reference. The last release queues destruction for the
    /// frame that last used the slot. Returns false for a dead handle.
    pub fn release(&self, handle: Handle) -> bool {
        let Some(slot) = self.slot(handle) else {
            return false;
        };

        let mut word = slot.state.load(Ordering::Acquire);
        loop {
            if generation_of(word) != handle.generation() || refs_of(word) == 0 {
                return false;
            }
            match slot.state.compare_exchange_weak(
                word,
                word - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => word = actual,
            }
        }

        if refs_of(word) == 1 {
            self.live.fetch_sub(1, Ordering::Relaxed);
            let frame = self
                .current_frame
                .load(Ordering::Relaxed)
                .max(slot.last_used.load(Ordering::Relaxed));
            let pending = PendingDestroy {
                index: handle.index(),
                generation: handle.generation(),
                frame,
            };
            // The receiver lives as long as `self`.
            let _ = self.pending_tx.send(pending);
            trace!(registry = self.name, %handle, frame, "queued for destruction");
        }
        true
    }

    pub fn is_alive(&self, handle: Handle) -> bool {
        let Some(slot) = self.slot(handle) else {
            return false;
        };
        let word = slot.state.load(Ordering::Acquire);
        generation_of(word) == handle.generation()
            && refs_of(word) > 0
            && slot.kind.load(Ordering::Relaxed) == handle.kind() as u8
    }

    /// Current strong refcount, zero for dead handles.
    pub fn ref_count(&self, handle: Handle) -> u32 {
        match self.slot(handle) {
            Some(slot) => {
                let word = slot.state.load(Ordering::Acquire);
                if generation_of(word) == handle.generation() {
                    refs_of(word)
                } else {
                    0
                }
            }
            None => 0,
        }
    }

    /// Record that `frame` references the resource, postponing destruction
    /// until that frame retires.
    pub fn mark_used(&self, handle: Handle, frame: FrameId) -> bool {
        if !self.is_alive(handle) {
            return false;
        }
        if let Some(slot) = self.slot(handle) {
            slot.last_used.fetch_max(frame.unique(), Ordering::Relaxed);
        }
        true
    }

    /// Weak lookup: run `f` on the value if the handle is alive.
    pub fn with<R>(&self, handle: Handle, f: impl FnOnce(&T) -> R) -> Option<R> {
        if !self.is_alive(handle) {
            return None;
        }
        let slot = self.slot(handle)?;
        let guard = slot.value.read();
        guard.as_ref().map(f)
    }

    /// Frame that later destruction requests are stamped with.
    pub fn set_current_frame(&self, frame: FrameId) {
        self.current_frame.fetch_max(frame.unique(), Ordering::Relaxed);
    }

    /// Destroy every queued slot whose frame is `<= retired`, advancing its
    /// generation. Returns the destroyed values with their former handles.
    pub fn retire(&self, retired: FrameId) -> Vec<(Handle, T)> {
        self.drain_pending(|frame| frame <= retired.unique())
    }

    /// Destroy every queued slot regardless of frame. Used once the device is
    /// idle.
    pub fn retire_all(&self) -> Vec<(Handle, T)> {
        self.drain_pending(|_| true)
    }

    fn drain_pending(&self, ready: impl Fn(u64) -> bool) -> Vec<(Handle, T)> {
        let mut destroyed = Vec::new();
        let mut deferred = Vec::new();

        for pending in self.pending_rx.try_iter() {
            if !ready(pending.frame) {
                deferred.push(pending);
                continue;
            }
            let slot = &self.slots[pending.index as usize];
            let word = slot.state.load(Ordering::Acquire);
            if generation_of(word) != pending.generation || refs_of(word) != 0 {
                debug!(registry = self.name, index = pending.index, "skipping stale destroy request");
                continue;
            }

            let value = slot.value.write().take();
            let kind = ResourceType::from_raw(slot.kind.swap(ResourceType::None as u8, Ordering::Relaxed));
            slot.state.store(pack(pending.generation.wrapping_add(1).max(1), 0), Ordering::Release);
            self.free_slot(pending.index);

            if let Some(value) = value {
                destroyed.push((Handle::new(pending.index, pending.generation, kind), value));
            }
        }

        for pending in deferred {
            let _ = self.pending_tx.send(pending);
        }
        if !destroyed.is_empty() {
            debug!(registry = self.name, count = destroyed.len(), "retired handles");
        }
        destroyed
    }
}

impl<T: Clone> HandleRegistry<T> {
    /// Weak lookup returning a copy of the value.
    pub fn get(&self, handle: Handle) -> Option<T> {
        self.with(handle, T::clone)
    }
}

impl<T: Send + Sync> HandleValidator for HandleRegistry<T> {
    fn is_alive(&self, handle: Handle) -> bool {
        HandleRegistry::is_alive(self, handle)
    }
}

/// Owning reference. Cloning acquires, dropping releases.
pub struct StrongHandle<T> {
    registry: Arc<HandleRegistry<T>>,
    handle: Handle,
}

impl<T> StrongHandle<T> {
    /// Allocate a new value and wrap the resulting reference.
    /// `None` when the registry is full.
    pub fn allocate(registry: &Arc<HandleRegistry<T>>, kind: ResourceType, value: T) -> Option<Self> {
        let handle = registry.allocate(kind, value);
        handle
            .is_valid()
            .then(|| Self { registry: Arc::clone(registry), handle })
    }

    /// Take an extra reference on an existing handle.
    pub fn acquire(registry: &Arc<HandleRegistry<T>>, handle: Handle) -> Option<Self> {
        let handle = registry.acquire(handle);
        handle
            .is_valid()
            .then(|| Self { registry: Arc::clone(registry), handle })
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }
}

impl<T> Clone for StrongHandle<T> {
    fn clone(&self) -> Self {
        // A strong reference keeps the slot alive, so this cannot fail.
        let handle = self.registry.acquire(self.handle);
        debug_assert!(handle.is_valid());
        Self { registry: Arc::clone(&self.registry), handle }
    }
}

impl<T> Drop for StrongHandle<T> {
    fn drop(&mut self) {
        self.registry.release(self.handle);
    }
}

impl<T> std::fmt::Debug for StrongHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StrongHandle").field(&self.handle).finish()
    }
}
