use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::Notify;

/// Upper bound on channels per connection; one bit per channel.
pub const MAX_CHANNELS: u32 = 32;

/// Exclusive lease over a fixed set of channels.
///
/// A set bit in `locked` means the channel is leased. `lock` scans for the
/// lowest clear bit and parks on `released` when none is free.
pub struct ChannelPool {
    locked: AtomicU32,
    all: u32,
    released: Notify,
}

impl ChannelPool {
    pub fn new(channels: u32) -> Self {
        let channels = channels.clamp(1, MAX_CHANNELS);
        let all = if channels == MAX_CHANNELS { u32::MAX } else { (1u32 << channels) - 1 };
        Self { locked: AtomicU32::new(0), all, released: Notify::new() }
    }

    pub fn channel_count(&self) -> u32 {
        self.all.count_ones()
    }

    /// Lease a free channel, waiting until one is released.
    pub async fn lock(&self) -> ChannelGuard<'_> {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // Register before re-checking so a release in between is not missed.
            notified.as_mut().enable();
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            notified.await;
        }
    }

    /// Lease a free channel without waiting.
    pub fn try_lock(&self) -> Option<ChannelGuard<'_>> {
        let mut current = self.locked.load(Ordering::Acquire);
        loop {
            let free = !current & self.all;
            if free == 0 {
                return None;
            }
            let slot = free.trailing_zeros();
            match self.locked.compare_exchange_weak(
                current,
                current | (1 << slot),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(ChannelGuard { pool: self, slot }),
                Err(actual) => current = actual,
            }
        }
    }

    /// Release `slot`. Prefer dropping the guard.
    pub fn unlock(&self, slot: u32) {
        let prev = self.locked.fetch_and(!(1 << slot), Ordering::AcqRel);
        debug_assert!(prev & (1 << slot) != 0, "channel {} unlocked twice", slot);
        self.released.notify_one();
    }

    pub fn locked_count(&self) -> u32 {
        self.locked.load(Ordering::Acquire).count_ones()
    }
}

/// Lease on one channel; released on drop.
pub struct ChannelGuard<'a> {
    pool: &'a ChannelPool,
    slot: u32,
}

impl ChannelGuard<'_> {
    pub fn slot(&self) -> u32 {
        self.slot
    }
}

impl Drop for ChannelGuard<'_> {
    fn drop(&mut self) {
        self.pool.unlock(self.slot);
    }
}
