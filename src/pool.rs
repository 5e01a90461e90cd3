//! Frame buffer pool.
//!
//! Buffers live in a `BufferArena` owned by the pool. The driver and the
//! frame sink never hold references into each other; they exchange
//! `BufferId`s and move ownership of a slot with `BufferArena::transfer`.
//!
//! Every slot has exactly one owner at any instant:
//! - `Pool`: allocated but not announced, or revoked
//! - `Driver`: announced, queued for fill or being filled
//! - `Sink`: delivered to the frame observer, waiting to be requeued
//!
//! Data access is granted only to the current owner.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::driver::{BufferId, CameraDriver};
use crate::error::{CaptureError, Result};

/// Party currently holding a frame buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferOwner {
    Pool,
    Driver,
    Sink,
}

/// Number of buffers held by each party.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OwnerCounts {
    pub pool: usize,
    pub driver: usize,
    pub sink: usize,
}

impl OwnerCounts {
    pub fn total(&self) -> usize {
        self.pool + self.driver + self.sink
    }
}

/// Index-addressed storage for a fixed set of frame buffers.
pub struct BufferArena {
    owners: Mutex<Vec<BufferOwner>>,
    changed: Condvar,
    slots: Vec<Mutex<Vec<u8>>>,
    buffer_size: usize,
}

impl BufferArena {
    pub fn new(count: usize, buffer_size: usize) -> Self {
        Self {
            owners: Mutex::new(vec![BufferOwner::Pool; count]),
            changed: Condvar::new(),
            slots: (0..count).map(|_| Mutex::new(vec![0u8; buffer_size])).collect(),
            buffer_size,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn ids(&self) -> impl Iterator<Item = BufferId> {
        (0..self.slots.len()).map(BufferId)
    }

    /// Move a buffer from `from` to `to`. Fails if `from` is not the current owner.
    pub fn transfer(&self, id: BufferId, from: BufferOwner, to: BufferOwner) -> Result<()> {
        let mut owners = self.lock_owners()?;
        let current = owners
            .get_mut(id.0)
            .ok_or_else(|| CaptureError::Allocation(format!("unknown buffer {}", id)))?;
        if *current != from {
            return Err(CaptureError::Ownership {
                buffer: id,
                expected: from,
                actual: *current,
            });
        }
        *current = to;
        drop(owners);
        self.changed.notify_all();
        Ok(())
    }

    pub fn owner(&self, id: BufferId) -> Result<BufferOwner> {
        let owners = self.lock_owners()?;
        owners
            .get(id.0)
            .copied()
            .ok_or_else(|| CaptureError::Allocation(format!("unknown buffer {}", id)))
    }

    pub fn owner_counts(&self) -> Result<OwnerCounts> {
        let owners = self.lock_owners()?;
        let mut counts = OwnerCounts::default();
        for owner in owners.iter() {
            match owner {
                BufferOwner::Pool => counts.pool += 1,
                BufferOwner::Driver => counts.driver += 1,
                BufferOwner::Sink => counts.sink += 1,
            }
        }
        Ok(counts)
    }

    /// Read the buffer contents as `owner`.
    pub fn with_data<R>(
        &self,
        id: BufferId,
        owner: BufferOwner,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R> {
        let slot = self.checked_slot(id, owner)?;
        Ok(f(&slot))
    }

    /// Write the buffer contents as `owner`.
    pub fn with_data_mut<R>(
        &self,
        id: BufferId,
        owner: BufferOwner,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        let mut slot = self.checked_slot(id, owner)?;
        Ok(f(&mut slot))
    }

    /// Block until no buffer is held by `owner`, or the timeout expires.
    /// Returns the number of buffers still held.
    pub fn wait_until_none_held_by(&self, owner: BufferOwner, timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut owners = self.lock_owners()?;
        loop {
            let held = owners.iter().filter(|o| **o == owner).count();
            if held == 0 {
                return Ok(0);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(held);
            }
            let (guard, _) = self
                .changed
                .wait_timeout(owners, deadline - now)
                .map_err(|_| CaptureError::Allocation("buffer owner table poisoned".into()))?;
            owners = guard;
        }
    }

    fn checked_slot(&self, id: BufferId, owner: BufferOwner) -> Result<MutexGuard<'_, Vec<u8>>> {
        let actual = self.owner(id)?;
        if actual != owner {
            return Err(CaptureError::Ownership {
                buffer: id,
                expected: owner,
                actual,
            });
        }
        self.slots[id.0]
            .lock()
            .map_err(|_| CaptureError::Allocation(format!("buffer {} poisoned", id)))
    }

    fn lock_owners(&self) -> Result<MutexGuard<'_, Vec<BufferOwner>>> {
        self.owners
            .lock()
            .map_err(|_| CaptureError::Allocation("buffer owner table poisoned".into()))
    }
}

/// Fixed set of buffers announced to one camera driver.
pub struct FrameBufferPool {
    arena: Arc<BufferArena>,
    driver: Arc<dyn CameraDriver>,
    released: bool,
}

impl FrameBufferPool {
    /// Allocate `count` buffers of `size` bytes and announce each to the driver.
    ///
    /// If the driver rejects any buffer, the ones already announced are revoked
    /// and the whole allocation fails.
    pub fn allocate(driver: Arc<dyn CameraDriver>, count: usize, size: usize) -> Result<Self> {
        if count == 0 {
            return Err(CaptureError::Allocation("buffer count must be > 0".into()));
        }
        if size == 0 {
            return Err(CaptureError::Allocation("payload size must be > 0".into()));
        }

        let arena = Arc::new(BufferArena::new(count, size));
        for id in arena.ids() {
            arena.transfer(id, BufferOwner::Pool, BufferOwner::Driver)?;
            if let Err(err) = driver.announce_frame(&arena, id) {
                arena.transfer(id, BufferOwner::Driver, BufferOwner::Pool)?;
                if let Err(revoke_err) = driver.revoke_all_frames() {
                    log::error!(
                        "{}: revoking partially announced pool failed: {}",
                        driver.id(),
                        revoke_err
                    );
                }
                reclaim_driver_buffers(&arena)?;
                return Err(CaptureError::Allocation(format!(
                    "driver rejected buffer {} of {}: {}",
                    id.0 + 1,
                    count,
                    err
                )));
            }
        }

        log::debug!(
            "{}: announced {} frame buffers of {} bytes",
            driver.id(),
            count,
            size
        );

        Ok(Self {
            arena,
            driver,
            released: false,
        })
    }

    pub fn arena(&self) -> &Arc<BufferArena> {
        &self.arena
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn buffer_size(&self) -> usize {
        self.arena.buffer_size()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Revoke every buffer from the driver and return it to the pool.
    ///
    /// Capture must already be stopped and the queue flushed. Buffers still
    /// held by the sink are waited for up to `drain_timeout`; if any remain the
    /// release fails rather than handing live storage back.
    pub fn release(&mut self, drain_timeout: Duration) -> Result<()> {
        if self.released {
            return Ok(());
        }

        let held = self
            .arena
            .wait_until_none_held_by(BufferOwner::Sink, drain_timeout)?;
        if held > 0 {
            return Err(CaptureError::Allocation(format!(
                "{} buffer(s) still in flight after {:?}",
                held, drain_timeout
            )));
        }

        self.driver.revoke_all_frames()?;
        reclaim_driver_buffers(&self.arena)?;
        self.released = true;
        log::debug!("{}: frame buffers revoked", self.driver.id());
        Ok(())
    }
}

fn reclaim_driver_buffers(arena: &BufferArena) -> Result<()> {
    for id in arena.ids() {
        if arena.owner(id)? == BufferOwner::Driver {
            arena.transfer(id, BufferOwner::Driver, BufferOwner::Pool)?;
        }
    }
    Ok(())
}

impl Drop for FrameBufferPool {
    fn drop(&mut self) {
        if !self.released {
            if let Err(err) = self.release(Duration::ZERO) {
                log::error!("{}: frame buffer release failed: {}", self.driver.id(), err);
            }
        }
    }
}
