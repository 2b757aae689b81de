//! Two-Lock Growable Blocking Queue
//!
//! Circular array with separate head and tail locks so producers and
//! consumers do not contend. When full, `offer` grows the array under both
//! locks (tail first, then head; every path that takes both uses that order).
//!
//! ```text
//!        head                tail
//!         v                   v
//!  [ . . a b c d e f g . . . . . ]   size = 7
//! ```
//!
//! Consumers block on a not-empty condition. A producer that moves the queue
//! from empty to non-empty wakes one consumer; a consumer that leaves items
//! behind wakes the next, so wakeups are chained rather than broadcast.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::error::QueueError;

pub const DEFAULT_CAPACITY: usize = 128;
pub const DEFAULT_GROWTH: usize = 64;

/// Cooperative interruption flag for a blocked consumer.
///
/// Setting it does not wake anyone by itself: follow with
/// [`BlockingArrayQueue::wake_all`].
#[derive(Debug, Default)]
pub struct Interrupt(AtomicBool);

impl Interrupt {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn interrupt(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Clears the flag, returning whether it was set.
    pub fn clear(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

struct Slot<T> {
    data: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    const fn new() -> Self {
        Self {
            data: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

fn slots<T>(n: usize) -> Box<[Slot<T>]> {
    (0..n).map(|_| Slot::new()).collect()
}

/// Head and tail locks on separate cache lines.
#[repr(C, align(64))]
struct CacheLinePadded<T> {
    value: T,
}

pub struct BlockingArrayQueue<T> {
    head: CacheLinePadded<Mutex<usize>>,
    tail: CacheLinePadded<Mutex<usize>>,
    not_empty: Condvar,
    size: AtomicUsize,
    elements: UnsafeCell<Box<[Slot<T>]>>,
    grow_by: usize,
    limit: usize,
}

// SAFETY: slots are only touched under the lock that owns their end of the
// queue: producers write the slot at `tail` (under the tail lock, only while
// size < capacity), consumers read the slot at `head` (under the head lock,
// only while size > 0). The array itself is replaced only while both locks
// are held. `size` is updated with AcqRel after the slot access, so a slot
// write is visible before the count that announces it.
unsafe impl<T: Send> Send for BlockingArrayQueue<T> {}
unsafe impl<T: Send> Sync for BlockingArrayQueue<T> {}

impl<T> Default for BlockingArrayQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BlockingArrayQueue<T> {
    /// Growable queue starting at 128 slots, growing by 64.
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_CAPACITY, DEFAULT_GROWTH, usize::MAX)
    }

    /// Growable queue; `grow_by == 0` disables growth.
    pub fn with_capacity(capacity: usize, grow_by: usize) -> Self {
        Self::with_limit(capacity, grow_by, usize::MAX)
    }

    /// Fixed-size queue of `capacity` slots.
    pub fn bounded(capacity: usize) -> Self {
        Self::with_limit(capacity, 0, capacity)
    }

    /// Growable queue that never holds more than `limit` items.
    pub fn with_limit(capacity: usize, grow_by: usize, limit: usize) -> Self {
        Self {
            head: CacheLinePadded { value: Mutex::new(0) },
            tail: CacheLinePadded { value: Mutex::new(0) },
            not_empty: Condvar::new(),
            size: AtomicUsize::new(0),
            elements: UnsafeCell::new(slots(capacity)),
            grow_by,
            limit,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current array length.
    pub fn capacity(&self) -> usize {
        let _tail = self.tail.value.lock();
        let _head = self.head.value.lock();
        // SAFETY: both locks held, the array cannot be replaced.
        unsafe { (&(*self.elements.get())).len() }
    }

    /// Free slots before the next growth.
    pub fn remaining_capacity(&self) -> usize {
        let _tail = self.tail.value.lock();
        let _head = self.head.value.lock();
        // SAFETY: both locks held.
        let capacity = unsafe { (&(*self.elements.get())).len() };
        capacity - self.len()
    }

    /// Largest number of items the queue will hold.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Appends `item`, growing if full. Hands the item back when the limit is
    /// reached or growth is disabled.
    pub fn offer(&self, item: T) -> Result<(), T> {
        let was_empty = {
            let mut tail = self.tail.value.lock();
            let size = self.size.load(Ordering::Acquire);
            if size >= self.limit {
                return Err(item);
            }

            // SAFETY: tail lock held; only growth (which also needs the tail
            // lock) replaces the array.
            let mut capacity = unsafe { (&(*self.elements.get())).len() };
            if size == capacity {
                if !self.grow(&mut tail) {
                    return Err(item);
                }
                // SAFETY: as above.
                capacity = unsafe { (&(*self.elements.get())).len() };
            }

            let index = *tail;
            // SAFETY: size < capacity, so the slot at tail is vacant and no
            // consumer reads it until size is incremented below.
            unsafe {
                let elements = &*self.elements.get();
                (*elements[index].data.get()).write(item);
            }
            *tail = (index + 1) % capacity;
            self.size.fetch_add(1, Ordering::AcqRel) == 0
        };

        if was_empty {
            let _head = self.head.value.lock();
            self.not_empty.notify_one();
        }
        Ok(())
    }

    /// Appends `item` or fails with [`QueueError::Full`], dropping it.
    pub fn put(&self, item: T) -> Result<(), QueueError> {
        self.offer(item).map_err(|_| QueueError::Full)
    }

    /// Reallocates with `grow_by` more slots, unwrapping the ring so that
    /// head lands at index 0. Caller holds the tail lock.
    fn grow(&self, tail: &mut MutexGuard<'_, usize>) -> bool {
        if self.grow_by == 0 {
            return false;
        }
        let mut head = self.head.value.lock();

        // SAFETY: tail and head locks held; no other thread touches the array.
        let old = unsafe { &mut *self.elements.get() };
        let size = self.size.load(Ordering::Acquire);
        let old_capacity = old.len();
        let new_capacity = old_capacity.saturating_add(self.grow_by).min(self.limit.max(old_capacity + 1));
        let fresh = slots::<T>(new_capacity);

        for i in 0..size {
            let from = (*head + i) % old_capacity;
            // SAFETY: the `size` slots starting at head are initialized; each
            // is moved exactly once and the old array is then discarded
            // without dropping its contents (MaybeUninit never drops).
            unsafe {
                let value = (*old[from].data.get()).assume_init_read();
                (*fresh[i].data.get()).write(value);
            }
        }

        *old = fresh;
        *head = 0;
        **tail = size % new_capacity;
        true
    }

    /// Removes the head item without waiting.
    pub fn poll(&self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let mut head = self.head.value.lock();
        self.dequeue(&mut head)
    }

    /// Removes the head item, waiting while the queue is empty.
    pub fn take(&self, interrupt: &Interrupt) -> Result<T, QueueError> {
        let mut head = self.head.value.lock();
        loop {
            if interrupt.is_interrupted() {
                self.not_empty.notify_one();
                return Err(QueueError::Interrupted);
            }
            if let Some(item) = self.dequeue(&mut head) {
                return Ok(item);
            }
            self.not_empty.wait(&mut head);
        }
    }

    /// Removes the head item, waiting up to `timeout`. `Ok(None)` on timeout.
    pub fn poll_timeout(&self, timeout: Duration, interrupt: &Interrupt) -> Result<Option<T>, QueueError> {
        let deadline = Instant::now() + timeout;
        let mut head = self.head.value.lock();
        loop {
            if interrupt.is_interrupted() {
                self.not_empty.notify_one();
                return Err(QueueError::Interrupted);
            }
            if let Some(item) = self.dequeue(&mut head) {
                return Ok(Some(item));
            }
            if self.not_empty.wait_until(&mut head, deadline).timed_out() {
                return Ok(self.dequeue(&mut head));
            }
        }
    }

    /// Head-side removal; caller holds the head lock.
    fn dequeue(&self, head: &mut MutexGuard<'_, usize>) -> Option<T> {
        if self.size.load(Ordering::Acquire) == 0 {
            return None;
        }
        let index = **head;
        // SAFETY: head lock held and size > 0, so the slot at head is
        // initialized and no producer writes it until size is decremented.
        let (item, capacity) = unsafe {
            let elements = &*self.elements.get();
            ((*elements[index].data.get()).assume_init_read(), elements.len())
        };
        **head = (index + 1) % capacity;

        if self.size.fetch_sub(1, Ordering::AcqRel) > 1 {
            self.not_empty.notify_one();
        }
        Some(item)
    }

    /// Drops every queued item.
    pub fn clear(&self) {
        let mut tail = self.tail.value.lock();
        let mut head = self.head.value.lock();
        // SAFETY: both locks held.
        unsafe { self.drain_unlocked(*head) };
        *head = 0;
        *tail = 0;
    }

    /// Drops the `size` items starting at `head`.
    ///
    /// # Safety
    /// Caller must hold both locks or have exclusive access.
    unsafe fn drain_unlocked(&self, head: usize) {
        let elements = &*self.elements.get();
        let capacity = elements.len();
        let size = self.size.swap(0, Ordering::AcqRel);
        for i in 0..size {
            let index = (head + i) % capacity;
            (*elements[index].data.get()).assume_init_drop();
        }
    }

    /// Wakes every blocked consumer so they re-check their interrupt.
    pub fn wake_all(&self) {
        let _head = self.head.value.lock();
        self.not_empty.notify_all();
    }
}

impl<T> Drop for BlockingArrayQueue<T> {
    fn drop(&mut self) {
        let head = *self.head.value.get_mut();
        // SAFETY: &mut self gives exclusive access.
        unsafe { self.drain_unlocked(head) };
    }
}
