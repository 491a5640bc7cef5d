//! # Descriptor Rings
//!
//! ## Purpose
//!
//! A descriptor ring is the fixed-size queue a NIC and the driver share for RX or TX.
//! One side produces descriptors, the other consumes them, and neither side ever
//! blocks: a full ring refuses new entries, an empty ring yields nothing.
//!
//! ## How it works
//!
//! Slots are a power-of-two array indexed with `index & mod_mask`. The producer and
//! consumer positions are free-running `u32` counters published with release stores and
//! read with acquire loads, so a slot is written before it becomes visible to the other
//! side. The usable capacity may be smaller than the slot count, which lets a ring honour
//! a descriptor count that is not a power of two.
//!
//! `ring()` returns the two halves. Each half is `Send` but not `Clone`, so exactly one
//! thread can produce and exactly one can consume.
//!
//! ## Main components
//!
//! - `Producer<T>`: `push`, `push_burst`, `free_count`.
//! - `Consumer<T>`: `pop`, `pop_burst`, `count`.

use arrayvec::ArrayVec;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::{fmt, io};

struct Shared<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mod_mask: u32,
    capacity: u32,
    producer: AtomicU32,
    consumer: AtomicU32,
}

// Slots are only touched by the side that currently owns them, as published through
// the producer and consumer counters.
unsafe impl<T: Send> Sync for Shared<T> {}
unsafe impl<T: Send> Send for Shared<T> {}

impl<T> Shared<T> {
    #[inline]
    fn slot(&self, index: u32) -> *mut MaybeUninit<T> {
        self.slots[(index & self.mod_mask) as usize].get()
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        let producer = *self.producer.get_mut();
        let mut consumer = *self.consumer.get_mut();
        while consumer != producer {
            unsafe { (*self.slot(consumer)).assume_init_drop() };
            consumer = consumer.wrapping_add(1);
        }
    }
}

/// Writing half of a ring.
pub struct Producer<T> {
    ring: Arc<Shared<T>>,
    head: u32,
    cached_consumer: u32,
}

/// Reading half of a ring.
pub struct Consumer<T> {
    ring: Arc<Shared<T>>,
    tail: u32,
    cached_producer: u32,
}

/// Creates a ring that holds at most `capacity` entries.
pub fn ring<T>(capacity: usize) -> io::Result<(Producer<T>, Consumer<T>)> {
    if capacity == 0 || capacity > (1 << 31) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid ring capacity {capacity}"),
        ));
    }
    let len = capacity.next_power_of_two();
    let slots = (0..len)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let ring = Arc::new(Shared {
        slots,
        mod_mask: (len - 1) as u32,
        capacity: capacity as u32,
        producer: AtomicU32::new(0),
        consumer: AtomicU32::new(0),
    });
    Ok((
        Producer {
            ring: ring.clone(),
            head: 0,
            cached_consumer: 0,
        },
        Consumer {
            ring,
            tail: 0,
            cached_producer: 0,
        },
    ))
}

impl<T> Producer<T> {
    /// Number of entries that can be pushed right now.
    ///
    /// The consumer index is re-read only when the cached view has less than `wanted` free.
    #[inline]
    pub fn free_count(&mut self, wanted: usize) -> usize {
        let free = (self.ring.capacity - self.head.wrapping_sub(self.cached_consumer)) as usize;
        if free >= wanted {
            return free;
        }
        self.cached_consumer = self.ring.consumer.load(Ordering::Acquire);
        (self.ring.capacity - self.head.wrapping_sub(self.cached_consumer)) as usize
    }

    /// Pushes one entry, handing it back if the ring is full.
    pub fn push(&mut self, item: T) -> Result<(), T> {
        if self.free_count(1) == 0 {
            return Err(item);
        }
        unsafe { (*self.ring.slot(self.head)).write(item) };
        self.head = self.head.wrapping_add(1);
        self.ring.producer.store(self.head, Ordering::Release);
        Ok(())
    }

    /// Moves as many entries as fit from the front of `items` into the ring.
    ///
    /// Returns the number of entries moved; the rest stay in `items` in order.
    pub fn push_burst<const N: usize>(&mut self, items: &mut ArrayVec<T, N>) -> usize {
        let n = self.free_count(items.len()).min(items.len());
        if n == 0 {
            return 0;
        }
        for item in items.drain(..n) {
            unsafe { (*self.ring.slot(self.head)).write(item) };
            self.head = self.head.wrapping_add(1);
        }
        self.ring.producer.store(self.head, Ordering::Release);
        n
    }
}

impl<T> Consumer<T> {
    /// Number of entries ready to be popped.
    ///
    /// The producer index is re-read only when the cached view has less than `wanted` ready.
    #[inline]
    pub fn count(&mut self, wanted: usize) -> usize {
        let ready = self.cached_producer.wrapping_sub(self.tail) as usize;
        if ready >= wanted {
            return ready;
        }
        self.cached_producer = self.ring.producer.load(Ordering::Acquire);
        self.cached_producer.wrapping_sub(self.tail) as usize
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.count(1) == 0 {
            return None;
        }
        let item = unsafe { (*self.ring.slot(self.tail)).assume_init_read() };
        self.tail = self.tail.wrapping_add(1);
        self.ring.consumer.store(self.tail, Ordering::Release);
        Some(item)
    }

    /// Appends up to `max` entries to `out`, bounded by the room left in `out`.
    pub fn pop_burst<const N: usize>(&mut self, out: &mut ArrayVec<T, N>, max: usize) -> usize {
        let wanted = max.min(out.remaining_capacity());
        let n = self.count(wanted).min(wanted);
        if n == 0 {
            return 0;
        }
        for _ in 0..n {
            let item = unsafe { (*self.ring.slot(self.tail)).assume_init_read() };
            out.push(item);
            self.tail = self.tail.wrapping_add(1);
        }
        self.ring.consumer.store(self.tail, Ordering::Release);
        n
    }
}

impl<T> fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("capacity", &self.ring.capacity)
            .field("head", &self.head)
            .finish()
    }
}

impl<T> fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("capacity", &self.ring.capacity)
            .field("tail", &self.tail)
            .finish()
    }
}
