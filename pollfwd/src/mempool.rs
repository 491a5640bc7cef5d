//! # Packet Buffer Pool
//!
//! ## Purpose
//!
//! Every packet the forwarder touches lives in a buffer taken from a `Mempool`: a fixed
//! number of fixed-size elements carved out of one mapping at startup. Nothing is
//! allocated per packet. When the pool runs dry, `get` returns `None` and the caller
//! drops traffic instead of waiting.
//!
//! ## How it works
//!
//! Buffers are handed out as `Mbuf` handles: an element index plus the offset and length
//! of the valid data inside the element. A handle is neither `Clone` nor `Copy`, so it
//! always has exactly one owner (an RX ring, the application, a TX ring or the free list).
//! The bytes are reached through the pool, which checks that the handle belongs to it.
//!
//! Free element indices sit in a lock-free bounded queue shared by all lanes. Each lane
//! keeps a `PoolCache` in front of it that moves indices in batches, so the shared queue
//! is not touched for every packet.
//!
//! In debug builds the pool records which elements are out, and asserts on double
//! release and on handles that were never handed out.
//!
//! ## Main components
//!
//! - `Mempool`: `create`, `get`, `put`, data accessors, population counters.
//! - `Mbuf`: the buffer handle.
//! - `PoolCache`: per-lane cache.

use crate::mmap::OwnedMmap;
use crate::numa;
use crossbeam::queue::ArrayQueue;
use static_assertions::const_assert;
use std::cell::Cell;
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

#[cfg(debug_assertions)]
use std::sync::atomic::AtomicBool;

/// Bytes reserved in front of the packet data in every buffer.
pub const MBUF_HEADROOM: u16 = 128;
/// Default data room: a 2KB frame plus the headroom.
pub const DEFAULT_DATA_ROOM: u16 = 2048 + MBUF_HEADROOM;
/// Largest per-lane cache a pool accepts.
pub const MAX_CACHE_SIZE: usize = 512;
/// Buffers provisioned per port.
pub const NUM_MBUFS: usize = 8191;
/// Per-lane cache size used by the forwarder.
pub const MBUF_CACHE_SIZE: usize = 250;
/// `Mbuf::port` value of a buffer that did not arrive on a port.
pub const NO_PORT: u16 = u16::MAX;

const CACHE_LINE: usize = 64;

const_assert!(DEFAULT_DATA_ROOM as usize % CACHE_LINE == 0);
const_assert!(MBUF_CACHE_SIZE <= MAX_CACHE_SIZE);

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);

/// Options for the memory backing a pool.
#[derive(Debug, Copy, Clone, Default)]
pub struct PoolConfig {
    /// Huge page backing.
    ///
    /// - `Some(true)`: require huge pages, creation fails without them.
    /// - `Some(false)`: regular pages.
    /// - `None`: huge pages if enough are free.
    pub huge_page: Option<bool>,
}

/// Handle to one packet buffer.
#[must_use = "a buffer must be transmitted or released back to its pool"]
#[derive(Debug, PartialEq, Eq)]
pub struct Mbuf {
    pool: u32,
    index: u32,
    data_off: u16,
    data_len: u16,
    port: u16,
}

impl Mbuf {
    /// Length of the valid data.
    #[inline]
    pub fn len(&self) -> usize {
        self.data_len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data_len == 0
    }

    /// Offset of the data from the start of the element.
    #[inline]
    pub fn data_off(&self) -> usize {
        self.data_off as usize
    }

    /// Element index inside the owning pool.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Port the buffer was received on.
    #[inline]
    pub fn port(&self) -> Option<u16> {
        (self.port != NO_PORT).then_some(self.port)
    }

    #[inline]
    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }
}

/// A fixed-capacity pool of packet buffers.
pub struct Mempool {
    name: String,
    id: u32,
    mem: OwnedMmap,
    elt_size: usize,
    data_room: usize,
    size: u32,
    cache_size: usize,
    socket_id: i32,
    free: ArrayQueue<u32>,
    caches: Mutex<Vec<Weak<AtomicUsize>>>,
    #[cfg(debug_assertions)]
    taken: Box<[AtomicBool]>,
}

// The mapping is only reached through `Mbuf` handles, and every element index is owned
// by at most one handle at a time.
unsafe impl Send for Mempool {}
unsafe impl Sync for Mempool {}

impl Mempool {
    /// Creates a pool of `n` buffers of `data_room_size` bytes each.
    ///
    /// # Arguments
    /// * `name` - Pool name, used in diagnostics.
    /// * `n` - Number of buffers. Fixed for the lifetime of the pool.
    /// * `cache_size` - Buffers each `PoolCache` keeps in front of the shared free list.
    /// * `data_room_size` - Bytes per buffer, headroom included.
    /// * `socket_id` - NUMA socket the memory is meant for, or `numa::SOCKET_ID_ANY`.
    /// * `config` - Optional backing memory options.
    ///
    /// # Errors
    /// `InvalidInput` for a zero or oversized `n`, a cache larger than `MAX_CACHE_SIZE`
    /// or than two thirds of `n`, or a data room that cannot hold the headroom.
    /// `NotFound` when `socket_id` is not an online node. Mapping failures are passed on.
    pub fn create(
        name: &str,
        n: usize,
        cache_size: usize,
        data_room_size: u16,
        socket_id: i32,
        config: Option<PoolConfig>,
    ) -> io::Result<Arc<Mempool>> {
        let invalid = |why: String| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("mempool {name}: {why}"),
            )
        };
        if n == 0 || n > u32::MAX as usize {
            return Err(invalid(format!("invalid element count {n}")));
        }
        if cache_size > MAX_CACHE_SIZE || cache_size * 3 / 2 > n {
            return Err(invalid(format!(
                "cache size {cache_size} too large for {n} elements"
            )));
        }
        if data_room_size <= MBUF_HEADROOM {
            return Err(invalid(format!(
                "data room {data_room_size} does not exceed headroom {MBUF_HEADROOM}"
            )));
        }
        if !numa::node_online(socket_id) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("mempool {name}: socket {socket_id} is not online"),
            ));
        }

        let data_room = data_room_size as usize;
        let elt_size = data_room.next_multiple_of(CACHE_LINE);
        let total = elt_size
            .checked_mul(n)
            .ok_or_else(|| invalid("pool size overflow".to_string()))?;
        let mem = OwnedMmap::anonymous(total, config.and_then(|cfg| cfg.huge_page))
            .map_err(|e| io::Error::new(e.kind(), format!("mempool {name}: {e}")))?;

        let free = ArrayQueue::new(n);
        for index in 0..n as u32 {
            // capacity equals n
            let _ = free.push(index);
        }

        let pool = Mempool {
            name: name.to_string(),
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            mem,
            elt_size,
            data_room,
            size: n as u32,
            cache_size,
            socket_id,
            free,
            caches: Mutex::new(Vec::new()),
            #[cfg(debug_assertions)]
            taken: (0..n).map(|_| AtomicBool::new(false)).collect(),
        };
        log::debug!(
            "created mempool {name}: {n} x {elt_size} bytes, cache {cache_size}, socket {socket_id}, huge pages {}",
            pool.mem.is_huge()
        );
        Ok(Arc::new(pool))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total number of buffers.
    pub fn size(&self) -> usize {
        self.size as usize
    }

    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    pub fn socket_id(&self) -> i32 {
        self.socket_id
    }

    /// Bytes per buffer, headroom included.
    pub fn data_room(&self) -> usize {
        self.data_room
    }

    /// Buffers not owned by anyone: the shared free list plus every live cache.
    pub fn avail_count(&self) -> usize {
        let cached: usize = match self.caches.lock() {
            Ok(mut caches) => {
                caches.retain(|c| c.strong_count() > 0);
                caches
                    .iter()
                    .filter_map(Weak::upgrade)
                    .map(|len| len.load(Ordering::Relaxed))
                    .sum()
            }
            Err(_) => 0,
        };
        self.free.len() + cached
    }

    /// Buffers currently owned by rings or application code.
    pub fn in_use_count(&self) -> usize {
        self.size().saturating_sub(self.avail_count())
    }

    /// Takes a buffer from the shared free list.
    #[inline]
    pub fn get(&self) -> Option<Mbuf> {
        let index = self.free.pop()?;
        self.mark_taken(index);
        Some(self.handle(index))
    }

    /// Returns a buffer to the shared free list.
    #[inline]
    pub fn put(&self, mbuf: Mbuf) {
        self.check_owner(&mbuf);
        self.mark_returned(mbuf.index);
        if self.free.push(mbuf.index).is_err() {
            log::error!(
                "mempool {}: free list overflow on element {}",
                self.name,
                mbuf.index
            );
        }
    }

    /// The valid data of a buffer.
    #[inline]
    pub fn data<'a>(&'a self, mbuf: &'a Mbuf) -> &'a [u8] {
        self.check_owner(mbuf);
        unsafe {
            std::slice::from_raw_parts(
                self.element(mbuf.index).add(mbuf.data_off()),
                mbuf.len(),
            )
        }
    }

    /// The valid data of a buffer, writable.
    #[inline]
    pub fn data_mut<'a>(&'a self, mbuf: &'a mut Mbuf) -> &'a mut [u8] {
        self.check_owner(mbuf);
        unsafe {
            std::slice::from_raw_parts_mut(
                self.element(mbuf.index).add(mbuf.data_off()),
                mbuf.len(),
            )
        }
    }

    /// Everything from the data offset to the end of the buffer, tailroom included.
    #[inline]
    pub fn room_mut<'a>(&'a self, mbuf: &'a mut Mbuf) -> &'a mut [u8] {
        self.check_owner(mbuf);
        unsafe {
            std::slice::from_raw_parts_mut(
                self.element(mbuf.index).add(mbuf.data_off()),
                self.data_room - mbuf.data_off(),
            )
        }
    }

    /// Bytes left after the valid data.
    #[inline]
    pub fn tailroom(&self, mbuf: &Mbuf) -> usize {
        self.data_room - mbuf.data_off() - mbuf.len()
    }

    /// Replaces the data of a buffer with `bytes`.
    pub fn write(&self, mbuf: &mut Mbuf, bytes: &[u8]) -> io::Result<()> {
        let room = self.data_room - mbuf.data_off();
        if bytes.len() > room {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "mempool {}: {} bytes do not fit into {room} bytes of room",
                    self.name,
                    bytes.len()
                ),
            ));
        }
        self.room_mut(mbuf)[..bytes.len()].copy_from_slice(bytes);
        mbuf.data_len = bytes.len() as u16;
        Ok(())
    }

    #[inline]
    fn handle(&self, index: u32) -> Mbuf {
        Mbuf {
            pool: self.id,
            index,
            data_off: MBUF_HEADROOM,
            data_len: 0,
            port: NO_PORT,
        }
    }

    #[inline]
    fn element(&self, index: u32) -> *mut u8 {
        debug_assert!(index < self.size);
        unsafe { self.mem.as_u8_ptr().add(index as usize * self.elt_size) }
    }

    #[inline]
    fn check_owner(&self, mbuf: &Mbuf) {
        assert!(
            mbuf.pool == self.id && mbuf.index < self.size,
            "buffer {} of pool #{} used with mempool {}",
            mbuf.index,
            mbuf.pool,
            self.name
        );
    }

    #[inline]
    fn mark_taken(&self, _index: u32) {
        #[cfg(debug_assertions)]
        {
            let was = self.taken[_index as usize].swap(true, Ordering::Relaxed);
            debug_assert!(!was, "mempool {}: element {_index} handed out twice", self.name);
        }
    }

    #[inline]
    fn mark_returned(&self, _index: u32) {
        #[cfg(debug_assertions)]
        {
            let was = self.taken[_index as usize].swap(false, Ordering::Relaxed);
            debug_assert!(was, "mempool {}: element {_index} released twice", self.name);
        }
    }

    fn register_cache(&self, len: &Arc<AtomicUsize>) {
        if let Ok(mut caches) = self.caches.lock() {
            caches.retain(|c| c.strong_count() > 0);
            caches.push(Arc::downgrade(len));
        }
    }
}

impl fmt::Debug for Mempool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mempool")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("elt_size", &self.elt_size)
            .field("cache_size", &self.cache_size)
            .field("socket_id", &self.socket_id)
            .field("free", &self.free.len())
            .finish()
    }
}

/// Per-lane cache in front of a pool's shared free list. One cache belongs to one lane:
/// it can be moved to another thread but is not `Sync`.
pub struct PoolCache {
    pool: Arc<Mempool>,
    objs: Vec<u32>,
    size: usize,
    flush_threshold: usize,
    len: Arc<AtomicUsize>,
    _lane: PhantomData<Cell<()>>,
}

impl PoolCache {
    pub fn new(pool: &Arc<Mempool>) -> Self {
        let size = pool.cache_size();
        let flush_threshold = size * 3 / 2;
        let len = Arc::new(AtomicUsize::new(0));
        pool.register_cache(&len);
        PoolCache {
            pool: pool.clone(),
            objs: Vec::with_capacity(flush_threshold + 1),
            size,
            flush_threshold,
            len,
            _lane: PhantomData,
        }
    }

    pub fn pool(&self) -> &Arc<Mempool> {
        &self.pool
    }

    /// Buffers currently parked in this cache.
    pub fn len(&self) -> usize {
        self.objs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objs.is_empty()
    }

    /// Takes a buffer, refilling the cache from the shared free list when it is empty.
    #[inline]
    pub fn get(&mut self) -> Option<Mbuf> {
        if self.size == 0 {
            return self.pool.get();
        }
        if self.objs.is_empty() {
            while self.objs.len() < self.size {
                match self.pool.free.pop() {
                    Some(index) => self.objs.push(index),
                    None => break,
                }
            }
        }
        let index = self.objs.pop()?;
        self.publish_len();
        self.pool.mark_taken(index);
        Some(self.pool.handle(index))
    }

    /// Releases a buffer into the cache, spilling to the shared free list past the
    /// flush threshold.
    #[inline]
    pub fn put(&mut self, mbuf: Mbuf) {
        if self.size == 0 {
            return self.pool.put(mbuf);
        }
        self.pool.check_owner(&mbuf);
        self.pool.mark_returned(mbuf.index);
        self.objs.push(mbuf.index);
        if self.objs.len() > self.flush_threshold {
            self.spill(self.size);
        }
        self.publish_len();
    }

    /// Returns every cached buffer to the shared free list.
    pub fn flush(&mut self) {
        self.spill(0);
        self.publish_len();
    }

    fn spill(&mut self, keep: usize) {
        for index in self.objs.drain(keep..) {
            if self.pool.free.push(index).is_err() {
                log::error!("mempool {}: free list overflow on element {index}", self.pool.name);
            }
        }
    }

    #[inline]
    fn publish_len(&self) {
        self.len.store(self.objs.len(), Ordering::Relaxed);
    }
}

impl Drop for PoolCache {
    fn drop(&mut self) {
        self.flush();
    }
}

impl fmt::Debug for PoolCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolCache")
            .field("pool", &self.pool.name)
            .field("len", &self.objs.len())
            .field("size", &self.size)
            .finish()
    }
}
