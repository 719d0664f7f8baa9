//! Reference-counted pooled blocks.
//!
//! # Block Layout
//!
//! ```text
//! [refs | class | slot | len][0 ........ len ........ capacity]
//!  header                     readable    writable
//! ```
//!
//! # Invariants
//!
//! - `refs > 0` while the block is busy (held by at least one [Buffer]) and `refs == 0` while idle
//! - `slot` always matches the physical slot of the block in its class stack, except
//!   transiently while the class lock is held
//! - `len <= capacity`
//! - `len` and the payload are only mutated through a unique handle (`refs == 1`) or by the
//!   pool while the block is idle

use crate::{pool::Inner, stack::Locate, Error, Pool};
use bytes::{buf::UninitSlice, BufMut};
use std::{
    cell::UnsafeCell,
    fmt,
    ptr::NonNull,
    slice,
    sync::{
        atomic::{fence, AtomicUsize, Ordering},
        Arc,
    },
};

/// The `(class, slot)` pair identifying where a block lives in its pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Locator {
    /// Size class index.
    pub class: usize,
    /// Position in the class stack.
    pub slot: usize,
}

/// A pooled block: header plus payload.
pub(crate) struct Block {
    refs: AtomicUsize,
    class: usize,
    slot: AtomicUsize,
    len: UnsafeCell<usize>,
    /// Start of a zeroed, heap-allocated payload of `capacity` bytes owned by the block.
    data: NonNull<u8>,
    capacity: usize,
}

// SAFETY: `len` and the payload are only mutated by the sole owner of the block (a unique
// `Buffer`, or the pool while the block is idle under its class lock).
unsafe impl Send for Block {}
// SAFETY: See above. All other fields are atomics or immutable.
unsafe impl Sync for Block {}

impl Block {
    /// Allocates a zeroed block of `capacity` bytes for `class`, held by one reference.
    pub(crate) fn new(class: usize, capacity: usize) -> Result<Box<Self>, Error> {
        let mut data = Vec::new();
        data.try_reserve_exact(capacity)
            .map_err(|_| Error::ResourceExhausted)?;
        data.resize(capacity, 0u8);
        let data = Box::into_raw(data.into_boxed_slice());
        Ok(Box::new(Self {
            refs: AtomicUsize::new(1),
            class,
            slot: AtomicUsize::new(usize::MAX),
            len: UnsafeCell::new(0),
            // SAFETY: `Box::into_raw` never returns null.
            data: unsafe { NonNull::new_unchecked(data.cast::<u8>()) },
            capacity,
        }))
    }

    pub(crate) fn class(&self) -> usize {
        self.class
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot.load(Ordering::Relaxed)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    fn len(&self) -> usize {
        // SAFETY: `len` is never written while more than one handle exists.
        unsafe { *self.len.get() }
    }

    /// Decrements the reference count, returning `true` if this was the last reference.
    pub(crate) fn unref(&self) -> bool {
        if self.refs.fetch_sub(1, Ordering::Release) != 1 {
            return false;
        }
        // Synchronize with every prior release before the block is recycled
        fence(Ordering::Acquire);
        true
    }

    /// Prepares an idle block to be handed out again.
    ///
    /// # Safety
    ///
    /// The block must be idle (no live handles) and the caller must hold its class lock.
    pub(crate) unsafe fn reset(&self) {
        *self.len.get() = 0;
        self.refs.store(1, Ordering::Relaxed);
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        let data = std::ptr::slice_from_raw_parts_mut(self.data.as_ptr(), self.capacity);
        // SAFETY: `data` came from `Box::into_raw` on a boxed slice of `capacity` bytes.
        drop(unsafe { Box::from_raw(data) });
    }
}

/// Owning pointer to a block stored in a class stack.
pub(crate) struct Slot(NonNull<Block>);

// SAFETY: The block is `Send + Sync` and the slot is only accessed under its class lock.
unsafe impl Send for Slot {}

impl Slot {
    pub(crate) fn new(block: Box<Block>) -> Self {
        Self(NonNull::from(Box::leak(block)))
    }

    pub(crate) fn ptr(&self) -> NonNull<Block> {
        self.0
    }

    pub(crate) fn block(&self) -> &Block {
        // SAFETY: The slot owns the allocation until it is dropped.
        unsafe { self.0.as_ref() }
    }
}

impl Locate for Slot {
    fn locate(&self, slot: usize) {
        self.block().slot.store(slot, Ordering::Relaxed);
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        // SAFETY: The pointer came from `Box::leak` and no handle can outlive the pool that
        // owns this slot (handles keep the pool alive).
        drop(unsafe { Box::from_raw(self.0.as_ptr()) });
    }
}

/// A handle to a pooled block.
///
/// Dropping the handle releases one reference. The block returns to its pool when the
/// last handle is dropped. Reading is always allowed, while mutation requires the handle to be
/// unique (see [Buffer::is_unique]).
///
/// Writes go through [BufMut]. Its methods panic on a shared handle, so prefer the fallible
/// [Buffer::write] and [Buffer::spare_mut] when uniqueness is not known.
pub struct Buffer {
    block: NonNull<Block>,
    pool: Arc<Inner>,
}

// SAFETY: Shared state in the block is synchronized through the atomic reference count.
unsafe impl Send for Buffer {}
// SAFETY: `&Buffer` only exposes reads, which never race with writes (writes need `refs == 1`
// and `&mut Buffer`).
unsafe impl Sync for Buffer {}

impl Buffer {
    pub(crate) fn new(block: NonNull<Block>, pool: Arc<Inner>) -> Self {
        Self { block, pool }
    }

    /// Returns the pool the block belongs to.
    pub fn pool(&self) -> Pool {
        Pool::from_inner(self.pool.clone())
    }

    fn block(&self) -> &Block {
        // SAFETY: The block stays allocated while any handle references the pool.
        unsafe { self.block.as_ref() }
    }

    /// Returns the number of bytes the block can hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.block().capacity()
    }

    /// Returns the number of bytes written so far (the write cursor).
    #[inline]
    pub fn len(&self) -> usize {
        self.block().len()
    }

    /// Returns true if nothing has been written.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of bytes that can still be written.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Returns the current reference count.
    pub fn refs(&self) -> usize {
        self.block().refs()
    }

    /// Returns true if this is the only handle to the block.
    pub fn is_unique(&self) -> bool {
        self.refs() == 1
    }

    /// Returns where the block currently lives in its pool.
    ///
    /// The slot may change whenever another block of the same class is released.
    pub fn locator(&self) -> Locator {
        let block = self.block();
        Locator {
            class: block.class(),
            slot: block.slot(),
        }
    }

    /// Returns another handle to the same block, incrementing the reference count.
    ///
    /// The block is not recycled until every handle has been dropped.
    pub fn retain(&self) -> Buffer {
        self.block().refs.fetch_add(1, Ordering::Relaxed);
        Self::new(self.block, self.pool.clone())
    }

    fn ensure_unique(&self) -> Result<(), Error> {
        if !self.is_unique() {
            return Err(Error::InvalidState);
        }
        Ok(())
    }

    /// Returns the writable region after the write cursor.
    ///
    /// The region is always initialized (blocks are zeroed on allocation), so it can be handed
    /// directly to `recv`. Fails with [Error::InvalidState] if the block is shared.
    pub fn spare_mut(&mut self) -> Result<&mut [u8], Error> {
        self.ensure_unique()?;
        let len = self.len();
        let spare = self.capacity() - len;
        // SAFETY: The handle is unique and borrowed mutably, and `len..capacity` lies within
        // the initialized payload.
        Ok(unsafe { slice::from_raw_parts_mut(self.block().data.as_ptr().add(len), spare) })
    }

    /// Moves the write cursor forward by `n` bytes after writing into [Buffer::spare_mut].
    pub fn advance(&mut self, n: usize) -> Result<(), Error> {
        self.ensure_unique()?;
        if n > self.remaining_mut() {
            return Err(Error::InvalidParameter);
        }
        // SAFETY: The handle is unique and the bytes up to `len + n` are initialized.
        unsafe { self.advance_mut(n) };
        Ok(())
    }

    /// Copies as much of `data` as fits after the write cursor, returning the number of bytes
    /// written.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        self.ensure_unique()?;
        let n = self.remaining_mut().min(data.len());
        self.put_slice(&data[..n]);
        Ok(n)
    }

    /// Resets the write cursor to zero.
    pub fn clear(&mut self) -> Result<(), Error> {
        self.ensure_unique()?;
        // SAFETY: The handle is unique and borrowed mutably.
        unsafe { *self.block().len.get() = 0 };
        Ok(())
    }
}

// SAFETY:
// - `remaining_mut()` reports the bytes between the write cursor and the capacity
// - `chunk_mut()` only hands out that region, and only through a unique handle
// - `advance_mut()` moves the cursor within bounds
unsafe impl BufMut for Buffer {
    #[inline]
    fn remaining_mut(&self) -> usize {
        self.remaining()
    }

    #[inline]
    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.is_unique(), "cannot write to a shared buffer");
        assert!(
            cnt <= self.remaining_mut(),
            "cannot advance past end of buffer"
        );
        *self.block().len.get() += cnt;
    }

    #[inline]
    fn chunk_mut(&mut self) -> &mut UninitSlice {
        assert!(self.is_unique(), "cannot write to a shared buffer");
        let len = self.len();
        let spare = self.capacity() - len;
        // SAFETY: The handle is unique and the region lies within the payload.
        unsafe { UninitSlice::from_raw_parts_mut(self.block().data.as_ptr().add(len), spare) }
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        // SAFETY: Bytes before the write cursor are initialized and only mutated by a unique
        // handle, which cannot coexist with this borrow.
        unsafe { slice::from_raw_parts(self.block().data.as_ptr(), self.len()) }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("locator", &self.locator())
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("refs", &self.refs())
            .finish()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.pool.release(self.block);
    }
}

#[cfg(test)]
mod tests {
    use crate::{Config, Error, Pool};
    use bytes::BufMut;
    use prometheus_client::registry::Registry;

    fn pool() -> Pool {
        Pool::new(Config::default(), &mut Registry::default()).unwrap()
    }

    #[test]
    fn test_write_and_read() {
        let pool = pool();
        let mut buf = pool.allocate(8).unwrap();
        assert_eq!(buf.capacity(), 8);
        assert!(buf.is_empty());

        assert_eq!(buf.write(b"hello").unwrap(), 5);
        assert_eq!(buf.write(b"world").unwrap(), 3);
        assert_eq!(buf.as_ref(), b"hellowor");
        assert_eq!(buf.remaining(), 0);

        buf.clear().unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_spare_and_advance() {
        let pool = pool();
        let mut buf = pool.allocate(4).unwrap();
        buf.spare_mut().unwrap()[..2].copy_from_slice(b"ab");
        buf.advance(2).unwrap();
        assert_eq!(buf.as_ref(), b"ab");
        assert_eq!(buf.advance(3), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_shared_buffer_is_read_only() {
        let pool = pool();
        let mut buf = pool.allocate(16).unwrap();
        buf.write(b"abc").unwrap();

        let mut shared = buf.retain();
        assert_eq!(buf.refs(), 2);
        assert_eq!(shared.write(b"d"), Err(Error::InvalidState));
        assert_eq!(buf.clear(), Err(Error::InvalidState));
        assert_eq!(shared.as_ref(), b"abc");

        drop(shared);
        assert!(buf.is_unique());
        buf.write(b"d").unwrap();
        assert_eq!(buf.as_ref(), b"abcd");
    }

    #[test]
    fn test_reallocated_block_is_reset() {
        let pool = pool();
        let mut buf = pool.allocate(32).unwrap();
        buf.write(b"stale").unwrap();
        let locator = buf.locator();
        drop(buf);

        let buf = pool.allocate(32).unwrap();
        assert_eq!(buf.locator(), locator);
        assert!(buf.is_empty());
        assert_eq!(buf.refs(), 1);
    }

    #[test]
    fn test_buf_mut_writes_after_cursor() {
        let pool = pool();
        let mut buf = pool.allocate(16).unwrap();
        buf.write(b"id").unwrap();
        buf.put_u32(0xdead_beef);
        buf.put_slice(b"xy");
        assert_eq!(buf.remaining_mut(), 8);
        assert_eq!(buf.as_ref(), b"id\xde\xad\xbe\xefxy");
    }

    #[test]
    #[should_panic(expected = "cannot write to a shared buffer")]
    fn test_buf_mut_rejects_shared_buffer() {
        let pool = pool();
        let mut buf = pool.allocate(16).unwrap();
        let _shared = buf.retain();
        buf.put_u8(1);
    }
}
