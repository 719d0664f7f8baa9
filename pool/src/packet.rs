//! Chains of pooled blocks forming one logical message.

use crate::{Buffer, Error, Pool};
use bytes::{Buf, BufMut};
use std::{collections::VecDeque, fmt};

/// An ordered chain of [Buffer]s.
///
/// Blocks are appended at the tail and consumed from the head. A packet never reallocates
/// a block to grow: [Packet::write] and [Packet::reserve_tail] chain new blocks of
/// [Pool::packet_size] bytes instead.
///
/// Reading goes through [Buf]: [Buf::advance] consumes bytes from the head and releases every
/// block it fully consumes.
pub struct Packet {
    pool: Pool,
    blocks: VecDeque<Buffer>,
    /// Bytes of the head block already consumed.
    read: usize,
}

impl Packet {
    /// Creates an empty packet drawing blocks from `pool`.
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            blocks: VecDeque::new(),
            read: 0,
        }
    }

    /// Returns the pool this packet draws blocks from.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Returns the number of unread bytes.
    pub fn len(&self) -> usize {
        self.blocks.iter().map(Buffer::len).sum::<usize>() - self.read
    }

    /// Returns true if the packet holds no unread bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of chained blocks.
    pub fn blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Appends `buffer` at the tail.
    pub fn append(&mut self, buffer: Buffer) {
        self.blocks.push_back(buffer);
    }

    /// Moves the unread blocks of `other` behind this packet's tail, skipping empty ones.
    ///
    /// A partially read head of `other` is copied, unless this packet holds no blocks yet (in
    /// which case the read position is adopted as is).
    pub fn append_packet(&mut self, mut other: Packet) -> Result<(), Error> {
        if other.read > 0 {
            if self.blocks.is_empty() {
                self.read = other.read;
            } else if let Some(head) = other.blocks.pop_front() {
                self.write(&head.as_ref()[other.read..])?;
            }
        }
        self.blocks
            .extend(other.blocks.into_iter().filter(|block| !block.is_empty()));
        Ok(())
    }

    /// Detaches and returns the head block, whole (bytes already consumed through [Buf] are
    /// part of it again).
    pub fn take_one(&mut self) -> Option<Buffer> {
        self.read = 0;
        self.blocks.pop_front()
    }

    /// Releases every block, returning how many were chained.
    ///
    /// Blocks still referenced elsewhere stay busy until their last holder drops them.
    pub fn free(&mut self) -> usize {
        let count = self.blocks.len();
        self.blocks.clear();
        self.read = 0;
        count
    }

    /// Returns a packet sharing every block (and the read position) with this one.
    ///
    /// Shared blocks become read-only until all but one handle is dropped.
    pub fn retain(&self) -> Packet {
        Self {
            pool: self.pool.clone(),
            blocks: self.blocks.iter().map(Buffer::retain).collect(),
            read: self.read,
        }
    }

    /// Returns a packet holding a private copy of the unread bytes of every block.
    pub fn deep_clone(&self) -> Result<Packet, Error> {
        let mut clone = Packet::new(self.pool.clone());
        for (block, chunk) in self.blocks.iter().zip(self.chunks()) {
            let mut copy = self.pool.allocate(block.capacity())?;
            copy.put_slice(chunk);
            clone.append(copy);
        }
        Ok(clone)
    }

    /// Returns an iterator over the unread bytes of each block, head first.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        let read = self.read;
        self.blocks.iter().enumerate().map(move |(i, block)| {
            let bytes = block.as_ref();
            if i == 0 {
                &bytes[read..]
            } else {
                bytes
            }
        })
    }

    /// Copies the unread bytes into a contiguous vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for chunk in self.chunks() {
            out.extend_from_slice(chunk);
        }
        out
    }

    /// Returns a writable tail block, chaining a fresh one if the current tail is full or
    /// shared.
    pub fn reserve_tail(&mut self) -> Result<&mut Buffer, Error> {
        let writable = self
            .blocks
            .back()
            .is_some_and(|tail| tail.is_unique() && tail.remaining_mut() > 0);
        if !writable {
            let block = self.pool.allocate(self.pool.packet_size())?;
            self.blocks.push_back(block);
        }
        self.blocks.back_mut().ok_or(Error::InvalidState)
    }

    /// Appends `data`, filling the tail block before chaining new ones.
    pub fn write(&mut self, mut data: &[u8]) -> Result<(), Error> {
        while !data.is_empty() {
            let tail = self.reserve_tail()?;
            let n = tail.remaining_mut().min(data.len());
            tail.put_slice(&data[..n]);
            data = &data[n..];
        }
        Ok(())
    }

    /// Compacts the unread bytes into one contiguous block.
    ///
    /// An unread single-block packet is returned as is. Otherwise every byte is copied into a
    /// new block (from the overflow class if the total exceeds the largest fixed class), so
    /// avoid this on hot paths.
    pub fn splice(mut self) -> Result<Buffer, Error> {
        if self.blocks.len() == 1 && self.read == 0 {
            if let Some(block) = self.blocks.pop_front() {
                return Ok(block);
            }
        }
        let mut out = self.pool.allocate(self.len())?;
        out.put(&mut self);
        Ok(out)
    }
}

impl Buf for Packet {
    fn remaining(&self) -> usize {
        self.len()
    }

    fn chunk(&self) -> &[u8] {
        self.chunks()
            .find(|chunk| !chunk.is_empty())
            .unwrap_or_default()
    }

    fn advance(&mut self, mut cnt: usize) {
        assert!(cnt <= self.len(), "cannot advance past end of packet");
        while cnt > 0 {
            let Some(head) = self.blocks.front() else {
                break;
            };
            let unread = head.len() - self.read;
            if cnt < unread {
                self.read += cnt;
                return;
            }
            cnt -= unread;
            self.blocks.pop_front();
            self.read = 0;
        }
    }
}

impl From<Buffer> for Packet {
    fn from(buffer: Buffer) -> Self {
        let mut packet = Packet::new(buffer.pool());
        packet.append(buffer);
        packet
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("blocks", &self.blocks)
            .field("read", &self.read)
            .field("len", &self.len())
            .finish()
    }
}
