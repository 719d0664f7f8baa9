//! Segregated size-class buffer pool with reference-counted blocks and packet chains.
//!
//! All I/O memory is drawn from a [Pool]. A pool is a set of independent size classes
//! (power-of-two capacities from 2 to 8192 bytes, plus one overflow class for larger
//! requests), each backed by a swap-compacted slot stack guarded by its own lock.
//! Operations on different classes never contend.
//!
//! # Buffers
//!
//! [Pool::allocate] returns a [Buffer], a handle to a pooled block carrying a reference count,
//! the `(class, slot)` [Locator] used to return it, and a write cursor. Cloning a handle with
//! [Buffer::retain] increments the count and dropping a handle decrements it. The block goes
//! back to its class exactly when the last handle is dropped.
//!
//! # Packets
//!
//! A [Packet] chains several blocks into one logical message so that a message larger than
//! a single block (or one that arrives across several reads) never requires reallocation.
//! [Packet::splice] compacts a chain into one contiguous block, at the cost of a copy.
//!
//! # Example
//!
//! ```rust
//! use ember_pool::{Config, Pool};
//! use prometheus_client::registry::Registry;
//!
//! let mut registry = Registry::default();
//! let pool = Pool::new(Config::default(), &mut registry).unwrap();
//!
//! let mut buf = pool.allocate(100).unwrap();
//! assert_eq!(buf.capacity(), 128);
//! buf.write(b"hello").unwrap();
//!
//! let shared = buf.retain();
//! assert_eq!(shared.refs(), 2);
//! drop(buf);
//! assert_eq!(shared.as_ref(), b"hello");
//! ```
//!
//! # Status
//!
//! `ember-pool` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

use thiserror::Error;

mod buffer;
pub use buffer::{Buffer, Locator};
mod packet;
pub use packet::Packet;
mod pool;
pub use pool::{class_index, class_size, ClassStats, Pool};
mod stack;

/// Smallest fixed size class, in bytes.
pub const MIN_CLASS_SIZE: usize = 2;

/// Largest fixed size class, in bytes.
pub const MAX_CLASS_SIZE: usize = 8192;

/// Number of fixed (power-of-two) size classes.
pub const FIXED_CLASSES: usize = (MAX_CLASS_SIZE / MIN_CLASS_SIZE).trailing_zeros() as usize + 1;

/// Index of the class serving requests larger than [MAX_CLASS_SIZE].
pub const OVERFLOW_CLASS: usize = FIXED_CLASSES;

/// Total number of size classes (fixed classes plus the overflow class).
pub const CLASSES: usize = FIXED_CLASSES + 1;

/// Errors that can occur when interacting with the pool.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("resource exhausted")]
    ResourceExhausted,
    #[error("invalid state")]
    InvalidState,
    #[error("invalid parameter")]
    InvalidParameter,
}

/// Configuration for a [Pool].
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of slots each class reserves up front.
    pub initial_slots: usize,
    /// Slot arrays double in size until they reach this many slots.
    pub growth_threshold: usize,
    /// Once past `growth_threshold`, slot arrays grow by this many slots at a time.
    pub growth_increment: usize,
    /// Absolute maximum number of slots per class. Allocations that would exceed it fail
    /// with [Error::ResourceExhausted].
    pub max_slots: usize,
    /// Capacity of each block allocated by [Packet] operations.
    pub packet_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_slots: 8,
            growth_threshold: 16_384,
            growth_increment: 16_384,
            max_slots: 0x00ff_ffff,
            packet_size: MAX_CLASS_SIZE,
        }
    }
}

impl Config {
    /// See [Config]
    pub const fn with_max_slots(mut self, max_slots: usize) -> Self {
        self.max_slots = max_slots;
        self
    }

    /// See [Config]
    pub const fn with_packet_size(mut self, packet_size: usize) -> Self {
        self.packet_size = packet_size;
        self
    }

    /// Validates the configuration, panicking on invalid values.
    ///
    /// # Panics
    ///
    /// - `initial_slots` is zero or larger than `max_slots`
    /// - `growth_increment` is zero
    /// - `packet_size` is zero
    pub(crate) fn validate(&self) {
        assert!(self.initial_slots > 0, "initial_slots must be non-zero");
        assert!(
            self.initial_slots <= self.max_slots,
            "initial_slots ({}) must be <= max_slots ({})",
            self.initial_slots,
            self.max_slots
        );
        assert!(self.growth_increment > 0, "growth_increment must be non-zero");
        assert!(self.packet_size > 0, "packet_size must be non-zero");
    }
}
