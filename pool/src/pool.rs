//! Size-class pool of reference-counted blocks.
//!
//! # Classes
//!
//! Requests are rounded up to the next power of two between [MIN_CLASS_SIZE] and
//! [MAX_CLASS_SIZE]. Anything larger is served by the overflow class, whose blocks are sized
//! exactly to the request. The overflow class parks at most one idle block (the largest
//! released so far) and reuses it only when it is large enough for the request.
//!
//! # Locking
//!
//! Each class owns a [Stack] behind its own mutex. The lock is only held to move slot indices
//! and grow the slot array; payload bytes are never touched under it.

use crate::{
    buffer::{Block, Buffer, Slot},
    stack::{Growth, Stack},
    Config, Error, Packet, CLASSES, FIXED_CLASSES, MAX_CLASS_SIZE, MIN_CLASS_SIZE,
    OVERFLOW_CLASS,
};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use std::{
    ptr::NonNull,
    sync::{Arc, Mutex},
};
use tracing::{debug, warn};

/// Returns the class serving a request of `size` bytes.
pub const fn class_index(size: usize) -> usize {
    if size <= MIN_CLASS_SIZE {
        0
    } else if size > MAX_CLASS_SIZE {
        OVERFLOW_CLASS
    } else {
        (size.next_power_of_two() / MIN_CLASS_SIZE).trailing_zeros() as usize
    }
}

/// Returns the block capacity of a fixed class, or `None` for the overflow class (or an
/// out-of-range index).
pub const fn class_size(class: usize) -> Option<usize> {
    if class < FIXED_CLASSES {
        Some(MIN_CLASS_SIZE << class)
    } else {
        None
    }
}

/// Snapshot of a class stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClassStats {
    /// Block capacity (`None` for the overflow class).
    pub size: Option<usize>,
    /// Number of busy blocks.
    pub pos: usize,
    /// Number of blocks owned by the class (busy plus idle).
    pub top: usize,
    /// Current size of the slot array.
    pub max: usize,
}

impl ClassStats {
    /// Number of idle blocks ready for reuse.
    pub fn idle(&self) -> usize {
        self.top - self.pos
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ClassLabel {
    class: u64,
}

/// Pool metrics, labelled by class index.
struct Metrics {
    /// Number of busy blocks.
    allocated: Family<ClassLabel, Gauge>,
    /// Number of idle blocks.
    available: Family<ClassLabel, Gauge>,
    /// Total number of successful allocations.
    allocations: Family<ClassLabel, Counter>,
    /// Total number of failed allocations.
    exhausted: Family<ClassLabel, Counter>,
    /// Total number of slot array reallocations.
    grown: Family<ClassLabel, Counter>,
}

impl Metrics {
    fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            allocated: Family::default(),
            available: Family::default(),
            allocations: Family::default(),
            exhausted: Family::default(),
            grown: Family::default(),
        };
        registry.register(
            "pool_allocated",
            "Number of blocks currently handed out",
            metrics.allocated.clone(),
        );
        registry.register(
            "pool_available",
            "Number of idle blocks ready for reuse",
            metrics.available.clone(),
        );
        registry.register(
            "pool_allocations",
            "Total number of successful allocations",
            metrics.allocations.clone(),
        );
        registry.register(
            "pool_exhausted",
            "Total number of allocations that failed",
            metrics.exhausted.clone(),
        );
        registry.register(
            "pool_grown",
            "Total number of slot array reallocations",
            metrics.grown.clone(),
        );
        metrics
    }

    /// Publishes a class snapshot taken under its lock (recorded after the lock is released).
    fn record(&self, class: usize, (busy, idle): (usize, usize)) {
        let label = ClassLabel {
            class: class as u64,
        };
        self.allocated.get_or_create(&label).set(busy as i64);
        self.available.get_or_create(&label).set(idle as i64);
    }
}

struct Class {
    size: Option<usize>,
    stack: Mutex<Stack<Slot>>,
}

pub(crate) struct Inner {
    cfg: Config,
    classes: Vec<Class>,
    metrics: Metrics,
}

impl Inner {
    /// Drops one reference to `block`, returning it to its class if it was the last.
    pub(crate) fn release(&self, ptr: NonNull<Block>) {
        // SAFETY: The caller held a reference, so the block is still owned by its class.
        let block = unsafe { ptr.as_ref() };
        if !block.unref() {
            return;
        }

        let index = block.class();
        let mut stack = self.classes[index].stack.lock().unwrap();
        stack.release(block.slot());
        let shed = if index == OVERFLOW_CLASS {
            stack.shed_idle(1, |slot| slot.block().capacity())
        } else {
            Vec::new()
        };
        let snapshot = (stack.pos(), stack.top() - stack.pos());
        drop(stack);

        self.metrics.record(index, snapshot);
        if !shed.is_empty() {
            debug!(blocks = shed.len(), "dropped surplus overflow blocks");
        }
    }
}

/// A cloneable handle to a set of size classes.
///
/// Buffers keep the pool alive, so a pool is only freed once the last handle (and the last
/// buffer drawn from it) is dropped.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Inner>,
}

impl Pool {
    /// Creates a pool, registering its metrics on `registry`.
    ///
    /// # Panics
    ///
    /// Panics if `cfg` is invalid (see [Config]).
    pub fn new(cfg: Config, registry: &mut Registry) -> Result<Self, Error> {
        cfg.validate();

        let growth = Growth::from(&cfg);
        let mut classes = Vec::with_capacity(CLASSES);
        for class in 0..CLASSES {
            classes.push(Class {
                size: class_size(class),
                stack: Mutex::new(Stack::new(growth)?),
            });
        }

        Ok(Self {
            inner: Arc::new(Inner {
                cfg,
                classes,
                metrics: Metrics::new(registry),
            }),
        })
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    /// Returns the capacity of blocks allocated by [Packet] operations.
    pub fn packet_size(&self) -> usize {
        self.inner.cfg.packet_size
    }

    /// Returns a block able to hold at least `size` bytes.
    ///
    /// The block is empty and held by exactly one handle.
    pub fn allocate(&self, size: usize) -> Result<Buffer, Error> {
        let index = class_index(size);
        let class = &self.inner.classes[index];
        let capacity = class.size.unwrap_or(size);
        let label = ClassLabel {
            class: index as u64,
        };

        let mut stack = class.stack.lock().unwrap();
        let max = stack.max();

        // Fast path: reuse the first idle block (only if big enough for overflow requests)
        let reusable = stack
            .idle()
            .is_some_and(|slot| slot.block().capacity() >= capacity);
        let reused = if reusable {
            stack.pop().and_then(|slot| stack.get(slot)).map(|slot| {
                // SAFETY: The block was idle and the class lock is held.
                unsafe { slot.block().reset() };
                slot.ptr()
            })
        } else {
            None
        };
        let ptr = match reused {
            Some(ptr) => ptr,
            None => {
                let inserted = Block::new(index, capacity)
                    .map(Slot::new)
                    .and_then(|slot| {
                        let ptr = slot.ptr();
                        stack.insert(slot).map(|_| ptr)
                    });
                let ptr = match inserted {
                    Ok(ptr) => ptr,
                    Err(err) => {
                        drop(stack);
                        self.inner.metrics.exhausted.get_or_create(&label).inc();
                        warn!(class = index, size, ?err, "allocation failed");
                        return Err(err);
                    }
                };
                ptr
            }
        };
        let snapshot = (stack.pos(), stack.top() - stack.pos());
        let grown = (stack.max() != max).then(|| stack.max());
        drop(stack);

        self.inner.metrics.record(index, snapshot);
        if let Some(to) = grown {
            self.inner.metrics.grown.get_or_create(&label).inc();
            debug!(class = index, from = max, to, "grew slot array");
        }
        self.inner.metrics.allocations.get_or_create(&label).inc();
        Ok(Buffer::new(ptr, self.inner.clone()))
    }

    /// Drops one reference to `buffer` (equivalent to dropping it).
    pub fn release(&self, buffer: Buffer) {
        drop(buffer);
    }

    /// Returns another handle to the block behind `buffer`.
    pub fn retain(&self, buffer: &Buffer) -> Buffer {
        buffer.retain()
    }

    /// Returns `n` additional handles to the block behind `buffer`.
    pub fn add_reference(&self, buffer: &Buffer, n: usize) -> Vec<Buffer> {
        (0..n).map(|_| buffer.retain()).collect()
    }

    /// Returns an empty packet drawing its blocks from this pool.
    pub fn packet(&self) -> Packet {
        Packet::new(self.clone())
    }

    /// Returns a snapshot of `class`, or `None` if the index is out of range.
    pub fn class_stats(&self, class: usize) -> Option<ClassStats> {
        let class = self.inner.classes.get(class)?;
        let stack = class.stack.lock().unwrap();
        Some(ClassStats {
            size: class.size,
            pos: stack.pos(),
            top: stack.top(),
            max: stack.max(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Locator;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::{collections::HashSet, thread};
    use test_case::test_case;

    fn pool() -> Pool {
        Pool::new(Config::default(), &mut Registry::default()).unwrap()
    }

    #[test_case(0, 0; "zero")]
    #[test_case(1, 0; "one")]
    #[test_case(2, 0; "min")]
    #[test_case(3, 1; "three")]
    #[test_case(100, 6; "hundred")]
    #[test_case(128, 6; "exact power")]
    #[test_case(129, 7; "just above power")]
    #[test_case(8192, 12; "max")]
    #[test_case(8193, OVERFLOW_CLASS; "overflow")]
    fn test_class_index(size: usize, expected: usize) {
        assert_eq!(class_index(size), expected);
    }

    #[test]
    fn test_class_layout() {
        assert_eq!(FIXED_CLASSES, 13);
        assert_eq!(OVERFLOW_CLASS, 13);
        assert_eq!(class_size(0), Some(2));
        assert_eq!(class_size(12), Some(MAX_CLASS_SIZE));
        assert_eq!(class_size(OVERFLOW_CLASS), None);
        for size in [1, 2, 3, 17, 1000, 4096, 8192] {
            let capacity = class_size(class_index(size)).unwrap();
            assert!(capacity >= size);
            assert!(capacity / 2 < size.max(MIN_CLASS_SIZE));
        }
    }

    #[test]
    fn test_release_then_allocate_reuses_slot() {
        let pool = pool();
        let buf = pool.allocate(100).unwrap();
        let locator = buf.locator();
        assert_eq!(locator, Locator { class: 6, slot: 0 });
        pool.release(buf);

        let stats = pool.class_stats(6).unwrap();
        assert_eq!((stats.pos, stats.top), (0, 1));

        let buf = pool.allocate(120).unwrap();
        assert_eq!(buf.locator(), locator);
        let stats = pool.class_stats(6).unwrap();
        assert_eq!((stats.pos, stats.top), (1, 1));
    }

    #[test]
    fn test_refcount_returns_block_once() {
        let pool = pool();
        let buf = pool.allocate(64).unwrap();
        let class = buf.locator().class;
        let mut extra = pool.add_reference(&buf, 3);
        extra.push(pool.retain(&buf));
        assert_eq!(buf.refs(), 5);

        // Any number of releases short of the total keeps the block busy
        for handle in extra {
            pool.release(handle);
            assert_eq!(pool.class_stats(class).unwrap().pos, 1);
        }
        assert_eq!(buf.refs(), 1);

        // A new allocation must not receive the still-referenced block
        let other = pool.allocate(64).unwrap();
        assert_ne!(other.locator(), buf.locator());
        drop(other);

        pool.release(buf);
        let stats = pool.class_stats(class).unwrap();
        assert_eq!((stats.pos, stats.top), (0, 2));
    }

    #[test]
    fn test_random_churn_keeps_classes_compact() {
        let pool = pool();
        let mut rng = StdRng::seed_from_u64(42);
        let mut held: Vec<Buffer> = Vec::new();
        let sizes = [2, 7, 64, 500, 4096, 8192, 9_000, 12_000, 20_000];

        for _ in 0..2_000 {
            if held.is_empty() || rng.gen_bool(0.6) {
                let size = sizes[rng.gen_range(0..sizes.len())];
                held.push(pool.allocate(size).unwrap());
            } else {
                let index = rng.gen_range(0..held.len());
                drop(held.swap_remove(index));
            }

            // Every held block sits below its class's `pos`, and no two share a slot
            let mut seen = HashSet::new();
            for buf in &held {
                let locator = buf.locator();
                let stats = pool.class_stats(locator.class).unwrap();
                assert!(locator.slot < stats.pos);
                assert!(seen.insert(locator));
            }
            for (class, count) in (0..CLASSES).map(|class| {
                let count = held
                    .iter()
                    .filter(|buf| buf.locator().class == class)
                    .count();
                (class, count)
            }) {
                let stats = pool.class_stats(class).unwrap();
                assert_eq!(stats.pos, count);

                // Gauges match the class state once every operation has returned
                let label = ClassLabel {
                    class: class as u64,
                };
                let metrics = &pool.inner.metrics;
                assert_eq!(metrics.allocated.get_or_create(&label).get(), stats.pos as i64);
                assert_eq!(
                    metrics.available.get_or_create(&label).get(),
                    stats.idle() as i64
                );
            }

            // The overflow class never parks more than one idle block
            assert!(pool.class_stats(OVERFLOW_CLASS).unwrap().idle() <= 1);
        }
    }

    #[test]
    fn test_release_publishes_gauges() {
        let pool = pool();
        let label = ClassLabel {
            class: class_index(64) as u64,
        };
        let held: Vec<_> = (0..3).map(|_| pool.allocate(64).unwrap()).collect();
        assert_eq!(pool.inner.metrics.allocated.get_or_create(&label).get(), 3);
        assert_eq!(pool.inner.metrics.available.get_or_create(&label).get(), 0);

        drop(held);
        assert_eq!(pool.inner.metrics.allocated.get_or_create(&label).get(), 0);
        assert_eq!(pool.inner.metrics.available.get_or_create(&label).get(), 3);
    }

    #[test]
    fn test_overflow_parks_largest_idle_block() {
        let pool = pool();
        let small = pool.allocate(10_000).unwrap();
        assert_eq!(small.capacity(), 10_000);
        assert_eq!(small.locator().class, OVERFLOW_CLASS);
        drop(small);

        // Large enough: the idle block is reused
        let reused = pool.allocate(9_000).unwrap();
        assert_eq!(reused.capacity(), 10_000);

        // Too small: a new block is allocated and the old one stays idle
        drop(reused);
        let large = pool.allocate(20_000).unwrap();
        assert_eq!(large.capacity(), 20_000);
        let stats = pool.class_stats(OVERFLOW_CLASS).unwrap();
        assert_eq!((stats.pos, stats.top), (1, 2));

        // Releasing leaves only the larger block parked
        drop(large);
        let stats = pool.class_stats(OVERFLOW_CLASS).unwrap();
        assert_eq!((stats.pos, stats.top), (0, 1));
        assert_eq!(pool.allocate(15_000).unwrap().capacity(), 20_000);
    }

    #[test]
    fn test_slot_cap_exhausts() {
        let mut registry = Registry::default();
        let cfg = Config {
            initial_slots: 2,
            ..Config::default()
        }
        .with_max_slots(3);
        let pool = Pool::new(cfg, &mut registry).unwrap();

        let held: Vec<_> = (0..3).map(|_| pool.allocate(16).unwrap()).collect();
        assert_eq!(pool.allocate(16).err(), Some(Error::ResourceExhausted));

        let label = ClassLabel {
            class: class_index(16) as u64,
        };
        assert_eq!(pool.inner.metrics.exhausted.get_or_create(&label).get(), 1);
        assert_eq!(pool.inner.metrics.grown.get_or_create(&label).get(), 1);
        assert_eq!(pool.inner.metrics.allocated.get_or_create(&label).get(), 3);

        // Other classes are unaffected and freed slots are reusable
        assert!(pool.allocate(32).is_ok());
        drop(held);
        let _reused = pool.allocate(16).unwrap();
        assert_eq!(pool.inner.metrics.available.get_or_create(&label).get(), 2);
    }

    #[test]
    fn test_growth_keeps_locators_valid() {
        let pool = pool();
        let held: Vec<_> = (0..100u8)
            .map(|i| {
                let mut buf = pool.allocate(8).unwrap();
                buf.write(&[i]).unwrap();
                buf
            })
            .collect();
        let stats = pool.class_stats(class_index(8)).unwrap();
        assert_eq!(stats.pos, 100);
        assert_eq!(stats.max, 128);
        for (i, buf) in held.iter().enumerate() {
            assert_eq!(buf.as_ref(), &[i as u8]);
        }
    }

    #[test]
    fn test_concurrent_allocate_release() {
        let pool = pool();
        let handles: Vec<_> = (0..4u64)
            .map(|seed| {
                let pool = pool.clone();
                thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(seed);
                    let mut held = Vec::new();
                    for _ in 0..1_000 {
                        if held.is_empty() || rng.gen_bool(0.5) {
                            let mut buf = pool.allocate(rng.gen_range(8..=256)).unwrap();
                            buf.write(&seed.to_le_bytes()).unwrap();
                            held.push(buf);
                        } else {
                            let buf = held.swap_remove(rng.gen_range(0..held.len()));
                            assert_eq!(buf.as_ref(), seed.to_le_bytes());
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        for class in 0..CLASSES {
            assert_eq!(pool.class_stats(class).unwrap().pos, 0);
        }
    }

    #[test]
    fn test_buffers_outlive_pool_handle() {
        let pool = pool();
        let mut buf = pool.allocate(4).unwrap();
        drop(pool);
        buf.write(b"ok").unwrap();
        assert_eq!(buf.as_ref(), b"ok");
    }
}
