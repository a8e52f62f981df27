//! Fixed pools of reusable staging buffers, one pool per size class.
//!
//! Every buffer is allocated up front. Each class keeps its free buffers in a
//! bounded channel sized to the class count, so a slot can always be
//! returned. [`BufferSlot`] is a guard: dropping it puts the buffer back.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

/// Behaviour when a class has no free buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustionPolicy {
    /// Fail immediately.
    FailFast,
    /// Wait up to `timeout` for a buffer to be released.
    Block {
        /// Maximum wait.
        timeout: Duration,
    },
}

/// One size class: `count` buffers of `size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClass {
    /// Bytes per buffer.
    pub size: usize,
    /// Number of buffers.
    pub count: usize,
}

/// Errors from the buffer pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// No class with this buffer size.
    UnknownClass(usize),
    /// Requested length exceeds the largest class.
    RequestTooLarge {
        /// Bytes requested.
        requested: usize,
        /// Largest class size.
        largest: usize,
    },
    /// No free buffer and the policy is fail-fast.
    Exhausted {
        /// Class size.
        class: usize,
    },
    /// No buffer was released within the blocking timeout.
    Timeout {
        /// Class size.
        class: usize,
    },
    /// Configuration validation failed.
    InvalidConfig(String),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownClass(size) => write!(f, "no buffer class of {size} bytes"),
            Self::RequestTooLarge { requested, largest } => {
                write!(f, "requested {requested} bytes, largest buffer is {largest}")
            }
            Self::Exhausted { class } => write!(f, "buffer pool exhausted for {class} byte class"),
            Self::Timeout { class } => write!(f, "timed out waiting for a {class} byte buffer"),
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for PoolError {}

struct Class {
    size: usize,
    count: usize,
    free_tx: Sender<Box<[u8]>>,
    free_rx: Receiver<Box<[u8]>>,
}

/// Pool of fixed-size buffers grouped by size class.
#[derive(Clone)]
pub struct BufferPool {
    classes: Arc<Vec<Class>>,
    policy: ExhaustionPolicy,
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let classes: Vec<(usize, usize, usize)> = self
            .classes
            .iter()
            .map(|c| (c.size, c.count, c.free_rx.len()))
            .collect();
        f.debug_struct("BufferPool")
            .field("classes", &classes)
            .field("policy", &self.policy)
            .finish()
    }
}

impl BufferPool {
    /// Allocate every class up front.
    pub fn new(classes: &[SizeClass], policy: ExhaustionPolicy) -> Result<Self, PoolError> {
        if classes.is_empty() {
            return Err(PoolError::InvalidConfig("no size classes".into()));
        }
        let mut sorted = classes.to_vec();
        sorted.sort_by_key(|c| c.size);
        if sorted.windows(2).any(|w| w[0].size == w[1].size) {
            return Err(PoolError::InvalidConfig("duplicate size class".into()));
        }

        let mut built = Vec::with_capacity(sorted.len());
        for class in sorted {
            if class.size == 0 || class.count == 0 {
                return Err(PoolError::InvalidConfig(
                    "size classes need a positive size and count".into(),
                ));
            }
            let (free_tx, free_rx) = bounded(class.count);
            for _ in 0..class.count {
                free_tx
                    .try_send(vec![0u8; class.size].into_boxed_slice())
                    .map_err(|e| PoolError::InvalidConfig(e.to_string()))?;
            }
            tracing::debug!(size = class.size, count = class.count, "buffer class allocated");
            built.push(Class {
                size: class.size,
                count: class.count,
                free_tx,
                free_rx,
            });
        }
        Ok(Self {
            classes: Arc::new(built),
            policy,
        })
    }

    /// Exhaustion policy in force.
    #[must_use]
    pub const fn policy(&self) -> ExhaustionPolicy {
        self.policy
    }

    /// Take a buffer from the class of exactly `class_size` bytes.
    pub fn acquire(&self, class_size: usize) -> Result<BufferSlot, PoolError> {
        let index = self.index_of(class_size)?;
        self.take(index, self.policy)
    }

    /// Take a buffer from the smallest class that holds `len` bytes.
    pub fn acquire_for(&self, len: usize) -> Result<BufferSlot, PoolError> {
        let index = self.index_for(len)?;
        self.take(index, self.policy)
    }

    /// Like [`BufferPool::acquire_for`] but never blocks.
    pub fn try_acquire_for(&self, len: usize) -> Result<BufferSlot, PoolError> {
        let index = self.index_for(len)?;
        self.take(index, ExhaustionPolicy::FailFast)
    }

    /// Return a slot explicitly. Dropping it has the same effect.
    pub fn release(&self, slot: BufferSlot) {
        drop(slot);
    }

    /// Free buffers in the class of `class_size` bytes.
    #[must_use]
    pub fn free_count(&self, class_size: usize) -> Option<usize> {
        self.index_of(class_size)
            .ok()
            .map(|i| self.classes[i].free_rx.len())
    }

    /// Configured classes, smallest first.
    #[must_use]
    pub fn classes(&self) -> Vec<SizeClass> {
        self.classes
            .iter()
            .map(|c| SizeClass {
                size: c.size,
                count: c.count,
            })
            .collect()
    }

    fn index_of(&self, class_size: usize) -> Result<usize, PoolError> {
        self.classes
            .iter()
            .position(|c| c.size == class_size)
            .ok_or(PoolError::UnknownClass(class_size))
    }

    fn index_for(&self, len: usize) -> Result<usize, PoolError> {
        self.classes
            .iter()
            .position(|c| c.size >= len)
            .ok_or_else(|| PoolError::RequestTooLarge {
                requested: len,
                largest: self.classes.last().map_or(0, |c| c.size),
            })
    }

    fn take(&self, index: usize, policy: ExhaustionPolicy) -> Result<BufferSlot, PoolError> {
        let class = &self.classes[index];
        let buf = match policy {
            ExhaustionPolicy::FailFast => class
                .free_rx
                .try_recv()
                .map_err(|_| PoolError::Exhausted { class: class.size })?,
            ExhaustionPolicy::Block { timeout } => class
                .free_rx
                .recv_timeout(timeout)
                .map_err(|_| PoolError::Timeout { class: class.size })?,
        };
        tracing::debug!(class = class.size, "buffer acquired");
        Ok(BufferSlot {
            buf: Some(buf),
            index,
            classes: Arc::clone(&self.classes),
        })
    }
}

/// A checked-out buffer. Dropping the slot returns the buffer to its class.
pub struct BufferSlot {
    buf: Option<Box<[u8]>>,
    index: usize,
    classes: Arc<Vec<Class>>,
}

impl BufferSlot {
    /// Size class the buffer belongs to.
    #[must_use]
    pub fn class_size(&self) -> usize {
        self.classes[self.index].size
    }
}

impl fmt::Debug for BufferSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferSlot")
            .field("class_size", &self.class_size())
            .finish()
    }
}

impl Deref for BufferSlot {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }
}

impl DerefMut for BufferSlot {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for BufferSlot {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            let class = &self.classes[self.index];
            if class.free_tx.try_send(buf).is_err() {
                tracing::error!(class = class.size, "buffer could not be returned to its pool");
            }
        }
    }
}
