// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fair blocking queue merging every connection's stripe queue.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::{CompletionHandle, StripeQueue};
use crate::error::{Error, Result};
use crate::protocol::Striped;

struct Inner<T> {
    /// Stripe queues with deliverable work, served FIFO
    queues: VecDeque<Arc<StripeQueue<T>>>,
    /// Bumped by `interrupt()`
    interrupts: u64,
    closed: bool,
}

/// FIFO of stripe queues feeding the dispatcher workers.
///
/// A stripe queue sits here exactly while it has deliverable work (modulo
/// the instant it is being polled). After each poll it goes to the back, so
/// connections and keys are served round-robin.
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use nerve::ordering::{MergingQueue, StripeQueue};
/// use nerve::protocol::{StripeKey, Striped};
///
/// struct Job(StripeKey);
/// impl Striped for Job {
///     fn stripe_key(&self) -> StripeKey { self.0 }
/// }
///
/// let master = Arc::new(MergingQueue::new());
/// let queue = StripeQueue::new(Arc::clone(&master));
/// queue.offer(Job(1));
/// queue.offer(Job(1));
///
/// let first = master.poll().unwrap();
/// assert!(master.poll().is_none()); // key 1 busy
/// first.done().unwrap();
/// assert!(master.poll().is_some());
/// ```
pub struct MergingQueue<T> {
    inner: Mutex<Inner<T>>,
    available: Condvar,
}

impl<T: Striped> MergingQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queues: VecDeque::new(),
                interrupts: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Append a stripe queue that just gained deliverable work.
    pub(crate) fn enlist(&self, queue: Arc<StripeQueue<T>>) {
        self.inner.lock().queues.push_back(queue);
        self.available.notify_one();
    }

    /// Next deliverable message, without blocking.
    pub fn poll(&self) -> Option<CompletionHandle<T>> {
        loop {
            let queue = self.inner.lock().queues.pop_front()?;
            let (handle, more) = queue.poll_raw();
            if more {
                self.enlist(queue);
            }
            if handle.is_some() {
                return handle;
            }
        }
    }

    /// Next deliverable message, blocking until one is available.
    ///
    /// Returns [`Error::Interrupted`] if [`interrupt`](Self::interrupt) is
    /// called while waiting, and [`Error::Closed`] once the queue is closed
    /// and nothing is deliverable.
    pub fn take(&self) -> Result<CompletionHandle<T>> {
        let start = self.inner.lock().interrupts;
        loop {
            if let Some(handle) = self.poll() {
                return Ok(handle);
            }
            let mut inner = self.inner.lock();
            if inner.interrupts != start {
                return Err(Error::Interrupted);
            }
            if inner.queues.is_empty() {
                if inner.closed {
                    return Err(Error::Closed);
                }
                self.available.wait(&mut inner);
                if inner.interrupts != start {
                    return Err(Error::Interrupted);
                }
            }
        }
    }

    /// Wake every blocked taker with [`Error::Interrupted`].
    pub fn interrupt(&self) {
        self.inner.lock().interrupts += 1;
        self.available.notify_all();
    }

    /// Stop blocking: takers return [`Error::Closed`] once drained.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.available.notify_all();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// True when no stripe queue currently has deliverable work.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().queues.is_empty()
    }

    /// Stripe queues currently enlisted.
    pub fn len(&self) -> usize {
        self.inner.lock().queues.len()
    }
}

impl<T: Striped> Default for MergingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
