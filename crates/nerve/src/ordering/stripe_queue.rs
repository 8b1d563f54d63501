// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-connection striped queue.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{CompletionHandle, MergingQueue};
use crate::error::{Error, Result};
use crate::protocol::{StripeKey, Striped, UNORDERED};

/// Lane served round-robin within one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lane {
    Unordered,
    Stripe(StripeKey),
}

/// Pending messages of one key.
struct SubQueue<T> {
    pending: VecDeque<T>,
    /// A handle for this key is out and not yet done
    outstanding: bool,
}

impl<T> SubQueue<T> {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            outstanding: false,
        }
    }
}

struct Inner<T> {
    unordered: VecDeque<T>,
    /// Live sub-queues: non-empty or with an outstanding handle
    stripes: HashMap<StripeKey, SubQueue<T>>,
    /// Lanes with deliverable work, in service order
    ready: VecDeque<Lane>,
    /// Currently held by the master queue
    enlisted: bool,
}

impl<T> Inner<T> {
    fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Mark enlisted if work is deliverable and the master does not hold us.
    fn needs_enlist(&mut self) -> bool {
        if !self.enlisted && self.has_ready() {
            self.enlisted = true;
            return true;
        }
        false
    }
}

/// Messages of one connection, split by stripe key.
///
/// Sub-queues are created on the first message of a key and retired once
/// drained and completed. The queue enlists itself in its [`MergingQueue`]
/// whenever it gains deliverable work.
pub struct StripeQueue<T> {
    master: Arc<MergingQueue<T>>,
    inner: Mutex<Inner<T>>,
}

impl<T: Striped> StripeQueue<T> {
    /// Create a queue feeding `master`.
    pub fn new(master: Arc<MergingQueue<T>>) -> Arc<Self> {
        Arc::new(Self {
            master,
            inner: Mutex::new(Inner {
                unordered: VecDeque::new(),
                stripes: HashMap::new(),
                ready: VecDeque::new(),
                enlisted: false,
            }),
        })
    }

    /// Append a message to the sub-queue of its key.
    pub fn offer(self: &Arc<Self>, item: T) {
        let key = item.stripe_key();
        let enlist = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if key == UNORDERED {
                if inner.unordered.is_empty() {
                    inner.ready.push_back(Lane::Unordered);
                }
                inner.unordered.push_back(item);
            } else {
                let sub = inner.stripes.entry(key).or_insert_with(SubQueue::new);
                let idle = sub.pending.is_empty() && !sub.outstanding;
                sub.pending.push_back(item);
                if idle {
                    inner.ready.push_back(Lane::Stripe(key));
                }
            }
            inner.needs_enlist()
        };
        if enlist {
            self.master.enlist(Arc::clone(self));
        }
    }

    /// Take the next deliverable message without touching the master.
    ///
    /// Returns the handle (if any) and whether more work stays deliverable.
    /// When none does, the queue is marked as no longer enlisted under the
    /// same lock, so a concurrent offer or done re-enlists it.
    pub(crate) fn poll_raw(self: &Arc<Self>) -> (Option<CompletionHandle<T>>, bool) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut handle = None;

        while let Some(lane) = inner.ready.pop_front() {
            match lane {
                Lane::Unordered => {
                    if let Some(item) = inner.unordered.pop_front() {
                        if !inner.unordered.is_empty() {
                            inner.ready.push_back(Lane::Unordered);
                        }
                        handle = Some(CompletionHandle::new(item, None, Arc::clone(self)));
                        break;
                    }
                }
                Lane::Stripe(key) => {
                    if let Some(sub) = inner.stripes.get_mut(&key) {
                        if let Some(item) = sub.pending.pop_front() {
                            sub.outstanding = true;
                            handle = Some(CompletionHandle::new(item, Some(key), Arc::clone(self)));
                            break;
                        }
                    }
                }
            }
        }

        let more = inner.has_ready();
        if !more {
            inner.enlisted = false;
        }
        (handle, more)
    }

    /// Release the outstanding handle of `key`, exposing its next message.
    pub(crate) fn complete(self: &Arc<Self>, key: StripeKey) -> Result<()> {
        let enlist = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let Some(sub) = inner.stripes.get_mut(&key) else {
                return Err(Error::InvariantViolation(format!(
                    "completion for unknown stripe {key}"
                )));
            };
            if !sub.outstanding {
                return Err(Error::InvariantViolation(format!(
                    "stripe {key} has no outstanding handle"
                )));
            }
            sub.outstanding = false;
            if sub.pending.is_empty() {
                inner.stripes.remove(&key);
            } else {
                inner.ready.push_back(Lane::Stripe(key));
            }
            inner.needs_enlist()
        };
        if enlist {
            self.master.enlist(Arc::clone(self));
        }
        Ok(())
    }

    /// True when no message is pending (outstanding handles do not count).
    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.unordered.is_empty() && inner.stripes.values().all(|s| s.pending.is_empty())
    }

    /// Number of pending messages.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.unordered.len() + inner.stripes.values().map(|s| s.pending.len()).sum::<usize>()
    }

    /// Number of live sub-queues.
    pub fn stripe_count(&self) -> usize {
        self.inner.lock().stripes.len()
    }
}
