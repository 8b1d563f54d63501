// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Completion handles.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::StripeQueue;
use crate::error::{Error, Result};
use crate::protocol::{StripeKey, Striped, UNORDERED};

/// One message taken from a [`MergingQueue`](super::MergingQueue).
///
/// The next message of the same key stays hidden until [`done`](Self::done)
/// is called. A handle dropped without `done` completes itself.
pub struct CompletionHandle<T: Striped> {
    item: Option<T>,
    /// None for unordered messages
    key: Option<StripeKey>,
    queue: Arc<StripeQueue<T>>,
    done: AtomicBool,
}

impl<T: Striped> CompletionHandle<T> {
    pub(crate) fn new(item: T, key: Option<StripeKey>, queue: Arc<StripeQueue<T>>) -> Self {
        Self {
            item: Some(item),
            key,
            queue,
            done: AtomicBool::new(false),
        }
    }

    /// The wrapped message, unless already taken.
    pub fn item(&self) -> Option<&T> {
        self.item.as_ref()
    }

    /// Move the wrapped message out; the handle still has to be completed.
    pub fn take(&mut self) -> Option<T> {
        self.item.take()
    }

    /// Stripe key the message was queued under.
    pub fn stripe_key(&self) -> StripeKey {
        self.key.unwrap_or(UNORDERED)
    }

    /// Mark the message handled.
    ///
    /// Fails with [`Error::InvariantViolation`] when called more than once.
    pub fn done(&self) -> Result<()> {
        if self.done.swap(true, Ordering::AcqRel) {
            return Err(Error::InvariantViolation(format!(
                "completion handle for stripe {} marked done twice",
                self.stripe_key()
            )));
        }
        match self.key {
            Some(key) => self.queue.complete(key),
            None => Ok(()),
        }
    }

    /// Whether [`done`](Self::done) has been called.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

impl<T: Striped> Drop for CompletionHandle<T> {
    fn drop(&mut self) {
        if !self.is_done() {
            log::warn!(
                "[ordering] completion handle for stripe {} dropped without done()",
                self.stripe_key()
            );
            if let Err(e) = self.done() {
                log::error!("[ordering] implicit completion failed: {}", e);
            }
        }
    }
}

impl<T: Striped> fmt::Debug for CompletionHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("stripe_key", &self.stripe_key())
            .field("taken", &self.item.is_none())
            .field("done", &self.is_done())
            .finish()
    }
}
