// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Striped ordering engine.
//!
//! ```text
//!  connection A: StripeQueue [key 1: m1 m3] [key 2: m2] [unordered: u1]
//!  connection B: StripeQueue [key 1: n1]
//!                      |  enlist when deliverable work appears
//!                      v
//!             MergingQueue (FIFO of StripeQueues)
//!                      |  take() round-robin
//!                      v
//!              CompletionHandle --done()--> next message of that key
//! ```
//!
//! Within one connection, messages with the same key are handed out one at
//! a time in offer order: the next one becomes visible only after the
//! previous handle is marked done. Unordered messages are handed out freely.

mod completion;
mod merging;
mod stripe_queue;

pub use completion::CompletionHandle;
pub use merging::MergingQueue;
pub use stripe_queue::StripeQueue;
