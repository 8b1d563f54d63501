// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Handler dispatch.
//!
//! A fixed pool of worker threads takes messages from the engine-wide
//! [`MergingQueue`], resolves their handler through the protocol and runs it
//! with the session of the connection the message arrived on.
//!
//! ```text
//!   MergingQueue::take()
//!          |
//!          v
//!   catch_unwind {
//!       protocol.handler(msg)        --none-------> shutdown connection
//!       handler.handle(session, msg) --err/panic--> shutdown connection
//!   }
//!          |
//!          v
//!   CompletionHandle::done()      (always)
//! ```
//!
//! A panic outside the per-message guard, such as one raised while the
//! message or its session is dropped, ends the worker thread; a guard spawns
//! a replacement in the same slot.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::connection::Inbound;
use crate::error::{panic_message, Error};
use crate::metrics::EngineMetrics;
use crate::ordering::{CompletionHandle, MergingQueue};
use crate::protocol::Protocol;

struct Shared<P: Protocol> {
    protocol: Arc<P>,
    master: Arc<MergingQueue<Inbound<P>>>,
    metrics: Arc<EngineMetrics>,
    running: AtomicBool,
    /// One join handle per worker slot
    workers: Mutex<Vec<Option<JoinHandle<()>>>>,
}

/// Fixed pool of handler threads.
pub struct Dispatcher<P: Protocol> {
    shared: Arc<Shared<P>>,
    size: usize,
}

impl<P: Protocol> Dispatcher<P> {
    /// Spawn `size` workers named `nerve-dispatch-<slot>`.
    pub fn start(
        protocol: Arc<P>,
        master: Arc<MergingQueue<Inbound<P>>>,
        metrics: Arc<EngineMetrics>,
        size: usize,
    ) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            protocol,
            master,
            metrics,
            running: AtomicBool::new(true),
            workers: Mutex::new((0..size).map(|_| None).collect()),
        });
        for slot in 0..size {
            spawn_worker(&shared, slot)?;
        }
        Ok(Self { shared, size })
    }

    /// Number of worker slots.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Stop every worker and wait for them.
    pub fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared.master.interrupt();
        self.shared.master.close();

        // A worker respawned while we joined leaves a fresh handle behind.
        loop {
            let handles: Vec<_> = self
                .shared
                .workers
                .lock()
                .iter_mut()
                .filter_map(Option::take)
                .collect();
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if handle.join().is_err() {
                    log::debug!("[dispatch] worker exited by panic");
                }
            }
        }
        log::debug!("[dispatch] stopped");
    }
}

impl<P: Protocol> Drop for Dispatcher<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Workers
// ============================================================================

fn spawn_worker<P: Protocol>(shared: &Arc<Shared<P>>, slot: usize) -> io::Result<()> {
    let worker_shared = Arc::clone(shared);
    let handle = thread::Builder::new()
        .name(format!("nerve-dispatch-{}", slot))
        .spawn(move || run_worker(worker_shared, slot))?;
    if let Some(entry) = shared.workers.lock().get_mut(slot) {
        *entry = Some(handle);
    }
    Ok(())
}

/// Respawns the worker if its thread unwinds.
struct RespawnGuard<P: Protocol> {
    shared: Arc<Shared<P>>,
    slot: usize,
}

impl<P: Protocol> Drop for RespawnGuard<P> {
    fn drop(&mut self) {
        if !thread::panicking() || !self.shared.running.load(Ordering::Acquire) {
            return;
        }
        log::error!("[dispatch-{}] worker died, respawning", self.slot);
        self.shared.metrics.record_worker_respawn();
        if let Err(e) = spawn_worker(&self.shared, self.slot) {
            log::error!("[dispatch-{}] respawn failed: {}", self.slot, e);
        }
    }
}

fn run_worker<P: Protocol>(shared: Arc<Shared<P>>, slot: usize) {
    let _guard = RespawnGuard {
        shared: Arc::clone(&shared),
        slot,
    };
    log::debug!("[dispatch-{}] worker started", slot);

    while shared.running.load(Ordering::Acquire) {
        let mut handle = match shared.master.take() {
            Ok(handle) => handle,
            Err(Error::Interrupted) => continue,
            Err(Error::Closed) => break,
            Err(e) => {
                log::error!("[dispatch-{}] take failed: {}", slot, e);
                break;
            }
        };
        dispatch(&shared, slot, &mut handle);
        if let Err(e) = handle.done() {
            log::error!("[dispatch-{}] {}", slot, e);
        }
    }
    log::debug!("[dispatch-{}] worker stopped", slot);
}

/// Run the handler for one message.
///
/// Handler failures shut the originating connection down; they never reach
/// the worker loop.
fn dispatch<P: Protocol>(shared: &Shared<P>, slot: usize, handle: &mut CompletionHandle<Inbound<P>>) {
    let Some(Inbound {
        link,
        session,
        message,
    }) = handle.take()
    else {
        return;
    };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let handler = shared
            .protocol
            .handler(&message)
            .ok_or_else(|| Error::ProtocolLookup("no handler registered for message".into()))?;
        shared.metrics.record_dispatched();
        handler
            .handle(&session, message)
            .map_err(|e| Error::Handler(e.to_string()))
    }));

    let err = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e,
        Err(payload) => Error::Handler(format!("panicked: {}", panic_message(&*payload))),
    };
    log::warn!(
        "[dispatch-{}] conn-{} ({}): {}",
        slot,
        link.id(),
        link.peer_addr(),
        err
    );
    shared.metrics.record_handler_failure();
    link.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnId, Link};
    use crate::error::Result;
    use crate::ordering::StripeQueue;
    use crate::protocol::{Decoder, Encoder, Handler, HandlerError, Seek, StripeKey, Striped};
    use std::time::{Duration, Instant};

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct Job {
        key: StripeKey,
        seq: u32,
    }

    impl Striped for Job {
        fn stripe_key(&self) -> StripeKey {
            self.key
        }
    }

    /// Records every job; seq 13 makes the handler panic, seq 99 makes the
    /// lookup itself panic.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Job>>,
    }

    /// Session that panics when dropped while armed.
    #[derive(Default)]
    struct Tripwire {
        armed: bool,
    }

    impl Drop for Tripwire {
        fn drop(&mut self) {
            if self.armed && !thread::panicking() {
                panic!("session torn down");
            }
        }
    }

    impl Handler<RecordingProtocol> for Recorder {
        fn handle(&self, _session: &Tripwire, job: Job) -> std::result::Result<(), HandlerError> {
            if job.seq == 13 {
                panic!("unlucky job");
            }
            if job.seq == 7 {
                return Err("rejected".into());
            }
            self.seen.lock().push(job);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingProtocol {
        recorder: Recorder,
    }

    impl Protocol for RecordingProtocol {
        type Message = Job;
        type Session = Tripwire;

        fn header_size(&self) -> usize {
            1
        }

        fn max_message_size(&self) -> usize {
            1
        }

        fn seek_to_header(&self, _window: &[u8]) -> Seek {
            Seek::Found(0)
        }

        fn body_size(&self, _header: &[u8]) -> Result<usize> {
            Ok(0)
        }

        fn decoder(&self, _header: &[u8]) -> Option<&dyn Decoder<Job>> {
            None
        }

        fn encoder(&self, _message: &Job) -> Option<&dyn Encoder<Job>> {
            None
        }

        fn handler(&self, message: &Job) -> Option<&dyn Handler<Self>> {
            match message.seq {
                99 => panic!("lookup blew up"),
                500 => None,
                _ => Some(&self.recorder),
            }
        }

        fn new_session(&self, _link: Link<Self>) -> Tripwire {
            Tripwire::default()
        }
    }

    struct Fixture {
        protocol: Arc<RecordingProtocol>,
        master: Arc<MergingQueue<Inbound<RecordingProtocol>>>,
        metrics: Arc<EngineMetrics>,
        dispatcher: Dispatcher<RecordingProtocol>,
    }

    fn fixture(workers: usize) -> Fixture {
        let protocol = Arc::new(RecordingProtocol::default());
        let master = Arc::new(MergingQueue::new());
        let metrics = Arc::new(EngineMetrics::new());
        let dispatcher = Dispatcher::start(
            Arc::clone(&protocol),
            Arc::clone(&master),
            Arc::clone(&metrics),
            workers,
        )
        .unwrap();
        Fixture {
            protocol,
            master,
            metrics,
            dispatcher,
        }
    }

    fn inbound(conn: ConnId, job: Job) -> Inbound<RecordingProtocol> {
        Inbound {
            link: Link::detached(conn, "127.0.0.1:1".parse().unwrap()),
            session: Arc::new(Tripwire::default()),
            message: job,
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_per_key_order_across_workers() {
        let fx = fixture(4);
        let queue = StripeQueue::new(Arc::clone(&fx.master));
        for seq in 0..400u32 {
            let seq = seq + 1000;
            queue.offer(inbound(1, Job { key: (seq % 4) as i32, seq }));
        }

        assert!(wait_for(|| fx.protocol.recorder.seen.lock().len() == 400));
        let seen = fx.protocol.recorder.seen.lock().clone();
        for key in 0..4 {
            let seqs: Vec<u32> = seen.iter().filter(|j| j.key == key).map(|j| j.seq).collect();
            let mut sorted = seqs.clone();
            sorted.sort_unstable();
            assert_eq!(seqs, sorted, "key {} out of order", key);
        }
        assert_eq!(fx.metrics.messages_dispatched(), 400);
        fx.dispatcher.shutdown();
    }

    #[test]
    fn test_handler_failures_do_not_stop_workers() {
        let fx = fixture(1);
        let queue = StripeQueue::new(Arc::clone(&fx.master));
        queue.offer(inbound(1, Job { key: 0, seq: 13 }));
        queue.offer(inbound(1, Job { key: 0, seq: 7 }));
        queue.offer(inbound(1, Job { key: 0, seq: 500 }));
        queue.offer(inbound(1, Job { key: 0, seq: 99 }));
        queue.offer(inbound(1, Job { key: 0, seq: 1 }));

        assert!(wait_for(|| fx.protocol.recorder.seen.lock().len() == 1));
        assert!(wait_for(|| fx.metrics.snapshot().handler_failures == 4));
        assert_eq!(fx.metrics.snapshot().worker_respawns, 0);
        assert_eq!(fx.metrics.messages_dispatched(), 3);
        assert!(queue.is_empty());
        fx.dispatcher.shutdown();
    }

    #[test]
    fn test_panic_outside_guard_respawns_worker() {
        let fx = fixture(1);
        let queue = StripeQueue::new(Arc::clone(&fx.master));
        let mut first = inbound(1, Job { key: 3, seq: 1 });
        first.session = Arc::new(Tripwire { armed: true });
        queue.offer(first);
        queue.offer(inbound(1, Job { key: 3, seq: 2 }));

        assert!(wait_for(|| fx.protocol.recorder.seen.lock().len() == 2));
        assert_eq!(fx.metrics.snapshot().worker_respawns, 1);
        assert_eq!(fx.metrics.snapshot().handler_failures, 0);
        assert!(fx.dispatcher.is_running());
        fx.dispatcher.shutdown();
        assert!(!fx.dispatcher.is_running());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let fx = fixture(2);
        fx.dispatcher.shutdown();
        fx.dispatcher.shutdown();
        assert!(fx.master.is_closed());
        assert_eq!(fx.dispatcher.size(), 2);
    }
}
