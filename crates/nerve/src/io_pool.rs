// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fixed pool of I/O worker threads.
//!
//! Reactors never touch a socket's data themselves: each readiness event
//! becomes one job submitted here. Every worker owns a slot id, used to pick
//! its partition of the [`BufferPool`](crate::buffer::BufferPool).

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};

/// Identity of the worker running a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerContext {
    slot: usize,
}

impl WorkerContext {
    pub fn new(slot: usize) -> Self {
        Self { slot }
    }

    /// Worker slot id (buffer pool partition).
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }
}

/// Unit of work for an I/O worker.
pub type IoJob = Box<dyn FnOnce(&WorkerContext) + Send + 'static>;

/// Fixed-size I/O worker pool.
pub struct IoPool {
    tx: RwLock<Option<Sender<IoJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl IoPool {
    /// Spawn `size` workers named `nerve-io-<slot>`.
    pub fn new(size: usize) -> io::Result<Self> {
        let (tx, rx) = channel::unbounded::<IoJob>();
        let mut workers = Vec::with_capacity(size);
        for slot in 0..size {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("nerve-io-{}", slot))
                .spawn(move || run_worker(WorkerContext::new(slot), rx))?;
            workers.push(handle);
        }
        Ok(Self {
            tx: RwLock::new(Some(tx)),
            workers: Mutex::new(workers),
            size,
        })
    }

    /// Number of workers.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a job; fails with [`Error::Closed`] after shutdown.
    pub fn submit(&self, job: IoJob) -> Result<()> {
        let tx = self.tx.read();
        let tx = tx.as_ref().ok_or(Error::Closed)?;
        tx.send(job).map_err(|_| Error::Closed)
    }

    /// Stop accepting jobs, let workers drain the queue, and join them.
    pub fn shutdown(&self) {
        self.tx.write().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                log::error!("[io] worker thread panicked");
            }
        }
    }
}

impl Drop for IoPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(ctx: WorkerContext, rx: Receiver<IoJob>) {
    log::debug!("[io-{}] worker started", ctx.slot());
    while let Ok(job) = rx.recv() {
        if panic::catch_unwind(AssertUnwindSafe(|| job(&ctx))).is_err() {
            log::error!("[io-{}] task panicked", ctx.slot());
        }
    }
    log::debug!("[io-{}] worker stopped", ctx.slot());
}
