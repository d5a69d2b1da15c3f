//! A fixed-size pool of single-threaded reactors, each pinned to its own
//! worker thread.
//!
//! Each reactor is a dedicated current-thread `tokio::runtime::Runtime`
//! running on its own OS thread; a held `oneshot::Receiver` keeps it alive
//! as a work guard that only resolves once `stop()` fires. Connections are
//! handed out round-robin via `acquire()`.
//!
//! A `tokio::runtime::Handle` can schedule work onto its runtime from any
//! thread, so `acquire()` can be called from the acceptor's own task while
//! still guaranteeing that every future spawned through the returned handle
//! runs, start to finish, on that one reactor's worker thread — which is
//! exactly what lets a `Session` be "pinned" without any per-session locks.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::oneshot;

use crate::{info, warn};

struct Reactor {
    handle: tokio::runtime::Handle,
    stop_tx: Option<oneshot::Sender<()>>,
    worker: Option<std::thread::JoinHandle<()>>,
}

/// A fixed-size collection of independent event loops, each pinned to one
/// worker thread.
pub struct ReactorPool {
    reactors: Vec<Reactor>,
    next: AtomicUsize,
}

impl ReactorPool {
    /// Spawns `count` reactors, each on its own OS thread. `count == 0` is
    /// treated as 1.
    pub fn new(count: usize) -> std::io::Result<Self> {
        let count = count.max(1);
        let mut reactors = Vec::with_capacity(count);
        for index in 0..count {
            reactors.push(Self::spawn_reactor(index)?);
        }
        info!(target: "[REACTOR]", "started {} reactor(s)", count);
        Ok(Self {
            reactors,
            next: AtomicUsize::new(0),
        })
    }

    fn spawn_reactor(index: usize) -> std::io::Result<Reactor> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();
        let (stop_tx, stop_rx) = oneshot::channel();

        let worker = std::thread::Builder::new()
            .name(format!("reactor-{index}"))
            .spawn(move || {
                // The work guard: block_on never returns until stop() drops
                // the sender or fires it, keeping the runtime alive even
                // when it momentarily has no spawned work.
                runtime.block_on(async move {
                    let _ = stop_rx.await;
                });
            })?;

        Ok(Reactor {
            handle,
            stop_tx: Some(stop_tx),
            worker: Some(worker),
        })
    }

    /// Hands out one reactor's handle in strict round-robin. Never fails.
    pub fn acquire(&self) -> tokio::runtime::Handle {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.reactors.len();
        self.reactors[i].handle.clone()
    }

    pub fn worker_count(&self) -> usize {
        self.reactors.len()
    }

    /// Idempotent: signals every reactor to exit and joins its thread.
    /// After this returns, no new I/O is scheduled on any reactor.
    pub fn stop(&mut self) {
        for reactor in &mut self.reactors {
            if let Some(tx) = reactor.stop_tx.take() {
                let _ = tx.send(());
            }
        }
        for reactor in &mut self.reactors {
            if let Some(worker) = reactor.worker.take()
                && let Err(err) = worker.join()
            {
                warn!(target: "[REACTOR]", "reactor worker panicked: {err:?}");
            }
        }
    }
}

impl Drop for ReactorPool {
    fn drop(&mut self) {
        self.stop();
    }
}
