//! Minimal event loop abstraction, standing in for the event loop
//! abstraction collaborator this subsystem treats as an external dependency
//! rather than something it implements. We only implement the handful of
//! operations the core actually calls: `add_io`/`update_io`/`destroy_source`
//! for registering fd readiness callbacks, and `invoke` for the cross-loop
//! `submit-to-loop` primitive.
//!
//! Each `EventLoop` is backed by its own single-threaded tokio runtime
//! running on a dedicated OS thread, which is what makes the "main loop" /
//! "data loop" split real rather than nominal: invoking from a different
//! loop than the one you're on genuinely crosses a thread boundary, and
//! invoking from the loop you're already on runs inline.

use std::future::Future;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::unix::AsyncFd;
use tokio::runtime::Builder;
use tokio::task::JoinHandle;

pub type SourceId = u64;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IoMask(u8);

impl IoMask {
    pub const IN: IoMask = IoMask(1 << 0);
    pub const OUT: IoMask = IoMask(1 << 1);
    pub const HUP: IoMask = IoMask(1 << 2);
    pub const ERR: IoMask = IoMask(1 << 3);

    pub fn contains(self, other: IoMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for IoMask {
    type Output = IoMask;
    fn bitor(self, rhs: IoMask) -> IoMask {
        IoMask(self.0 | rhs.0)
    }
}

struct Inner {
    name: &'static str,
    handle: tokio::runtime::Handle,
    thread_id: std::thread::ThreadId,
    next_id: AtomicU64,
    sources: Mutex<std::collections::HashMap<SourceId, JoinHandle<()>>>,
    shutdown: Mutex<Option<std::sync::mpsc::Sender<()>>>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

/// A cooperative single-threaded loop. Cloning an `EventLoop` is cheap and
/// gives another handle to the same loop (the way the original's `SpaLoop*`
/// is shared between the collaborators that register sources on it).
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<Inner>,
}

impl EventLoop {
    /// Spawns a dedicated OS thread, builds a `current_thread` runtime on
    /// it, and parks that thread inside `block_on` for the loop's entire
    /// lifetime. The thread never does anything else, so its id is a stable,
    /// genuine answer to "am I on this loop" for as long as the `EventLoop`
    /// lives.
    pub fn new(name: &'static str) -> std::io::Result<Self> {
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();

        let worker = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let runtime = match Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e));
                        return;
                    }
                };
                let handle = runtime.handle().clone();
                let thread_id = std::thread::current().id();
                if handle_tx.send(Ok((handle, thread_id))).is_err() {
                    return;
                }
                // Park here for the loop's lifetime: tasks spawned via
                // `handle` still run (a current_thread runtime polls tasks
                // whenever something on it calls block_on/park), and this
                // blocks until `shutdown_tx` is dropped or fires.
                let _ = runtime.block_on(async move {
                    tokio::task::spawn_blocking(move || shutdown_rx.recv())
                        .await
                        .ok()
                });
            })?;

        let (handle, thread_id) = handle_rx
            .recv()
            .expect("loop worker thread died before reporting its handle")?;

        Ok(Self {
            inner: Arc::new(Inner {
                name,
                handle,
                thread_id,
                next_id: AtomicU64::new(1),
                sources: Mutex::new(std::collections::HashMap::new()),
                shutdown: Mutex::new(Some(shutdown_tx)),
                worker: Mutex::new(Some(worker)),
            }),
        })
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    fn on_this_loop(&self) -> bool {
        std::thread::current().id() == self.inner.thread_id
    }

    /// `spa_loop_invoke`: run `f` on this loop. If the caller is already
    /// running on this loop the call is inline (no hop); otherwise it is
    /// marshalled across the loop-crossing boundary and this call blocks
    /// until it completes, matching the synchronous semantics expected of
    /// `submit-to-loop`.
    pub fn invoke<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.on_this_loop() {
            return f();
        }
        let (tx, rx) = std::sync::mpsc::channel();
        self.inner.handle.spawn(async move {
            let _ = tx.send(f());
        });
        rx.recv().expect("invoke target loop dropped result")
    }

    /// Register an fd for readiness notification. `callback` runs on this
    /// loop's own thread every time `mask` matches what's ready.
    pub fn add_io<F>(&self, fd: RawFd, mask: IoMask, mut callback: F) -> std::io::Result<SourceId>
    where
        F: FnMut(IoMask) + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let borrowed = BorrowedRawFd(fd);
        let handle = self.inner.handle.spawn(async move {
            let async_fd = match AsyncFd::new(borrowed) {
                Ok(a) => a,
                Err(e) => {
                    log::error!("add_io: AsyncFd::new failed: {e}");
                    return;
                }
            };
            loop {
                let ready = if mask.contains(IoMask::OUT) {
                    async_fd.writable().await
                } else {
                    async_fd.readable().await
                };
                let mut guard = match ready {
                    Ok(g) => g,
                    Err(e) => {
                        log::warn!("add_io: readiness wait failed: {e}");
                        callback(IoMask::ERR | IoMask::HUP);
                        return;
                    }
                };
                let observed = if guard.ready().is_read_closed() || guard.ready().is_write_closed() {
                    IoMask::HUP
                } else if mask.contains(IoMask::OUT) {
                    IoMask::OUT
                } else {
                    IoMask::IN
                };
                callback(observed);
                guard.clear_ready();
            }
        });
        self.inner.sources.lock().unwrap().insert(id, handle);
        Ok(id)
    }

    pub fn destroy_source(&self, id: SourceId) {
        if let Some(handle) = self.inner.sources.lock().unwrap().remove(&id) {
            handle.abort();
        }
    }

    /// Spawn a future on this loop without blocking for its result. Used by
    /// the data loop's own readiness-driven tasks, and by tests that need
    /// to drive the loop.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.handle.spawn(fut);
    }

    /// Runs `fut` to completion on this loop's worker thread, blocking the
    /// calling thread until it finishes. Only valid to call from a thread
    /// that is not itself this loop's worker.
    pub fn block_on<F>(&self, fut: F) -> F::Output
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.invoke_async(fut)
    }

    fn invoke_async<F>(&self, fut: F) -> F::Output
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (tx, rx) = std::sync::mpsc::channel();
        self.inner.handle.spawn(async move {
            let _ = tx.send(fut.await);
        });
        rx.recv().expect("invoke target loop dropped result")
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        drop(self.shutdown.lock().unwrap().take());
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

/// `AsyncFd` needs an owned-ish `AsRawFd` source; the loop never owns the
/// fds it's asked to watch (the `client-node` transport/data fds are owned
/// by `ClientNode`), so this wrapper only ever borrows.
struct BorrowedRawFd(RawFd);

impl AsRawFd for BorrowedRawFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn invoke_inline_when_already_on_loop() {
        let lp = EventLoop::new("test").unwrap();
        let lp2 = lp.clone();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        // Calling invoke() from a task already running on lp's own worker
        // thread must not spawn a second hop: the inner invoke observes
        // on_this_loop() == true and runs f() inline.
        lp.block_on(async move {
            lp2.invoke(move || {
                ran2.store(true, Ordering::SeqCst);
            });
        });
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn invoke_crosses_loop() {
        let lp = EventLoop::new("test").unwrap();
        let result = lp.invoke(|| 42);
        assert_eq!(result, 42);
    }

    #[test]
    fn block_on_runs_on_worker_thread() {
        let lp = EventLoop::new("test").unwrap();
        let id = lp.block_on(async { std::thread::current().id() });
        assert_ne!(id, std::thread::current().id());
    }
}
