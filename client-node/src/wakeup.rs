//! Wakeup bridge (C5): drains the inbound transport ring whenever the
//! client-to-proxy eventfd becomes readable, and dispatches the parsed
//! events to the installed `NodeCallbacks`.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};

use spa_support::{EventLoop, IoMask, SourceId};

use crate::proxy::ProxyNode;

/// Registers the bridge on `data_loop` for the lifetime of this value;
/// dropping it tears down the source.
pub struct WakeupBridge {
    loop_: EventLoop,
    source: SourceId,
}

impl WakeupBridge {
    /// `from_client_fd` is the end of the wakeup eventfd pair this process
    /// reads; `proxy` owns the transport and the installed callbacks.
    /// `on_error` runs once if the fd reports `err`/`hup` — the owning
    /// `ClientNode` uses it to begin its destroy cascade.
    pub fn install(
        data_loop: &EventLoop,
        from_client_fd: OwnedFd,
        proxy: Arc<Mutex<ProxyNode>>,
        mut on_error: impl FnMut() + Send + 'static,
    ) -> std::io::Result<Self> {
        let raw = from_client_fd.as_raw_fd();
        // Keep the fd alive for as long as the source is registered.
        let fd_holder = from_client_fd;
        let source = data_loop.add_io(raw, IoMask::IN | IoMask::ERR | IoMask::HUP, move |mask| {
            let _ = &fd_holder;
            if mask.contains(IoMask::ERR) || mask.contains(IoMask::HUP) {
                log::warn!("wakeup bridge: data fd error, client is gone");
                on_error();
                return;
            }
            if !drain_token(raw) {
                log::warn!("wakeup bridge: failed reading wakeup token, stopping");
                return;
            }
            proxy.lock().unwrap().drain_from_client();
        })?;
        Ok(Self {
            loop_: data_loop.clone(),
            source,
        })
    }
}

impl Drop for WakeupBridge {
    fn drop(&mut self) {
        self.loop_.destroy_source(self.source);
    }
}

fn drain_token(fd: RawFd) -> bool {
    let mut buf = [0u8; 8];
    // SAFETY: `fd` stays valid for the call; it is owned by `fd_holder` in
    // `install` for as long as the source exists.
    let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
    match rustix::io::read(borrowed, &mut buf) {
        Ok(n) => n == 8,
        Err(_) => false,
    }
}
