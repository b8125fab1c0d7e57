use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::callbacks::ThreadInitCallback;
use crate::event_loop::{EventLoop, LoopHandle};

struct Startup {
    handle: Mutex<Option<LoopHandle>>,
    ready: Condvar,
}

/// Spawns a background thread that owns exactly one [`EventLoop`] for its entire lifetime.
///
/// `start()` blocks until the spawned thread has constructed its loop and published its
/// handle, so callers never observe a half-started thread. `init_cb`, if set, runs on the new
/// thread just before `EventLoop::run` is entered.
pub struct EventLoopThread {
    startup: Arc<Startup>,
    init_cb: Option<ThreadInitCallback>,
    join_handle: Option<JoinHandle<()>>,
    handle: Option<LoopHandle>,
}

impl EventLoopThread {
    pub fn new() -> EventLoopThread {
        EventLoopThread {
            startup: Arc::new(Startup {
                handle: Mutex::new(None),
                ready: Condvar::new(),
            }),
            init_cb: None,
            join_handle: None,
            handle: None,
        }
    }

    pub fn set_thread_init_callback(&mut self, cb: ThreadInitCallback) {
        self.init_cb = Some(cb);
    }

    /// Spawns the thread (idempotent: repeated calls return the same handle) and waits for its
    /// loop to come up.
    pub fn start(&mut self) -> LoopHandle {
        if let Some(handle) = &self.handle {
            return handle.clone();
        }

        let startup = self.startup.clone();
        let init_cb = self.init_cb.clone();
        let join_handle = thread::spawn(move || {
            let mut event_loop = EventLoop::new().expect("failed to create EventLoop on worker thread");
            let handle = event_loop.handle();
            {
                let mut slot = startup.handle.lock().unwrap();
                *slot = Some(handle.clone());
                startup.ready.notify_one();
            }
            if let Some(cb) = init_cb {
                cb(&handle);
            }
            event_loop.run();
        });

        let handle = {
            let mut slot = self.startup.handle.lock().unwrap();
            while slot.is_none() {
                slot = self.startup.ready.wait(slot).unwrap();
            }
            slot.clone().unwrap()
        };

        self.join_handle = Some(join_handle);
        self.handle = Some(handle.clone());
        handle
    }
}

impl Default for EventLoopThread {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.quit();
        }
        if let Some(join_handle) = self.join_handle.take() {
            let _ = join_handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn start_blocks_until_loop_is_running() {
        let mut thread = EventLoopThread::new();
        let handle = thread.start();
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        handle.run_in_loop(Box::new(move || r.store(true, Ordering::SeqCst)));
        std::thread::sleep(std::time::Duration::from_millis(30));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn repeated_start_returns_same_handle() {
        let mut thread = EventLoopThread::new();
        let a = thread.start();
        let b = thread.start();
        assert!(a.is_loop_thread() == b.is_loop_thread());
    }
}
