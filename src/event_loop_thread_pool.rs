use std::sync::atomic::{AtomicUsize, Ordering};

use crate::callbacks::ThreadInitCallback;
use crate::event_loop::LoopHandle;
use crate::event_loop_thread::EventLoopThread;

/// A fixed-size pool of [`EventLoopThread`]s, handed out round-robin by [`get_next_loop`].
///
/// `num_threads == 0` is the single-threaded case: every operation runs on the loop that owns
/// the pool (`base_loop`), and `get_next_loop` just returns it back.
pub struct EventLoopThreadPool {
    base_loop: LoopHandle,
    threads: Vec<EventLoopThread>,
    handles: Vec<LoopHandle>,
    next: AtomicUsize,
    started: bool,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: LoopHandle) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop,
            threads: Vec::new(),
            handles: Vec::new(),
            next: AtomicUsize::new(0),
            started: false,
        }
    }

    /// Spawns `num_threads` worker loops, running `init_cb` (if any) on each as it comes up.
    /// Must be called at most once, from the base loop's thread.
    pub fn start(&mut self, num_threads: usize, init_cb: Option<ThreadInitCallback>) {
        assert!(!self.started, "EventLoopThreadPool::start called twice");
        self.started = true;
        self.base_loop.assert_loop_thread();

        for _ in 0..num_threads {
            let mut thread = EventLoopThread::new();
            if let Some(cb) = init_cb.clone() {
                thread.set_thread_init_callback(cb);
            }
            let handle = thread.start();
            self.handles.push(handle);
            self.threads.push(thread);
        }
    }

    /// Returns the next loop to hand a new connection to, cycling through the pool. With no
    /// worker threads, always returns the base loop.
    pub fn get_next_loop(&self) -> LoopHandle {
        if self.handles.is_empty() {
            return self.base_loop.clone();
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.handles.len();
        self.handles[i].clone()
    }

    pub fn all_loops(&self) -> Vec<LoopHandle> {
        if self.handles.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            self.handles.clone()
        }
    }

    pub fn num_threads(&self) -> usize {
        self.handles.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;

    #[test]
    fn zero_threads_returns_base_loop() {
        let event_loop = EventLoop::new().unwrap();
        let base = event_loop.handle();
        let pool = EventLoopThreadPool::new(base.clone());
        assert!(pool.get_next_loop().is_loop_thread() == base.is_loop_thread());
    }

    #[test]
    fn round_robins_across_workers() {
        let event_loop = EventLoop::new().unwrap();
        let base = event_loop.handle();
        let mut pool = EventLoopThreadPool::new(base);
        pool.start(3, None);
        assert_eq!(pool.num_threads(), 3);
        assert_eq!(pool.all_loops().len(), 3);
        // four picks over three workers must repeat the first one
        let picks: Vec<LoopHandle> = (0..4).map(|_| pool.get_next_loop()).collect();
        assert!(picks[0].is_loop_thread() == picks[3].is_loop_thread());
    }
}
