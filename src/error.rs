use std::thread::ThreadId;

/// Conditions the library reports that are not `errno`-shaped.
///
/// Every syscall failure surfaces as `std::io::Error` instead; this enum exists for the
/// handful of invariant-style conditions a constructor can fail with before any fd is ever
/// involved.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("server already listening")]
    AlreadyListening,

    #[error("operation attempted off the owning loop's thread (loop: {loop_thread:?}, current: {current_thread:?})")]
    NotOnLoopThread {
        loop_thread: ThreadId,
        current_thread: ThreadId,
    },

    #[error("an EventLoop already exists on this thread")]
    LoopAlreadyExists,
}

pub type Result<T> = std::result::Result<T, Error>;
