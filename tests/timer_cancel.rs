use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fishreactor::timer::TimerId;
use fishreactor::EventLoop;

/// A repeating 10ms timer cancels itself from inside its own callback; it must not fire again.
#[test]
fn repeating_timer_cancels_itself_during_fire() {
    let mut event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();

    let fire_count = Arc::new(AtomicUsize::new(0));
    let id_slot: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));

    let count_cb = fire_count.clone();
    let id_cb = id_slot.clone();
    let handle_cb = handle.clone();
    let id = handle.run_every(
        Duration::from_millis(10),
        Box::new(move || {
            count_cb.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = *id_cb.lock().unwrap() {
                handle_cb.cancel(id);
            }
        }),
    );
    *id_slot.lock().unwrap() = Some(id);

    let h = handle.clone();
    handle.run_after(
        Duration::from_millis(100),
        Box::new(move || h.quit()),
    );
    event_loop.run();

    assert_eq!(fire_count.load(Ordering::SeqCst), 1);
}
