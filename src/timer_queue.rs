use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

use crate::timer::{Timer, TimerCallback, TimerId};

/// Priority-ordered set of timers, keyed by `(expiration, sequence)` so two timers due at the
/// same instant still have a total order. Driven externally by [`crate::event_loop::EventLoop`]
/// reading a `timerfd` and calling [`TimerQueue::handle_expired`] once per wakeup.
#[derive(Default)]
pub struct TimerQueue {
    timers: BTreeMap<(Instant, i64), Timer>,
    expiration_of: HashMap<i64, Instant>,
    calling_expired: bool,
    canceling: HashSet<i64>,
}

impl TimerQueue {
    pub fn new() -> TimerQueue {
        TimerQueue::default()
    }

    pub fn add_timer(&mut self, callback: TimerCallback, when: Instant, interval: std::time::Duration) -> TimerId {
        let timer = Timer::new(callback, when, interval);
        let sequence = timer.sequence();
        self.expiration_of.insert(sequence, when);
        self.timers.insert((when, sequence), timer);
        TimerId::new(sequence)
    }

    /// No-op if the timer already fired (non-repeating) or was already canceled. If called
    /// from within the timer's own callback during [`TimerQueue::handle_expired`], the
    /// timer is recorded as canceling so it isn't reinserted after this round.
    pub fn cancel(&mut self, id: TimerId) {
        if let Some(when) = self.expiration_of.remove(&id.sequence) {
            self.timers.remove(&(when, id.sequence));
        } else if self.calling_expired {
            self.canceling.insert(id.sequence);
        }
    }

    pub fn next_expiration(&self) -> Option<Instant> {
        self.timers.keys().next().map(|&(when, _)| when)
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    fn pop_expired(&mut self, now: Instant) -> Vec<Timer> {
        let mut expired = Vec::new();
        loop {
            let key = match self.timers.keys().next() {
                Some(&k) if k.0 <= now => k,
                _ => break,
            };
            let timer = self.timers.remove(&key).expect("key just observed");
            self.expiration_of.remove(&key.1);
            expired.push(timer);
        }
        expired
    }

    /// Runs every timer due at or before `now`, then reinserts repeating ones that were not
    /// canceled from within their own callback.
    pub fn handle_expired(&mut self, now: Instant) {
        let mut expired = self.pop_expired(now);
        self.calling_expired = true;
        self.canceling.clear();
        for timer in expired.iter_mut() {
            timer.run();
        }
        self.calling_expired = false;

        for mut timer in expired {
            if timer.repeat() && !self.canceling.contains(&timer.sequence()) {
                timer.reset(now);
                let sequence = timer.sequence();
                let when = timer.expiration();
                self.expiration_of.insert(sequence, when);
                self.timers.insert((when, sequence), timer);
            }
        }
        self.canceling.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[test]
    fn timers_fire_in_expiration_order() {
        let mut queue = TimerQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let base = Instant::now();

        let o = order.clone();
        queue.add_timer(Box::new(move || o.lock().unwrap().push(2)), base + Duration::from_millis(20), Duration::ZERO);
        let o = order.clone();
        queue.add_timer(Box::new(move || o.lock().unwrap().push(1)), base + Duration::from_millis(10), Duration::ZERO);

        queue.handle_expired(base + Duration::from_millis(25));
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn cancel_before_fire_is_noop_fire() {
        let mut queue = TimerQueue::new();
        let fired = Arc::new(Mutex::new(false));
        let f = fired.clone();
        let base = Instant::now();
        let id = queue.add_timer(Box::new(move || *f.lock().unwrap() = true), base + Duration::from_millis(10), Duration::ZERO);
        queue.cancel(id);
        queue.handle_expired(base + Duration::from_millis(20));
        assert!(!*fired.lock().unwrap());
    }

    #[test]
    fn cancel_between_fires_stops_repeats() {
        let mut queue = TimerQueue::new();
        let count = Arc::new(Mutex::new(0));
        let base = Instant::now();
        let c = count.clone();
        let id = queue.add_timer(
            Box::new(move || *c.lock().unwrap() += 1),
            base + Duration::from_millis(10),
            Duration::from_millis(10),
        );
        queue.handle_expired(base + Duration::from_millis(10));
        assert_eq!(*count.lock().unwrap(), 1);

        queue.cancel(id);
        queue.handle_expired(base + Duration::from_millis(30));
        assert_eq!(*count.lock().unwrap(), 1);
        assert!(queue.is_empty());
    }
}
