use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A deadline queue. Entries are armed with [`Timer::timeout`], cancelled
/// by id, and collected by [`Timer::poll`] from the endpoint's background
/// tick; nothing fires between polls, which gives the transaction layer
/// its tick-granularity timing.
pub struct Timer<T> {
    inner: Mutex<TimerInner<T>>,
}

struct TimerInner<T> {
    next_id: u64,
    entries: BTreeMap<(Instant, u64), T>,
    deadlines: HashMap<u64, Instant>,
}

impl<T> Timer<T> {
    pub fn new() -> Self {
        Timer {
            inner: Mutex::new(TimerInner {
                next_id: 0,
                entries: BTreeMap::new(),
                deadlines: HashMap::new(),
            }),
        }
    }

    pub fn timeout(&self, after: Duration, value: T) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = inner.next_id;
        let deadline = Instant::now() + after;
        inner.entries.insert((deadline, id), value);
        inner.deadlines.insert(id, deadline);
        id
    }

    pub fn cancel(&self, id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.deadlines.remove(&id) {
            Some(deadline) => inner.entries.remove(&(deadline, id)).is_some(),
            None => false,
        }
    }

    /// Remove and return every entry due at `now`.
    pub fn poll(&self, now: Instant) -> Vec<T> {
        let mut inner = self.inner.lock().unwrap();
        let mut fired = Vec::new();
        loop {
            let key = match inner.entries.keys().next() {
                Some((deadline, id)) if *deadline <= now => (*deadline, *id),
                _ => break,
            };
            if let Some(value) = inner.entries.remove(&key) {
                inner.deadlines.remove(&key.1);
                fired.push(value);
            }
        }
        fired
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_fires_in_deadline_order() {
        let timer = Timer::new();
        timer.timeout(Duration::from_millis(20), "b");
        timer.timeout(Duration::from_millis(10), "a");
        timer.timeout(Duration::from_secs(60), "far");

        assert!(timer.poll(Instant::now()).is_empty());
        let fired = timer.poll(Instant::now() + Duration::from_millis(30));
        assert_eq!(fired, vec!["a", "b"]);
        assert_eq!(timer.len(), 1);
    }

    #[test]
    fn test_timer_cancel() {
        let timer = Timer::new();
        let id = timer.timeout(Duration::from_millis(1), "x");
        assert!(timer.cancel(id));
        assert!(!timer.cancel(id));
        assert!(timer.poll(Instant::now() + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_zero_duration_fires_on_next_poll() {
        let timer = Timer::new();
        timer.timeout(Duration::ZERO, "now");
        assert_eq!(timer.poll(Instant::now()), vec!["now"]);
    }
}
