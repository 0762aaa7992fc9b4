//! A single scheduled callback, owned exclusively by a [`crate::timer_queue::TimerQueue`].

use std::time::Duration;

use crate::timestamp::Timestamp;

pub(crate) struct Timer {
    callback: Box<dyn FnMut() + Send>,
    expiration: Timestamp,
    interval: Option<Duration>,
    sequence: u64,
}

impl Timer {
    pub(crate) fn new(
        sequence: u64,
        expiration: Timestamp,
        interval: Option<Duration>,
        callback: impl FnMut() + Send + 'static,
    ) -> Timer {
        Timer {
            callback: Box::new(callback),
            expiration,
            interval,
            sequence,
        }
    }

    pub(crate) fn run(&mut self) {
        (self.callback)();
    }

    pub(crate) fn expiration(&self) -> Timestamp {
        self.expiration
    }

    pub(crate) fn sequence(&self) -> u64 {
        self.sequence
    }

    pub(crate) fn repeats(&self) -> bool {
        self.interval.is_some()
    }

    /// Advances `expiration` by one interval, for a repeating timer about
    /// to be reinserted after firing.
    pub(crate) fn restart(&mut self, now: Timestamp) {
        match self.interval {
            Some(interval) => self.expiration = now.add(interval),
            None => self.expiration = Timestamp::invalid(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot_does_not_repeat() {
        let timer = Timer::new(0, Timestamp::now(), None, || {});
        assert!(!timer.repeats());
    }

    #[test]
    fn repeating_restart_advances_by_one_interval() {
        let interval = Duration::from_millis(50);
        let now = Timestamp::now();
        let mut timer = Timer::new(0, now, Some(interval), || {});
        assert!(timer.repeats());
        timer.restart(now);
        assert_eq!(timer.expiration(), now.add(interval));
    }

    #[test]
    fn run_invokes_callback() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        let mut timer = Timer::new(0, Timestamp::now(), None, move || {
            fired2.store(true, Ordering::SeqCst)
        });
        timer.run();
        assert!(fired.load(Ordering::SeqCst));
    }
}
