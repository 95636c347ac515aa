use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use crate::utils::get_monotonic_time;

/// Shareable lazy monotonic clock.
///
/// The clock will fetch the time once and then retain it until explicitly cleared with
/// [`Clock::clear`], so every measurement taken while handling one batch of events agrees on
/// "now". A manual clock never reads the system time; tests move it with [`Clock::set`] and
/// [`Clock::advance`].
#[derive(Debug, Default, Clone)]
pub struct Clock {
    inner: Rc<RefCell<LazyClock>>,
}

#[derive(Debug, Default)]
struct LazyClock {
    time: Option<Duration>,
    manual: bool,
}

impl Clock {
    /// Creates a manual clock frozen at `time`.
    pub fn with_time(time: Duration) -> Self {
        Self {
            inner: Rc::new(RefCell::new(LazyClock {
                time: Some(time),
                manual: true,
            })),
        }
    }

    pub fn now(&self) -> Duration {
        self.inner.borrow_mut().now()
    }

    pub fn is_manual(&self) -> bool {
        self.inner.borrow().manual
    }

    /// Sets the time; turns the clock manual.
    pub fn set(&self, time: Duration) {
        let mut inner = self.inner.borrow_mut();
        inner.time = Some(time);
        inner.manual = true;
    }

    pub fn advance(&self, by: Duration) {
        let now = self.now();
        self.set(now + by);
    }

    /// Clears the stored time so it's re-fetched again next. No-op for a manual clock.
    pub fn clear(&self) {
        let mut inner = self.inner.borrow_mut();
        if !inner.manual {
            inner.time = None;
        }
    }
}

impl PartialEq for Clock {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Clock {}

impl LazyClock {
    fn now(&mut self) -> Duration {
        *self.time.get_or_insert_with(get_monotonic_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frozen_clock() {
        let clock = Clock::with_time(Duration::ZERO);
        assert_eq!(clock.now(), Duration::ZERO);

        clock.clear();
        assert_eq!(clock.now(), Duration::ZERO);

        clock.set(Duration::from_millis(100));
        assert_eq!(clock.now(), Duration::from_millis(100));

        clock.advance(Duration::from_millis(16));
        assert_eq!(clock.now(), Duration::from_millis(116));
    }

    #[test]
    fn lazy_clock_caches_until_cleared() {
        let clock = Clock::default();
        assert!(!clock.is_manual());

        let first = clock.now();
        assert_eq!(clock.now(), first);

        clock.clear();
        assert!(clock.now() >= first);
    }

    #[test]
    fn clones_share_time() {
        let clock = Clock::with_time(Duration::from_secs(1));
        let other = clock.clone();
        other.advance(Duration::from_secs(1));
        assert_eq!(clock.now(), Duration::from_secs(2));
        assert_eq!(clock, other);
    }
}
