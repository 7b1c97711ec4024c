use parking_lot::{Condvar, Mutex};

/// A counting permit pool in the style of a semaphore. The reactor initializes it with one
///  permit fewer than its worker count, which is what guarantees that one thread always
///  remains for the readiness poll while the others may run scheduled actions.
///
/// May be initialized with a negative count; permits become available once enough
///  `release` calls have happened.
pub struct Permits {
    available: Mutex<isize>,
    released: Condvar,
}

impl Permits {
    pub fn new(initial: isize) -> Permits {
        Permits {
            available: Mutex::new(initial),
            released: Condvar::new(),
        }
    }

    /// Claims one permit without blocking, returning whether one was available.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        let mut available = self.available.lock();
        if *available > 0 {
            *available -= 1;
            true
        } else {
            false
        }
    }

    /// Claims one permit, blocking until one becomes available.
    pub fn acquire(&self) {
        let mut available = self.available.lock();
        while *available <= 0 {
            self.released.wait(&mut available);
        }
        *available -= 1;
    }

    pub fn release(&self, count: isize) {
        let mut available = self.available.lock();
        *available += count;
        self.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::one_available(1, true, 0)]
    #[case::several_available(3, true, 2)]
    #[case::none_available(0, false, 0)]
    #[case::negative(-1, false, -1)]
    fn test_try_acquire(
        #[case] initial: isize,
        #[case] expected_acquired: bool,
        #[case] expected_remaining: isize,
    ) {
        let permits = Permits::new(initial);
        assert_eq!(permits.try_acquire(), expected_acquired);
        assert_eq!(*permits.available.lock(), expected_remaining);
    }

    #[test]
    fn test_release_unblocks_negative_pool() {
        let permits = Permits::new(-1);
        assert!(!permits.try_acquire());
        permits.release(2);
        assert!(permits.try_acquire());
        assert!(!permits.try_acquire());
    }

    #[test]
    fn test_blocking_acquire_woken_by_release() {
        let permits = Arc::new(Permits::new(0));

        let waiter = {
            let permits = permits.clone();
            std::thread::spawn(move || permits.acquire())
        };

        std::thread::sleep(Duration::from_millis(50));
        permits.release(1);

        waiter.join().unwrap();
        assert_eq!(*permits.available.lock(), 0);
    }
}
