//! Admission control shared between live queries and the anti-entropy walker.
//!
//! The read path reports every key it serves; the walker asks for permission
//! before pulling its next batch. Both draw on one budget, so background
//! sweeping yields to query traffic instead of stacking on top of it.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Shared admission authority.
///
/// Over any window of `window` seconds the sum of reported keys and granted
/// keys stays at or below `rate * window` in the long-run average. Transient
/// overshoot within a single window is tolerated.
pub trait RatePolice: Send + Sync + 'static {
    /// Debit `n` keys just served to a query.
    fn report(&self, n: usize);

    /// Ask how many keys the walker may read next under a budget of `rate`
    /// keys per second. Zero means the budget is spent for the current
    /// window.
    fn request(&self, rate: usize) -> usize;
}

/// Admission authority that never limits anything.
///
/// `report` is a sink and `request` echoes its argument. Only sensible when
/// the walker is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopPolice;

impl RatePolice for NopPolice {
    fn report(&self, _n: usize) {}

    fn request(&self, rate: usize) -> usize {
        rate
    }
}

#[derive(Debug)]
struct Window {
    opened: Instant,
    spent: usize,
}

/// Token budget over a rolling window, one second by default.
///
/// `request` hands out the entire unspent budget of the current window in one
/// grant; queries reported later in the same window may push the total past
/// the budget once, which the contract allows.
#[derive(Debug)]
pub struct WindowPolice {
    length: Duration,
    window: Mutex<Window>,
}

impl WindowPolice {
    /// Police with the standard one-second window.
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(1))
    }

    /// Police with a custom window length.
    pub fn with_window(length: Duration) -> Self {
        Self {
            length,
            window: Mutex::new(Window {
                opened: Instant::now(),
                spent: 0,
            }),
        }
    }

    fn roll(&self, window: &mut Window) {
        if window.opened.elapsed() >= self.length {
            window.opened = Instant::now();
            window.spent = 0;
        }
    }
}

impl Default for WindowPolice {
    fn default() -> Self {
        Self::new()
    }
}

impl RatePolice for WindowPolice {
    fn report(&self, n: usize) {
        let mut window = self.window.lock();
        self.roll(&mut window);
        window.spent = window.spent.saturating_add(n);
    }

    fn request(&self, rate: usize) -> usize {
        let mut window = self.window.lock();
        self.roll(&mut window);
        let granted = rate.saturating_sub(window.spent);
        window.spent = window.spent.saturating_add(granted);
        granted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_window_grants_full_budget() {
        let police = WindowPolice::new();
        assert_eq!(police.request(100), 100);
    }

    #[test]
    fn queries_starve_the_walker() {
        let police = WindowPolice::new();
        police.report(40);
        assert_eq!(police.request(100), 60);
        assert_eq!(police.request(100), 0);
        police.report(10);
        assert_eq!(police.request(100), 0);
    }

    #[test]
    fn rollover_restores_the_budget() {
        let police = WindowPolice::with_window(Duration::from_millis(20));
        assert_eq!(police.request(100), 100);
        assert_eq!(police.request(100), 0);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(police.request(100), 100);
    }

    #[test]
    fn nop_echoes() {
        let police = NopPolice;
        police.report(1_000_000);
        assert_eq!(police.request(42), 42);
    }
}
