//! Inter-sweep timing.
//!
//! Two policies, matched to what callers of a sweeping ping tool actually
//! want: `strict` keeps sweeps on a fixed phase (sweep N starts at
//! `start + N * interval` regardless of how long sweep N-1's work took, so a
//! slow sweep eats into the next one's budget instead of drifting the whole
//! schedule), and relaxed just sleeps `interval` after each sweep finishes.

use std::time::{Duration, Instant};

/// Sleeps between successive sweeps of a ping run.
pub struct Pacer {
    interval: Duration,
    strict: bool,
    start: Option<Instant>,
    iteration: u64,
}

impl Pacer {
    pub fn new(interval: Duration, strict: bool) -> Self {
        Self {
            interval,
            strict,
            start: None,
            iteration: 0,
        }
    }

    /// Called once per sweep, after that sweep's work has completed and
    /// before the next one begins. Blocks for whatever time the policy
    /// says is left, or returns immediately if already behind schedule.
    pub fn wait(&mut self) {
        if self.strict {
            let start = *self.start.get_or_insert_with(Instant::now);
            let target = start + self.interval * self.iteration as u32;
            let now = Instant::now();
            if target > now {
                std::thread::sleep(target - now);
            }
            self.iteration += 1;
        } else {
            std::thread::sleep(self.interval);
        }
    }
}

/// Async equivalent of [`Pacer`], sleeping on the tokio timer instead of
/// blocking a thread.
pub struct AsyncPacer {
    interval: Duration,
    strict: bool,
    start: Option<tokio::time::Instant>,
    iteration: u64,
}

impl AsyncPacer {
    pub fn new(interval: Duration, strict: bool) -> Self {
        Self {
            interval,
            strict,
            start: None,
            iteration: 0,
        }
    }

    pub async fn wait(&mut self) {
        if self.strict {
            let start = *self.start.get_or_insert_with(tokio::time::Instant::now);
            let target = start + self.interval * self.iteration as u32;
            let now = tokio::time::Instant::now();
            if target > now {
                tokio::time::sleep(target - now).await;
            }
            self.iteration += 1;
        } else {
            tokio::time::sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relaxed_pacer_sleeps_full_interval_each_time() {
        let mut pacer = Pacer::new(Duration::from_millis(5), false);
        let start = Instant::now();
        pacer.wait();
        pacer.wait();
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn strict_pacer_does_not_stack_delays_when_caller_is_slow() {
        let mut pacer = Pacer::new(Duration::from_millis(20), true);
        pacer.wait(); // establishes the phase, sleeps ~0
        std::thread::sleep(Duration::from_millis(25)); // caller runs long
        let before = Instant::now();
        pacer.wait(); // already past target, should return immediately
        assert!(before.elapsed() < Duration::from_millis(10));
    }

    #[test]
    fn strict_pacer_tracks_fixed_phase() {
        let mut pacer = Pacer::new(Duration::from_millis(10), true);
        let start = Instant::now();
        pacer.wait();
        pacer.wait();
        pacer.wait();
        // Third wait targets start + 2*interval, not 2 full sleeps stacked
        // on top of whatever jitter the first two introduced.
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(start.elapsed() < Duration::from_millis(60));
    }
}
