//! Busy-wait strategies used by every spinning loop in the crate.

use serde::{Deserialize, Serialize};

use crate::sync;

const SPIN_LIMIT: u32 = 64;

/// How a worker waits between two polls of a contended location.
///
/// Every wait in this crate is active: a worker never parks in the kernel on
/// behalf of a lock. The strategy only decides what a single "snooze" costs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// One CPU relax hint per poll.
    Spin,
    /// A fixed busy-wait of `iterations` relax hints per poll.
    Delay {
        /// Relax hints issued per snooze.
        iterations: u32,
    },
    /// Yield the OS thread on every poll.
    Yield,
    /// Spin `spin_limit` times, then yield on every further poll.
    Adaptive {
        /// Number of relax hints before falling back to yielding.
        spin_limit: u32,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Adaptive {
            spin_limit: SPIN_LIMIT,
        }
    }
}

impl Backoff {
    /// Wait once. `step` counts consecutive snoozes of the current wait and
    /// the returned value must be fed back in on the next call.
    #[inline(always)]
    pub fn snooze(&self, step: u32) -> u32 {
        match *self {
            Backoff::Spin => sync::spin_loop(),
            Backoff::Delay { iterations } => {
                for _ in 0..iterations.max(1) {
                    sync::spin_loop();
                }
            }
            Backoff::Yield => sync::yield_now(),
            Backoff::Adaptive { spin_limit } => {
                if step < spin_limit {
                    sync::spin_loop();
                } else {
                    sync::yield_now();
                }
            }
        }
        step.saturating_add(1)
    }

    /// Spin until `done` returns true, snoozing between polls.
    /// Returns the number of snoozes taken.
    #[inline]
    pub fn wait_until(&self, mut done: impl FnMut() -> bool) -> u32 {
        let mut step = 0;
        while !done() {
            step = self.snooze(step);
        }
        step
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn snooze_counts_steps() {
        let b = Backoff::Adaptive { spin_limit: 2 };
        let mut step = 0;
        for _ in 0..5 {
            step = b.snooze(step);
        }
        assert_eq!(step, 5);
    }

    #[test]
    fn wait_until_returns_immediately_when_ready() {
        assert_eq!(Backoff::Spin.wait_until(|| true), 0);
    }

    #[test]
    fn wait_until_counts_polls() {
        let mut polls = 0;
        let snoozes = Backoff::Delay { iterations: 3 }.wait_until(|| {
            polls += 1;
            polls == 4
        });
        assert_eq!(snoozes, 3);
    }

    #[test]
    fn deserializes_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            backoff: Backoff,
        }
        let w: Wrapper = toml::from_str("backoff = { kind = \"delay\", iterations = 100 }").unwrap();
        assert_eq!(w.backoff, Backoff::Delay { iterations: 100 });
        let w: Wrapper = toml::from_str("backoff = { kind = \"yield\" }").unwrap();
        assert_eq!(w.backoff, Backoff::Yield);
    }
}
