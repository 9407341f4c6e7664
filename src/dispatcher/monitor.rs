//! Selector spin detection.
//!
//! Some kernels occasionally report a selector as ready while no channel is,
//! so `select` returns immediately over and over and the dispatcher burns a
//! core. The monitor counts consecutive iterations that returned nothing well
//! before their timeout and reports when the count crosses the threshold.

use std::time::Duration;

use crate::config::SpinDetection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Healthy,
    /// The threshold was crossed; `reinit` says whether to rebuild the
    /// selector before backing off.
    Spinning { reinit: bool },
}

pub(crate) struct SpinMonitor {
    config: SpinDetection,
    consecutive: u32,
}

impl SpinMonitor {
    pub(crate) fn new(config: SpinDetection) -> Self {
        Self {
            config,
            consecutive: 0,
        }
    }

    pub(crate) fn backoff(&self) -> Duration {
        self.config.backoff
    }

    /// Records one loop iteration. `handled` counts ready events plus
    /// processed commands; `timeout` is what the select call was given.
    pub(crate) fn record(&mut self, handled: usize, elapsed: Duration, timeout: Duration) -> Verdict {
        if !self.config.enabled {
            return Verdict::Healthy;
        }
        // a select that was allowed to return early is not suspicious
        let spurious = handled == 0 && elapsed < self.config.window && timeout > self.config.window;
        if !spurious {
            self.consecutive = 0;
            return Verdict::Healthy;
        }

        self.consecutive += 1;
        if self.consecutive < self.config.threshold {
            return Verdict::Healthy;
        }
        self.consecutive = 0;
        Verdict::Spinning {
            reinit: self.config.reinit,
        }
    }
}
