// Adaptive incremental GC step sizing
//
// One slice per frame. A slice that overruns the target halves the step, a
// slice that finishes within half the target doubles it, and the result is
// always clamped to [min, max]. The clamp keeps the step from stalling
// collection at zero or growing into a full collection.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GcPacer {
    step_size: u32,
    min_step: u32,
    max_step: u32,
    target_ms: f64,
}

impl GcPacer {
    pub fn new(initial: u32, min_step: u32, max_step: u32, target_ms: f64) -> Self {
        let min_step = min_step.max(1);
        let max_step = max_step.max(min_step);
        Self {
            step_size: initial.clamp(min_step, max_step),
            min_step,
            max_step,
            target_ms,
        }
    }

    pub fn step_size(&self) -> u32 {
        self.step_size
    }

    pub fn min_step(&self) -> u32 {
        self.min_step
    }

    pub fn max_step(&self) -> u32 {
        self.max_step
    }

    /// Feeds back the measured cost of the last slice and returns the next step size.
    pub fn record(&mut self, cost_ms: f64) -> u32 {
        if cost_ms > self.target_ms {
            self.step_size >>= 1;
        } else if cost_ms <= self.target_ms * 0.5 {
            self.step_size = self.step_size.saturating_mul(2);
        }
        self.step_size = self.step_size.clamp(self.min_step, self.max_step);
        self.step_size
    }

    /// Runs `step` with the current step size, times it, and adapts.
    pub fn run<E>(&mut self, step: impl FnOnce(u32) -> Result<(), E>) -> Result<Duration, E> {
        let start = Instant::now();
        step(self.step_size)?;
        let elapsed = start.elapsed();
        self.record(elapsed.as_secs_f64() * 1000.0);
        Ok(elapsed)
    }
}
