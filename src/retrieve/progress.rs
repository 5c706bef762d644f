//! Progress accounting for retrieve
//!
//! Each retrieve phase owns a pre-computed share of the total progress
//! budget. However much data turns out to be recoverable, the callback
//! sequence satisfies: every increment is positive, the percentage is
//! non-decreasing, and the final percentage is exactly 1.0.

/// Callback receiving `(percentage, increment)` pairs
pub type ProgressSink<'a> = &'a mut dyn FnMut(f64, f64);

/// One phase's slice of the progress budget
pub struct Phase {
    share: f64,
    steps: usize,
    done: usize,
    spent: f64,
}

/// Monotonic progress accumulator over phased work
pub struct ProgressTracker<'a> {
    sink: ProgressSink<'a>,
    emitted: f64,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(sink: ProgressSink<'a>) -> ProgressTracker<'a> {
        ProgressTracker { sink, emitted: 0.0 }
    }

    fn emit(&mut self, increment: f64) {
        if increment <= 0.0 {
            return;
        }
        let increment = increment.min(1.0 - self.emitted);
        if increment <= 0.0 {
            return;
        }
        self.emitted += increment;
        (self.sink)(self.emitted, increment);
    }

    /// Start a phase worth `share` of the total, split over `steps` units
    pub fn begin(&mut self, share: f64, steps: usize) -> Phase {
        Phase {
            share,
            steps,
            done: 0,
            spent: 0.0,
        }
    }

    /// Report one unit of phase work complete
    pub fn step(&mut self, phase: &mut Phase) {
        if phase.steps == 0 {
            return;
        }
        phase.done = (phase.done + 1).min(phase.steps);
        let target = phase.share * phase.done as f64 / phase.steps as f64;
        let increment = target - phase.spent;
        phase.spent = target;
        self.emit(increment);
    }

    /// Close a phase, emitting whatever of its share remains (a phase with
    /// zero units still contributes its full share as one increment)
    pub fn end(&mut self, phase: Phase) {
        self.emit(phase.share - phase.spent);
    }

    /// Land exactly on 1.0 with one final positive increment
    pub fn finish(&mut self) {
        let increment = 1.0 - self.emitted;
        if increment > 0.0 {
            self.emitted = 1.0;
            (self.sink)(1.0, increment);
        }
    }

    pub fn emitted(&self) -> f64 {
        self.emitted
    }
}
