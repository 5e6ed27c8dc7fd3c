//! Learning-rate schedule: cosine annealing with warm restarts.

use std::f64::consts::PI;

/// Cosine decay from `lr_max` to `lr_min` over a cycle, restarting at
/// `lr_max` when the cycle ends. Each restart multiplies the cycle length
/// by `t_mult`. Advanced once per epoch.
#[derive(Debug, Clone)]
pub struct CosineWarmRestarts {
    lr_max: f64,
    lr_min: f64,
    t_mult: usize,
    cycle_len: usize,
    step_in_cycle: usize,
}

impl CosineWarmRestarts {
    /// * `t0` — length of the first cycle, in steps.
    /// * `t_mult` — cycle-length multiplier applied at each restart.
    pub fn new(lr_max: f64, lr_min: f64, t0: usize, t_mult: usize) -> Self {
        Self {
            lr_max,
            lr_min,
            t_mult: t_mult.max(1),
            cycle_len: t0.max(1),
            step_in_cycle: 0,
        }
    }

    /// Learning rate at the current step.
    pub fn current_lr(&self) -> f64 {
        let progress = self.step_in_cycle as f64 / self.cycle_len as f64;
        self.lr_min + 0.5 * (self.lr_max - self.lr_min) * (1.0 + (PI * progress).cos())
    }

    /// Move one step forward, restarting when the cycle is exhausted.
    pub fn advance(&mut self) {
        self.step_in_cycle += 1;
        if self.step_in_cycle >= self.cycle_len {
            self.step_in_cycle = 0;
            self.cycle_len *= self.t_mult;
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_lr_max() {
        let sched = CosineWarmRestarts::new(0.1, 1e-4, 11, 2);
        assert!((sched.current_lr() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn cosine_midpoint() {
        let mut sched = CosineWarmRestarts::new(0.1, 0.0, 10, 2);
        for _ in 0..5 {
            sched.advance();
        }
        // Midpoint of the cosine: lr = 0.5 · lr_max.
        assert!((sched.current_lr() - 0.05).abs() < 1e-9);
    }

    #[test]
    fn never_drops_below_lr_min() {
        let mut sched = CosineWarmRestarts::new(0.1, 1e-4, 4, 2);
        for _ in 0..50 {
            assert!(sched.current_lr() >= 1e-4 - 1e-12);
            sched.advance();
        }
    }

    #[test]
    fn restart_resets_rate_and_doubles_cycle() {
        let mut sched = CosineWarmRestarts::new(0.1, 1e-4, 3, 2);
        for _ in 0..3 {
            sched.advance();
        }
        // Fresh cycle: back to lr_max, cycle now 6 steps long.
        assert!((sched.current_lr() - 0.1).abs() < 1e-12);
        assert_eq!(sched.cycle_len, 6);
        for _ in 0..6 {
            sched.advance();
        }
        assert!((sched.current_lr() - 0.1).abs() < 1e-12);
        assert_eq!(sched.cycle_len, 12);
    }
}
