//! Performance counters for the PME pipeline.

use std::fmt::{self, Display, Formatter};

use crate::PmeError;

/// The output of `PmeCounters::time_per_step`. In μs.
#[derive(Clone, Debug, PartialEq)]
pub struct PmeStageTimes {
    pub step_count: u64,
    pub redist: u64,
    pub spread: u64,
    pub halo: u64,
    pub fft: u64,
    pub solve: u64,
    pub gather: u64,
}

/// Accumulated operation counts and wall time, by pipeline stage. Times are in μs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PmeCounters {
    /// Calls that spread charges.
    pub steps: u64,
    /// Grid points written by the spreader, over all grids.
    pub spread_points: u64,
    /// Atoms gathered, times order³.
    pub gather_points: u64,
    pub solve_kpoints: u64,
    /// 1D transforms, forward and inverse.
    pub fft_lines: u64,
    pub redist_sum: u64,
    pub spread_sum: u64,
    /// Forward and backward halo reductions.
    pub halo_sum: u64,
    pub fft_sum: u64,
    pub solve_sum: u64,
    pub gather_sum: u64,
}

impl PmeCounters {
    /// Add another role's (or run's) counters to these.
    pub fn merge(&mut self, other: &Self) {
        self.steps += other.steps;
        self.spread_points += other.spread_points;
        self.gather_points += other.gather_points;
        self.solve_kpoints += other.solve_kpoints;
        self.fft_lines += other.fft_lines;
        self.redist_sum += other.redist_sum;
        self.spread_sum += other.spread_sum;
        self.halo_sum += other.halo_sum;
        self.fft_sum += other.fft_sum;
        self.solve_sum += other.solve_sum;
        self.gather_sum += other.gather_sum;
    }

    pub fn total_time(&self) -> u64 {
        self.redist_sum
            + self.spread_sum
            + self.halo_sum
            + self.fft_sum
            + self.solve_sum
            + self.gather_sum
    }

    pub fn time_per_step(&self) -> Result<PmeStageTimes, PmeError> {
        if self.steps == 0 {
            return Err(PmeError::protocol("No PME steps have been run"));
        }

        let apply = |v: u64| v / self.steps;

        Ok(PmeStageTimes {
            step_count: self.steps,
            redist: apply(self.redist_sum),
            spread: apply(self.spread_sum),
            halo: apply(self.halo_sum),
            fft: apply(self.fft_sum),
            solve: apply(self.solve_sum),
            gather: apply(self.gather_sum),
        })
    }
}

impl Display for PmeCounters {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        writeln!(
            f,
            "PME work over {} steps: {} spread points, {} gather points, {} k-points, {} FFT lines",
            self.steps, self.spread_points, self.gather_points, self.solve_kpoints, self.fft_lines
        )?;

        let Ok(t) = self.time_per_step() else {
            return Ok(());
        };

        writeln!(f, "Time per step:")?;
        writeln!(f, "--Redistribution: {} μs", t.redist)?;
        writeln!(f, "--Spread: {} μs", t.spread)?;
        writeln!(f, "--Halo sums: {} μs", t.halo)?;
        writeln!(f, "--FFT: {} μs", t.fft)?;
        writeln!(f, "--Solve: {} μs", t.solve)?;
        writeln!(f, "--Gather: {} μs", t.gather)?;
        writeln!(f, "--Total: {} μs", self.total_time() / self.steps)?;

        Ok(())
    }
}
