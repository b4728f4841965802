//! Removal of the integer-cycle (and optional fractional) bias of a loop
//! closure residual.

use std::f32::consts::PI;

use ndarray::{Array2, ArrayView2};

use crate::utils::nan_median;

pub const TWO_PI: f32 = 2.0 * PI;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CycleCorrection {
    /// Residual used as computed.
    None,
    /// Subtract the multiple of 2pi nearest the median residual, then with
    /// `multi_prime` also the remaining median (fractional) bias.
    Median { multi_prime: bool },
    /// Subtract the most populated cycle bin within `-max_cycles..=max_cycles`.
    Histogram { max_cycles: i32 },
}

/// Multiple of 2pi closest to the median residual.
pub fn median_cycle_offset(residual: ArrayView2<f32>) -> Option<f32> {
    nan_median(residual.iter().copied()).map(|m| (m / TWO_PI).round() * TWO_PI)
}

/// Most frequent integer cycle of the residual, as a phase offset.
///
/// Bins are one cycle wide and centred on the integers; samples outside
/// `[-max_cycles - 0.5, max_cycles + 0.5]` are ignored and the first of equally
/// populated bins wins. Returns 0 when no sample falls into any bin.
pub fn histogram_cycle_offset(residual: ArrayView2<f32>, max_cycles: i32) -> f32 {
    let n_bins = (2 * max_cycles + 1) as usize;
    let lower = -(max_cycles as f32) - 0.5;
    let upper = max_cycles as f32 + 0.5;
    let mut counts = vec![0usize; n_bins];
    for &v in residual.iter() {
        let cycles = v / TWO_PI;
        if !cycles.is_finite() || cycles < lower || cycles > upper {
            continue;
        }
        let bin = ((cycles - lower).floor() as usize).min(n_bins - 1);
        counts[bin] += 1;
    }
    let mut best = None;
    for (bin, &count) in counts.iter().enumerate() {
        if count == 0 {
            continue;
        }
        match best {
            Some((_, c)) if count <= c => {}
            _ => best = Some((bin, count)),
        }
    }
    match best {
        Some((bin, _)) => (bin as i32 - max_cycles) as f32 * TWO_PI,
        None => 0.0,
    }
}

/// Applies `correction` in place and returns the total offset removed.
pub fn debias(residual: &mut Array2<f32>, correction: CycleCorrection) -> f32 {
    match correction {
        CycleCorrection::None => 0.0,
        CycleCorrection::Median { multi_prime } => {
            let Some(cycle) = median_cycle_offset(residual.view()) else {
                return 0.0;
            };
            residual.mapv_inplace(|v| v - cycle);
            let fraction = if multi_prime {
                nan_median(residual.iter().copied()).unwrap_or(0.0)
            } else {
                0.0
            };
            if fraction != 0.0 {
                residual.mapv_inplace(|v| v - fraction);
            }
            cycle + fraction
        }
        CycleCorrection::Histogram { max_cycles } => {
            let offset = histogram_cycle_offset(residual.view(), max_cycles);
            if offset != 0.0 {
                residual.mapv_inplace(|v| v - offset);
            }
            offset
        }
    }
}
