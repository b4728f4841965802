//! Per-pixel attribution of loop closure errors to interferograms.
//!
//! Works in two stages. [`SupportTally::add_loop`] is fed every surviving loop
//! and only counts. [`support_masks`] runs once the counts are complete and
//! decides, per interferogram and pixel, whether the loop network supports
//! the value.

use ndarray::{Array2, Array3, ArrayView2, Axis, Zip};
use serde::Serialize;

use crate::network::Loop;
use crate::raster::{Raster, RasterShape};
use crate::utils::wrap_phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum NullifyPolicy {
    /// Keep a pixel if at least one loop through it closes.
    #[default]
    Gentle,
    /// Keep a pixel only if every loop through it closes.
    Aggressive,
}

/// A residual is acceptable below `threshold`; no data never counts against.
pub fn pixel_is_ok(residual: f32, threshold: f32) -> bool {
    residual.is_nan() || residual.abs() < threshold
}

/// Per-(edge, pixel) counts over the loops of the final pass, plus the
/// per-pixel loop statistics reported alongside.
#[derive(Debug, Clone)]
pub struct SupportTally {
    threshold: f32,
    /// loops with a valid residual, indexed `[edge, y, x]`
    pub valid: Array3<u16>,
    /// loops whose residual reaches the threshold, indexed `[edge, y, x]`
    pub bad: Array3<u16>,
    /// loops fed in that touch each edge
    pub loops_per_edge: Vec<u32>,
    /// loops with a suspected unwrapping error at each pixel
    pub n_loop_err: Array2<u32>,
    pub wrapped_sum: Array2<f64>,
    pub wrapped_abs_sum: Array2<f64>,
    pub n_valid_loops: Array2<u32>,
}

impl SupportTally {
    pub fn new(n_edges: usize, shape: RasterShape, threshold: f32) -> Self {
        let cube = (n_edges, shape.length, shape.width);
        SupportTally {
            threshold,
            valid: Array3::zeros(cube),
            bad: Array3::zeros(cube),
            loops_per_edge: vec![0; n_edges],
            n_loop_err: Array2::zeros(shape.dim()),
            wrapped_sum: Array2::zeros(shape.dim()),
            wrapped_abs_sum: Array2::zeros(shape.dim()),
            n_valid_loops: Array2::zeros(shape.dim()),
        }
    }

    /// Counts one loop from its cycle-corrected, reference-relative residual.
    pub fn add_loop(&mut self, lp: &Loop, residual: &Array2<f32>) {
        let threshold = self.threshold;
        let is_bad = residual.mapv(|r| !pixel_is_ok(r, threshold));

        Zip::from(&mut self.n_loop_err)
            .and(&mut self.wrapped_sum)
            .and(&mut self.wrapped_abs_sum)
            .and(&mut self.n_valid_loops)
            .and(residual)
            .and(&is_bad)
            .for_each(|err, sum, abs_sum, n, &r, &bad| {
                if bad {
                    *err += 1;
                }
                if !r.is_nan() {
                    let w = wrap_phase(r) as f64;
                    *sum += w;
                    *abs_sum += w.abs();
                    *n += 1;
                }
            });

        for &e in &lp.edges {
            self.loops_per_edge[e] += 1;
            Zip::from(self.valid.index_axis_mut(Axis(0), e))
                .and(self.bad.index_axis_mut(Axis(0), e))
                .and(residual)
                .and(&is_bad)
                .for_each(|valid, n_bad, &r, &bad| {
                    if !r.is_nan() {
                        *valid = valid.saturating_add(1);
                    }
                    if bad {
                        *n_bad = n_bad.saturating_add(1);
                    }
                });
        }
    }

    /// Mean wrapped loop phase and mean absolute wrapped loop phase, NaN
    /// where no loop had data.
    pub fn loop_phase_averages(&self) -> (Array2<f32>, Array2<f32>) {
        let avg = Zip::from(&self.wrapped_sum)
            .and(&self.n_valid_loops)
            .map_collect(|&s, &n| mean_or_nan(s, n));
        let avg_abs = Zip::from(&self.wrapped_abs_sum)
            .and(&self.n_valid_loops)
            .map_collect(|&s, &n| mean_or_nan(s, n).abs());
        (avg, avg_abs)
    }

    /// Share of the touching loops that flagged `edge` at each pixel, 0
    /// where no loop had data.
    pub fn bad_fraction(&self, edge: usize) -> Array2<f32> {
        Zip::from(self.bad.index_axis(Axis(0), edge))
            .and(self.valid.index_axis(Axis(0), edge))
            .map_collect(|&b, &v| if v == 0 { 0.0 } else { b as f32 / v as f32 })
    }
}

fn mean_or_nan(sum: f64, n: u32) -> f32 {
    if n == 0 {
        f32::NAN
    } else {
        (sum / n as f64) as f32
    }
}

/// Final support mask per `[edge, y, x]`.
///
/// The policy sets the starting mask from the counts: gentle keeps a pixel
/// unless every loop through it failed, aggressive drops it if any loop
/// failed. Then for each loop the edge with the strictly highest bad
/// fraction at a pixel takes the blame there; equal leaders leave all three
/// untouched, as does an all-zero fraction. Edges without loops stay fully
/// supported.
pub fn support_masks(tally: &SupportTally, loops: &[Loop], policy: NullifyPolicy) -> Array3<bool> {
    let mut masks = Array3::from_elem(tally.bad.raw_dim(), true);
    for (e, &n_loops) in tally.loops_per_edge.iter().enumerate() {
        if n_loops == 0 {
            continue;
        }
        // `bad` saturates at u16::MAX
        let n_loops = n_loops.min(u16::MAX as u32);
        Zip::from(masks.index_axis_mut(Axis(0), e))
            .and(tally.bad.index_axis(Axis(0), e))
            .for_each(|m, &bad| {
                *m = match policy {
                    NullifyPolicy::Gentle => (bad as u32) < n_loops,
                    NullifyPolicy::Aggressive => bad == 0,
                };
            });
    }

    for lp in loops {
        let [e1, e2, e3] = lp.edges;
        let (f1, f2, f3) = (
            tally.bad_fraction(e1),
            tally.bad_fraction(e2),
            tally.bad_fraction(e3),
        );
        let blamed = Zip::from(&f1)
            .and(&f2)
            .and(&f3)
            .map_collect(|&a, &b, &c| blame(a, b, c));
        for (slot, &e) in lp.edges.iter().enumerate() {
            Zip::from(masks.index_axis_mut(Axis(0), e))
                .and(&blamed)
                .for_each(|m, &b| {
                    if b == Some(slot) {
                        *m = false;
                    }
                });
        }
    }
    masks
}

/// Index of the unique largest positive fraction.
fn blame(a: f32, b: f32, c: f32) -> Option<usize> {
    let f = [a, b, c];
    let max = a.max(b).max(c);
    if max.is_nan() || max <= 0.0 {
        return None;
    }
    let mut leaders = f.iter().enumerate().filter(|(_, &v)| v == max);
    match (leaders.next(), leaders.next()) {
        (Some((ix, _)), None) => Some(ix),
        _ => None,
    }
}

/// `original` with every unsupported pixel set to no data, plus the number
/// of pixels that held data and were removed.
pub fn nullified(original: &Raster, mask: ArrayView2<bool>) -> (Raster, usize) {
    let mut removed = 0;
    let out = Zip::from(original).and(mask).map_collect(|&v, &keep| {
        if keep || v.is_nan() {
            v
        } else {
            removed += 1;
            f32::NAN
        }
    });
    (out, removed)
}
