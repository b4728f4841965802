//! Reference area: a small window whose mean phase is removed from every
//! interferogram before reference-relative closure is evaluated.

use std::fmt;
use std::str::FromStr;

use ndarray::{s, Array2, ArrayView2};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{LoopClosureError, ReferenceConstraint, Result};
use crate::raster::RasterShape;

/// Half-open pixel window `x1..x2` (range) by `y1..y2` (azimuth).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RefArea {
    pub x1: usize,
    pub x2: usize,
    pub y1: usize,
    pub y2: usize,
}

impl RefArea {
    pub fn new(x1: usize, x2: usize, y1: usize, y2: usize) -> Self {
        RefArea { x1, x2, y1, y2 }
    }

    pub fn pixel(x: usize, y: usize) -> Self {
        RefArea::new(x, x + 1, y, y + 1)
    }

    pub fn window<'a>(&self, raster: ArrayView2<'a, f32>) -> ArrayView2<'a, f32> {
        raster.slice_move(s![self.y1..self.y2, self.x1..self.x2])
    }

    pub fn fits(&self, shape: RasterShape) -> bool {
        self.x1 < self.x2 && self.y1 < self.y2 && self.x2 <= shape.width && self.y2 <= shape.length
    }
}

impl FromStr for RefArea {
    type Err = LoopClosureError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || LoopClosureError::InvalidReference(s.to_string());
        let parts: Vec<usize> = s
            .trim()
            .split(|c| c == ':' || c == '/')
            .map(|p| p.trim().parse::<usize>().map_err(|_| bad()))
            .collect::<Result<_>>()?;
        match parts.as_slice() {
            &[x1, x2, y1, y2] if x1 < x2 && y1 < y2 => Ok(RefArea::new(x1, x2, y1, y2)),
            _ => Err(bad()),
        }
    }
}

impl fmt::Display for RefArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}:{}", self.x1, self.x2, self.y1, self.y2)
    }
}

/// Per-pixel statistics the selector works from.
pub struct ReferenceInputs<'a> {
    /// number of retained interferograms with data at each pixel
    pub n_unw: ArrayView2<'a, u32>,
    /// number of loops with a suspected unwrapping error at each pixel
    pub n_bad_loop: ArrayView2<'a, u32>,
    /// RMS of the reference-free loop phase at each pixel (NaN without loops)
    pub loop_rms: ArrayView2<'a, f32>,
}

#[derive(Debug, Clone)]
pub struct ReferenceSelection {
    pub area: RefArea,
    pub max_coverage: u32,
    pub bad_loop_count: u32,
    /// loop RMS restricted to the final candidate pixels, NaN elsewhere
    pub rms_masked: Array2<f32>,
}

/// Picks the pixel with full coverage, the fewest bad loops and the lowest
/// loop RMS. Ties fall to the first pixel in raster scan order.
pub fn select_reference(inputs: &ReferenceInputs<'_>) -> Result<ReferenceSelection> {
    let max_coverage = inputs.n_unw.iter().copied().max().unwrap_or(0);
    if max_coverage == 0 {
        return Err(LoopClosureError::ReferenceExhausted(
            ReferenceConstraint::MaxCoverageEmpty,
        ));
    }
    let full_coverage = inputs.n_unw.mapv(|n| n == max_coverage);

    let min_bad = inputs.n_bad_loop.iter().copied().min().unwrap_or(0);
    let max_bad = inputs.n_bad_loop.iter().copied().max().unwrap_or(0);
    let mut threshold = min_bad;
    let candidates = loop {
        let mask = ndarray::Zip::from(&full_coverage)
            .and(&inputs.n_bad_loop)
            .map_collect(|&cov, &bad| cov && bad == threshold);
        if mask.iter().any(|&m| m) {
            break mask;
        }
        if threshold >= max_bad {
            return Err(LoopClosureError::ReferenceExhausted(
                ReferenceConstraint::BadLoopCountEmpty,
            ));
        }
        threshold += 1;
        debug!("[REF] raising bad-loop count threshold to {}", threshold);
    };

    let rms_masked = ndarray::Zip::from(&candidates)
        .and(&inputs.loop_rms)
        .map_collect(|&c, &rms| if c { rms } else { f32::NAN });

    let mut best: Option<((usize, usize), f32)> = None;
    let mut first_candidate = None;
    for ((y, x), &c) in candidates.indexed_iter() {
        if !c {
            continue;
        }
        first_candidate.get_or_insert((y, x));
        let rms = rms_masked[[y, x]];
        if rms.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if rms >= b => {}
            _ => best = Some(((y, x), rms)),
        }
    }
    let (y, x) = best
        .map(|(yx, _)| yx)
        .or(first_candidate)
        .ok_or(LoopClosureError::ReferenceExhausted(
            ReferenceConstraint::BadLoopCountEmpty,
        ))?;

    let area = RefArea::pixel(x, y);
    info!(
        "[REF] selected {} (coverage {}, bad loops {})",
        area, max_coverage, threshold
    );
    Ok(ReferenceSelection {
        area,
        max_coverage,
        bad_loop_count: threshold,
        rms_masked,
    })
}
