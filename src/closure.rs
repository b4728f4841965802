//! Loop closure phase: `phase(e1,e2) + phase(e2,e3) - phase(e1,e3)`.
//!
//! Everything here is a pure function of the three rasters it is given, so
//! loops can be evaluated on any worker in any order.

use std::f32::consts::PI;

use ndarray::{Array2, Zip};

use crate::debias::{debias, CycleCorrection};
use crate::error::Result;
use crate::network::{Loop, Network};
use crate::raster::{area_mean, Raster, RasterShape};
use crate::reference::RefArea;
use crate::store::EdgeStore;
use crate::utils::nan_rms;

/// The three rasters of one loop.
pub struct LoopPhases {
    pub p12: Raster,
    pub p23: Raster,
    pub p13: Raster,
}

impl LoopPhases {
    pub fn load<S: EdgeStore + ?Sized>(store: &S, network: &Network, lp: &Loop) -> Result<Self> {
        let [e12, e23, e13] = lp.edges;
        Ok(LoopPhases {
            p12: store.original(&network.edge(e12))?,
            p23: store.original(&network.edge(e23))?,
            p13: store.original(&network.edge(e13))?,
        })
    }

    pub fn load_current<S: EdgeStore + ?Sized>(
        store: &S,
        network: &Network,
        lp: &Loop,
    ) -> Result<Self> {
        let [e12, e23, e13] = lp.edges;
        Ok(LoopPhases {
            p12: store.current(&network.edge(e12))?,
            p23: store.current(&network.edge(e23))?,
            p13: store.current(&network.edge(e13))?,
        })
    }

    /// Uncorrected closure residual; NaN wherever any of the three lacks data.
    pub fn residual(&self) -> Array2<f32> {
        Zip::from(&self.p12)
            .and(&self.p23)
            .and(&self.p13)
            .map_collect(|&a, &b, &c| a + b - c)
    }

    /// Closure residual of the reference-relative phases. All-NaN when any
    /// of the three has no data in the reference area.
    pub fn residual_wrt(&self, area: &RefArea) -> Array2<f32> {
        let refs = (
            area_mean(self.p12.view(), area),
            area_mean(self.p23.view(), area),
            area_mean(self.p13.view(), area),
        );
        let mut residual = self.residual();
        match refs {
            (Some(r12), Some(r23), Some(r13)) => {
                let offset = r12 + r23 - r13;
                residual.mapv_inplace(|v| v - offset);
            }
            _ => residual.fill(f32::NAN),
        }
        residual
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClosureOptions {
    pub reference: Option<RefArea>,
    pub correction: CycleCorrection,
}

/// Debiased per-pixel closure residual.
pub fn raster_closure(phases: &LoopPhases, opts: &ClosureOptions) -> Array2<f32> {
    let mut residual = match &opts.reference {
        Some(area) => phases.residual_wrt(area),
        None => phases.residual(),
    };
    debias(&mut residual, opts.correction);
    residual
}

/// RMS of the debiased residual over all valid pixels; `None` when no pixel
/// of the loop holds data, which makes the loop inapplicable.
pub fn scalar_closure(phases: &LoopPhases, opts: &ClosureOptions) -> Option<f32> {
    nan_rms(raster_closure(phases, opts).iter().copied())
}

/// Per-pixel vote partials of the reference-free raster pass. Merging is an
/// elementwise sum, so any split of loops across workers gives the same total.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosureVotes {
    /// loops with a valid residual
    pub n_loop: Array2<u32>,
    /// loops whose residual exceeds pi
    pub n_bad: Array2<u32>,
    pub sum_sq: Array2<f64>,
}

impl ClosureVotes {
    pub fn zeros(shape: RasterShape) -> Self {
        ClosureVotes {
            n_loop: Array2::zeros(shape.dim()),
            n_bad: Array2::zeros(shape.dim()),
            sum_sq: Array2::zeros(shape.dim()),
        }
    }

    pub fn add(&mut self, residual: &Array2<f32>) {
        Zip::from(&mut self.n_loop)
            .and(&mut self.n_bad)
            .and(&mut self.sum_sq)
            .and(residual)
            .for_each(|n, bad, sq, &r| {
                if r.is_nan() {
                    return;
                }
                let r2 = (r as f64).powi(2);
                *n += 1;
                *sq += r2;
                if r2 > (PI as f64).powi(2) {
                    *bad += 1;
                }
            });
    }

    pub fn merge(mut self, other: ClosureVotes) -> ClosureVotes {
        self.n_loop += &other.n_loop;
        self.n_bad += &other.n_bad;
        self.sum_sq += &other.sum_sq;
        self
    }

    /// Per-pixel loop RMS, NaN where no loop had data.
    pub fn rms(&self) -> Array2<f32> {
        Zip::from(&self.n_loop)
            .and(&self.sum_sq)
            .map_collect(|&n, &sq| {
                if n == 0 {
                    f32::NAN
                } else {
                    (sq / n as f64).sqrt() as f32
                }
            })
    }
}
