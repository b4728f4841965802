use std::f32::consts::PI;

use serde::Serialize;

use crate::attribution::NullifyPolicy;
use crate::error::{LoopClosureError, Result};
use crate::reference::RefArea;

/// Run parameters of one loop-closure run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopClosureConfig {
    /// Loop RMS (rad) at or above which a loop is bad.
    pub loop_threshold: f32,
    /// Also remove the median fractional bias of each loop.
    pub multi_prime: bool,
    /// Overwrite unsupported pixels with no data.
    pub nullify: bool,
    /// Residual (rad) from which a pixel counts as a loop error.
    pub nullify_threshold: f32,
    pub policy: NullifyPolicy,
    /// Keep the un-nullified original next to the rewritten raster.
    pub save_original: bool,
    /// Skips the reference search when given.
    pub reference: Option<RefArea>,
    /// Worker threads, 0 for all CPUs.
    pub n_para: usize,
    /// Half-width (in cycles) of the cycle histogram of the last pass.
    pub cycle_search: i32,
}

impl Default for LoopClosureConfig {
    fn default() -> Self {
        LoopClosureConfig {
            loop_threshold: 1.5,
            multi_prime: false,
            nullify: false,
            nullify_threshold: PI,
            policy: NullifyPolicy::Gentle,
            save_original: true,
            reference: None,
            n_para: 0,
            cycle_search: 3,
        }
    }
}

impl LoopClosureConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.loop_threshold.is_finite() && self.loop_threshold > 0.0) {
            return Err(LoopClosureError::Config(format!(
                "loop threshold must be a positive number of radians, got {}",
                self.loop_threshold
            )));
        }
        if !(self.nullify_threshold.is_finite() && self.nullify_threshold > 0.0) {
            return Err(LoopClosureError::Config(format!(
                "nullification threshold must be a positive number of radians, got {}",
                self.nullify_threshold
            )));
        }
        if self.cycle_search < 0 {
            return Err(LoopClosureError::Config(format!(
                "cycle search range must not be negative, got {}",
                self.cycle_search
            )));
        }
        if let Some(area) = &self.reference {
            if area.x1 >= area.x2 || area.y1 >= area.y2 {
                return Err(LoopClosureError::InvalidReference(area.to_string()));
            }
        }
        Ok(())
    }
}
