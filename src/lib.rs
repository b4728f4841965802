//! Loop-closure consistency checking of unwrapped interferogram networks.
//!
//! Closed triangles of interferograms should sum to zero phase. The passes in
//! [`pipeline`] use that redundancy to flag bad interferograms, pick a stable
//! reference pixel and optionally nullify pixels no loop supports.

pub mod attribution;
pub mod classify;
pub mod closure;
pub mod config;
pub mod debias;
pub mod error;
pub mod network;
pub mod pipeline;
pub mod raster;
pub mod reference;
pub mod report;
pub mod store;
pub mod utils;

pub use config::LoopClosureConfig;
pub use error::{LoopClosureError, Result};
pub use pipeline::{run, RunInputs, RunOutcome};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
