//! Fixed-size float32 rasters. On disk a value of 0 means "no data"; in
//! memory no-data is NaN so it propagates through closure arithmetic.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ndarray::{Array2, ArrayView2};

use crate::error::{LoopClosureError, Result};
use crate::reference::RefArea;

/// No-data sentinel of the on-disk phase rasters.
pub const NO_DATA: f32 = 0.0;

pub type Raster = Array2<f32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterShape {
    /// azimuth lines (rows)
    pub length: usize,
    /// range samples (columns)
    pub width: usize,
}

impl RasterShape {
    pub fn new(length: usize, width: usize) -> Self {
        RasterShape { length, width }
    }

    pub fn n_pixels(&self) -> usize {
        self.length * self.width
    }

    pub fn dim(&self) -> (usize, usize) {
        (self.length, self.width)
    }
}

fn expect_size(path: &Path, shape: RasterShape, bytes_per_pixel: u64) -> Result<u64> {
    let actual = fs::metadata(path)
        .map_err(|e| LoopClosureError::io_at(path, e))?
        .len();
    let expected = shape.n_pixels() as u64 * bytes_per_pixel;
    if actual != expected {
        return Err(LoopClosureError::RasterSize {
            path: path.to_path_buf(),
            expected,
            actual,
            length: shape.length,
            width: shape.width,
        });
    }
    Ok(actual)
}

/// Checks that `path` exists with the byte size of a float32 raster.
pub fn probe_f32(path: &Path, shape: RasterShape) -> Result<()> {
    expect_size(path, shape, 4).map(|_| ())
}

/// Checks that a coherence raster holds either uint8 or float32 pixels.
pub fn probe_coherence(path: &Path, shape: RasterShape) -> Result<()> {
    let actual = fs::metadata(path)
        .map_err(|e| LoopClosureError::io_at(path, e))?
        .len();
    let n = shape.n_pixels() as u64;
    if actual == n || actual == 4 * n {
        return Ok(());
    }
    Err(LoopClosureError::RasterSize {
        path: path.to_path_buf(),
        expected: 4 * n,
        actual,
        length: shape.length,
        width: shape.width,
    })
}

/// Reads a float32 little-endian raster as stored.
pub fn read_f32(path: &Path, shape: RasterShape) -> Result<Raster> {
    expect_size(path, shape, 4)?;
    let file = File::open(path).map_err(|e| LoopClosureError::io_at(path, e))?;
    let mut reader = BufReader::new(file);
    let mut values = vec![0.0f32; shape.n_pixels()];
    reader
        .read_f32_into::<LittleEndian>(&mut values)
        .map_err(|e| LoopClosureError::io_at(path, e))?;
    Array2::from_shape_vec(shape.dim(), values)
        .map_err(|e| LoopClosureError::Config(format!("raster shape: {}", e)))
}

/// Reads an unwrapped phase raster, turning the no-data sentinel into NaN.
pub fn read_phase(path: &Path, shape: RasterShape) -> Result<Raster> {
    let mut raster = read_f32(path, shape)?;
    raster.mapv_inplace(|v| if v == NO_DATA { f32::NAN } else { v });
    Ok(raster)
}

/// Reads coherence stored either as uint8 (scaled by 255) or float32.
pub fn read_coherence(path: &Path, shape: RasterShape) -> Result<Raster> {
    let size = fs::metadata(path)
        .map_err(|e| LoopClosureError::io_at(path, e))?
        .len();
    let mut raster = if size == shape.n_pixels() as u64 {
        let mut bytes = Vec::with_capacity(shape.n_pixels());
        File::open(path)
            .and_then(|mut f| f.read_to_end(&mut bytes))
            .map_err(|e| LoopClosureError::io_at(path, e))?;
        Array2::from_shape_vec(shape.dim(), bytes)
            .map_err(|e| LoopClosureError::Config(format!("raster shape: {}", e)))?
            .mapv(|b| b as f32 / 255.0)
    } else {
        read_f32(path, shape)?
    };
    raster.mapv_inplace(|v| if v.is_nan() { 0.0 } else { v });
    Ok(raster)
}

/// Writes values as stored, NaN included.
pub fn write_f32(path: &Path, raster: ArrayView2<f32>) -> Result<()> {
    let file = File::create(path).map_err(|e| LoopClosureError::io_at(path, e))?;
    let mut writer = BufWriter::new(file);
    for &v in raster.iter() {
        writer
            .write_f32::<LittleEndian>(v)
            .map_err(|e| LoopClosureError::io_at(path, e))?;
    }
    writer.flush().map_err(|e| LoopClosureError::io_at(path, e))?;
    Ok(())
}

/// Writes a phase raster, storing NaN as the no-data sentinel.
pub fn write_phase(path: &Path, raster: ArrayView2<f32>) -> Result<()> {
    write_f32(path, raster.mapv(|v| if v.is_nan() { NO_DATA } else { v }).view())
}

/// Mean of the valid samples inside `area`.
pub fn area_mean(raster: ArrayView2<f32>, area: &RefArea) -> Option<f32> {
    crate::utils::nan_mean(area.window(raster).iter().copied())
}

pub fn has_data_in(raster: ArrayView2<f32>, area: &RefArea) -> bool {
    area.window(raster).iter().any(|v| !v.is_nan())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::tempdir;

    #[test]
    fn phase_round_trip_maps_sentinel_to_nan() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.unw");
        let shape = RasterShape::new(2, 2);
        write_f32(&path, array![[1.5, 0.0], [-2.0, 3.0]].view()).unwrap();

        let phase = read_phase(&path, shape).unwrap();
        assert_eq!(phase[[0, 0]], 1.5);
        assert!(phase[[0, 1]].is_nan());

        write_phase(&path, phase.view()).unwrap();
        let raw = read_f32(&path, shape).unwrap();
        assert_eq!(raw[[0, 1]], NO_DATA);
    }

    #[test]
    fn wrong_size_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.unw");
        write_f32(&path, array![[1.0, 2.0, 3.0]].view()).unwrap();
        let err = read_phase(&path, RasterShape::new(2, 2)).unwrap_err();
        assert!(matches!(err, LoopClosureError::RasterSize { actual: 12, expected: 16, .. }));
    }

    #[test]
    fn coherence_accepts_uint8_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.cc");
        fs::write(&path, [255u8, 0, 51, 102]).unwrap();
        let coh = read_coherence(&path, RasterShape::new(2, 2)).unwrap();
        assert_eq!(coh[[0, 0]], 1.0);
        assert!((coh[[1, 0]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn area_statistics_skip_nan() {
        let r = array![[f32::NAN, 2.0], [4.0, f32::NAN]];
        let area = RefArea::new(0, 2, 0, 2);
        assert_eq!(area_mean(r.view(), &area), Some(3.0));
        assert!(!has_data_in(r.view(), &RefArea::pixel(0, 0)));
    }
}
