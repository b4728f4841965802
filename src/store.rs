//! Where interferogram rasters live. Each edge has two slots: the original
//! (un-nullified) phase and the current one. Once a preserved original
//! exists it is the authoritative input of every pass.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{LoopClosureError, Result};
use crate::network::Edge;
use crate::raster::{self, Raster, RasterShape};

pub trait EdgeStore: Sync {
    fn shape(&self) -> RasterShape;

    /// Authoritative un-nullified phase (NaN = no data).
    fn original(&self, edge: &Edge) -> Result<Raster>;

    /// Phase as currently stored, possibly nullified by an earlier run.
    fn current(&self, edge: &Edge) -> Result<Raster>;

    /// Coherence in [0, 1] if the store has any for this edge.
    fn coherence(&self, edge: &Edge) -> Result<Option<Raster>>;

    /// Overwrites the current slot. With `keep_original` the original is
    /// preserved first unless a preserved copy already exists.
    fn replace_current(&mut self, edge: &Edge, phase: &Raster, keep_original: bool) -> Result<()>;

    /// Cheap readiness check used to drop unreadable edges up front. Every
    /// artifact a run may touch later has to pass it.
    fn probe(&self, edge: &Edge) -> Result<()> {
        self.original(edge).map(|_| ())
    }
}

/// Reads `range_samples` and `azimuth_lines` from a GAMMA-style parameter file.
pub fn read_mli_par(path: &Path) -> Result<RasterShape> {
    let text = fs::read_to_string(path).map_err(|e| LoopClosureError::io_at(path, e))?;
    let mut width = None;
    let mut length = None;
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.split_whitespace().next().and_then(|v| v.parse::<usize>().ok());
        match key.trim() {
            "range_samples" => width = value,
            "azimuth_lines" => length = value,
            _ => {}
        }
    }
    match (length, width) {
        (Some(length), Some(width)) if length > 0 && width > 0 => {
            Ok(RasterShape::new(length, width))
        }
        _ => Err(LoopClosureError::Config(format!(
            "{} lacks range_samples/azimuth_lines",
            path.display()
        ))),
    }
}

/// `<ifgdir>/<pair>/<pair>.unw` tree with `.unw.ori` backups and `.cc` coherence.
#[derive(Debug, Clone)]
pub struct DirStore {
    ifgdir: PathBuf,
    shape: RasterShape,
}

impl DirStore {
    pub fn new(ifgdir: impl Into<PathBuf>, shape: RasterShape) -> Self {
        DirStore {
            ifgdir: ifgdir.into(),
            shape,
        }
    }

    /// Opens `ifgdir`, taking the raster size from its `slc.mli.par`.
    pub fn open(ifgdir: impl Into<PathBuf>) -> Result<Self> {
        let ifgdir = ifgdir.into();
        if !ifgdir.is_dir() {
            return Err(LoopClosureError::Config(format!(
                "no {} directory exists",
                ifgdir.display()
            )));
        }
        let par = ifgdir.join("slc.mli.par");
        if !par.exists() {
            return Err(LoopClosureError::Config(format!(
                "no slc.mli.par file exists in {}",
                ifgdir.display()
            )));
        }
        let shape = read_mli_par(&par)?;
        Ok(DirStore::new(ifgdir, shape))
    }

    pub fn unw_path(&self, edge: &Edge) -> PathBuf {
        let name = edge.to_string();
        self.ifgdir.join(&name).join(format!("{}.unw", name))
    }

    pub fn original_path(&self, edge: &Edge) -> PathBuf {
        let name = edge.to_string();
        self.ifgdir.join(&name).join(format!("{}.unw.ori", name))
    }

    fn cc_path(&self, edge: &Edge) -> PathBuf {
        let name = edge.to_string();
        self.ifgdir.join(&name).join(format!("{}.cc", name))
    }

    /// Interferogram directories holding a `.unw` file, sorted.
    pub fn list_edges(&self) -> Result<Vec<Edge>> {
        let entries =
            fs::read_dir(&self.ifgdir).map_err(|e| LoopClosureError::io_at(&self.ifgdir, e))?;
        let mut edges = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(edge) = name.parse::<Edge>() else {
                continue;
            };
            if self.unw_path(&edge).exists() {
                edges.push(edge);
            }
        }
        edges.sort();
        Ok(edges)
    }

    fn authoritative_path(&self, edge: &Edge) -> PathBuf {
        let ori = self.original_path(edge);
        if ori.exists() {
            ori
        } else {
            self.unw_path(edge)
        }
    }
}

impl EdgeStore for DirStore {
    fn shape(&self) -> RasterShape {
        self.shape
    }

    fn original(&self, edge: &Edge) -> Result<Raster> {
        raster::read_phase(&self.authoritative_path(edge), self.shape)
    }

    fn current(&self, edge: &Edge) -> Result<Raster> {
        raster::read_phase(&self.unw_path(edge), self.shape)
    }

    fn coherence(&self, edge: &Edge) -> Result<Option<Raster>> {
        let path = self.cc_path(edge);
        if !path.exists() {
            return Ok(None);
        }
        raster::read_coherence(&path, self.shape).map(Some)
    }

    fn replace_current(&mut self, edge: &Edge, phase: &Raster, keep_original: bool) -> Result<()> {
        let unw = self.unw_path(edge);
        let ori = self.original_path(edge);
        if keep_original && !ori.exists() {
            fs::copy(&unw, &ori).map_err(|e| LoopClosureError::io_at(&ori, e))?;
            for suffix in ["png", "ras"] {
                let preview = unw.with_extension(format!("unw.{}", suffix));
                if preview.exists() {
                    let moved = ori.with_extension(format!("ori.{}", suffix));
                    if let Err(e) = fs::rename(&preview, &moved) {
                        warn!("could not move preview {}: {}", preview.display(), e);
                    }
                }
            }
            debug!("preserved original of {} at {}", edge, ori.display());
        }
        raster::write_phase(&unw, phase.view())
    }

    fn probe(&self, edge: &Edge) -> Result<()> {
        raster::probe_f32(&self.unw_path(edge), self.shape)?;
        let ori = self.original_path(edge);
        if ori.exists() {
            raster::probe_f32(&ori, self.shape)?;
        }
        let cc = self.cc_path(edge);
        if cc.exists() {
            raster::probe_coherence(&cc, self.shape)?;
        }
        Ok(())
    }
}

/// In-memory store with the same two-slot semantics as [`DirStore`].
#[derive(Debug, Clone)]
pub struct MemoryStore {
    shape: RasterShape,
    current: HashMap<Edge, Raster>,
    preserved: HashMap<Edge, Raster>,
    coherence: HashMap<Edge, Raster>,
}

impl MemoryStore {
    pub fn new(shape: RasterShape) -> Self {
        MemoryStore {
            shape,
            current: HashMap::new(),
            preserved: HashMap::new(),
            coherence: HashMap::new(),
        }
    }

    pub fn insert(&mut self, edge: Edge, phase: Raster) {
        self.current.insert(edge, phase);
    }

    pub fn insert_coherence(&mut self, edge: Edge, coh: Raster) {
        self.coherence.insert(edge, coh);
    }

    pub fn edges(&self) -> Vec<Edge> {
        let mut edges: Vec<Edge> = self.current.keys().copied().collect();
        edges.sort();
        edges
    }

    pub fn has_preserved(&self, edge: &Edge) -> bool {
        self.preserved.contains_key(edge)
    }
}

impl EdgeStore for MemoryStore {
    fn shape(&self) -> RasterShape {
        self.shape
    }

    fn original(&self, edge: &Edge) -> Result<Raster> {
        self.preserved
            .get(edge)
            .or_else(|| self.current.get(edge))
            .cloned()
            .ok_or_else(|| LoopClosureError::MissingEdge(edge.to_string()))
    }

    fn current(&self, edge: &Edge) -> Result<Raster> {
        self.current
            .get(edge)
            .cloned()
            .ok_or_else(|| LoopClosureError::MissingEdge(edge.to_string()))
    }

    fn coherence(&self, edge: &Edge) -> Result<Option<Raster>> {
        Ok(self.coherence.get(edge).cloned())
    }

    fn replace_current(&mut self, edge: &Edge, phase: &Raster, keep_original: bool) -> Result<()> {
        let previous = self
            .current
            .insert(*edge, phase.clone())
            .ok_or_else(|| LoopClosureError::MissingEdge(edge.to_string()))?;
        if keep_original {
            self.preserved.entry(*edge).or_insert(previous);
        }
        Ok(())
    }

    fn probe(&self, edge: &Edge) -> Result<()> {
        let current = self.current(edge)?;
        let rasters = [Some(&current), self.preserved.get(edge), self.coherence.get(edge)];
        for raster in rasters.into_iter().flatten() {
            if raster.dim() != self.shape.dim() {
                return Err(LoopClosureError::RasterSize {
                    path: PathBuf::from(edge.to_string()),
                    expected: self.shape.n_pixels() as u64 * 4,
                    actual: raster.len() as u64 * 4,
                    length: self.shape.length,
                    width: self.shape.width,
                });
            }
        }
        Ok(())
    }
}
