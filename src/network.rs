//! Interferogram network: epochs, edges (pairs) and the closed triangles
//! ("loops") that make loop-closure checking possible.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use ndarray::Array2;

use crate::error::{LoopClosureError, Result};

/// Acquisition date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epoch(NaiveDate);

impl Epoch {
    pub fn days_until(&self, later: &Epoch) -> i64 {
        (later.0 - self.0).num_days()
    }
}

impl FromStr for Epoch {
    type Err = LoopClosureError;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(LoopClosureError::InvalidEpoch(s.to_string()));
        }
        NaiveDate::parse_from_str(s, "%Y%m%d")
            .map(Epoch)
            .map_err(|_| LoopClosureError::InvalidEpoch(s.to_string()))
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y%m%d"))
    }
}

/// One unwrapped interferogram between two epochs, `primary < secondary`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Edge {
    pub primary: Epoch,
    pub secondary: Epoch,
}

impl Edge {
    pub fn new(primary: Epoch, secondary: Epoch) -> Result<Self> {
        if primary >= secondary {
            return Err(LoopClosureError::InvalidEdge(format!(
                "{}_{}",
                primary, secondary
            )));
        }
        Ok(Edge { primary, secondary })
    }

    pub fn temporal_baseline_days(&self) -> i64 {
        self.primary.days_until(&self.secondary)
    }
}

impl FromStr for Edge {
    type Err = LoopClosureError;

    fn from_str(s: &str) -> Result<Self> {
        let (p, q) = s
            .split_once('_')
            .ok_or_else(|| LoopClosureError::InvalidEdge(s.to_string()))?;
        let primary: Epoch = p
            .parse()
            .map_err(|_| LoopClosureError::InvalidEdge(s.to_string()))?;
        let secondary: Epoch = q
            .parse()
            .map_err(|_| LoopClosureError::InvalidEdge(s.to_string()))?;
        Edge::new(primary, secondary)
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.primary, self.secondary)
    }
}

/// A closed triangle `e1 < e2 < e3`. `edges` indexes the owning network as
/// `[e1->e2, e2->e3, e1->e3]`; the first two enter the closure with +1, the
/// last with -1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Loop {
    pub epochs: [Epoch; 3],
    pub edges: [usize; 3],
}

impl Loop {
    pub fn touches(&self, edge: usize) -> bool {
        self.edges.contains(&edge)
    }

    pub fn touches_any(&self, set: &BTreeSet<usize>) -> bool {
        self.edges.iter().any(|e| set.contains(e))
    }
}

/// Ordered, duplicate-free set of edges with its loops.
#[derive(Debug, Clone)]
pub struct Network {
    edges: Vec<Edge>,
    index: HashMap<Edge, usize>,
    loops: Vec<Loop>,
}

impl Network {
    pub fn new<I>(edges: I) -> Self
    where
        I: IntoIterator<Item = Edge>,
    {
        let edges: Vec<Edge> = edges
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let index = edges.iter().enumerate().map(|(i, e)| (*e, i)).collect();
        let loops = enumerate_loops(&edges, &index);
        Network {
            edges,
            index,
            loops,
        }
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn edge(&self, ix: usize) -> Edge {
        self.edges[ix]
    }

    pub fn index_of(&self, edge: &Edge) -> Option<usize> {
        self.index.get(edge).copied()
    }

    pub fn loops(&self) -> &[Loop] {
        &self.loops
    }

    pub fn epochs(&self) -> Vec<Epoch> {
        epochs_of(&self.edges)
    }

    /// Signed loop-incidence matrix, rows = loops, columns = edges.
    pub fn incidence(&self) -> Array2<i8> {
        let mut a = Array2::<i8>::zeros((self.loops.len(), self.edges.len()));
        for (row, lp) in self.loops.iter().enumerate() {
            a[[row, lp.edges[0]]] = 1;
            a[[row, lp.edges[1]]] = 1;
            a[[row, lp.edges[2]]] = -1;
        }
        a
    }

    pub fn loops_per_edge(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.edges.len()];
        for lp in &self.loops {
            for &e in &lp.edges {
                counts[e] += 1;
            }
        }
        counts
    }

    pub fn no_loop_edges(&self) -> Vec<usize> {
        self.loops_per_edge()
            .iter()
            .enumerate()
            .filter(|(_, &n)| n == 0)
            .map(|(ix, _)| ix)
            .collect()
    }

    /// Loops whose three edges all lie outside `excluded`. These are exactly
    /// the loops of the network rebuilt without the excluded edges.
    pub fn surviving_loops(&self, excluded: &BTreeSet<usize>) -> Vec<Loop> {
        self.loops
            .iter()
            .filter(|lp| !lp.touches_any(excluded))
            .copied()
            .collect()
    }
}

fn enumerate_loops(edges: &[Edge], index: &HashMap<Edge, usize>) -> Vec<Loop> {
    let mut by_primary: BTreeMap<Epoch, Vec<usize>> = BTreeMap::new();
    for (ix, edge) in edges.iter().enumerate() {
        by_primary.entry(edge.primary).or_default().push(ix);
    }

    let mut loops = Vec::new();
    for (ix12, e12) in edges.iter().enumerate() {
        let Some(continuations) = by_primary.get(&e12.secondary) else {
            continue;
        };
        for &ix23 in continuations {
            let e23 = edges[ix23];
            let closing = Edge {
                primary: e12.primary,
                secondary: e23.secondary,
            };
            if let Some(&ix13) = index.get(&closing) {
                loops.push(Loop {
                    epochs: [e12.primary, e12.secondary, e23.secondary],
                    edges: [ix12, ix23, ix13],
                });
            }
        }
    }
    loops
}

pub fn epochs_of(edges: &[Edge]) -> Vec<Epoch> {
    edges
        .iter()
        .flat_map(|e| [e.primary, e.secondary])
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectedSpan {
    pub first: Epoch,
    pub last: Epoch,
    pub years: f64,
    pub n_images: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkGaps {
    pub gaps: Vec<(Epoch, Epoch)>,
    pub connected: Vec<ConnectedSpan>,
}

/// Intervals between consecutive epochs that no edge spans, and the
/// connected pieces between them.
pub fn network_gaps(edges: &[Edge]) -> NetworkGaps {
    let epochs = epochs_of(edges);
    if epochs.is_empty() {
        return NetworkGaps {
            gaps: Vec::new(),
            connected: Vec::new(),
        };
    }
    let position: HashMap<Epoch, usize> =
        epochs.iter().enumerate().map(|(i, e)| (*e, i)).collect();
    let mut spanned = vec![false; epochs.len().saturating_sub(1)];
    for edge in edges {
        let (a, b) = (position[&edge.primary], position[&edge.secondary]);
        for covered in spanned.iter_mut().take(b).skip(a) {
            *covered = true;
        }
    }

    let gap_ix: Vec<usize> = spanned
        .iter()
        .enumerate()
        .filter(|(_, &s)| !s)
        .map(|(i, _)| i)
        .collect();

    let mut connected = Vec::new();
    let mut start = 0usize;
    for end in gap_ix.iter().copied().chain(std::iter::once(epochs.len() - 1)) {
        let (first, last) = (epochs[start], epochs[end]);
        connected.push(ConnectedSpan {
            first,
            last,
            years: first.days_until(&last) as f64 / 365.25,
            n_images: end - start + 1,
        });
        start = end + 1;
    }

    NetworkGaps {
        gaps: gap_ix.iter().map(|&i| (epochs[i], epochs[i + 1])).collect(),
        connected,
    }
}
