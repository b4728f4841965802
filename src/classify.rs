//! Edge-level verdicts from loop-level verdicts.
//!
//! Each edge runs a small state machine fed with the verdicts of the loops
//! that touch it. An edge seen only in bad loops ends `Bad`, one seen in both
//! good and bad loops ends `Candidate`: loop closure alone cannot say which of
//! the three edges of a mixed loop is at fault.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::network::Loop;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoopVerdict {
    Good,
    Bad,
    /// No valid pixel anywhere in the loop.
    Inapplicable,
}

impl LoopVerdict {
    /// `rms >= threshold` is bad; a missing RMS makes the loop inapplicable.
    pub fn from_rms(rms: Option<f32>, threshold: f32) -> Self {
        match rms {
            None => LoopVerdict::Inapplicable,
            Some(v) if v.is_nan() => LoopVerdict::Inapplicable,
            Some(v) if v >= threshold => LoopVerdict::Bad,
            Some(_) => LoopVerdict::Good,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EdgeState {
    Unknown,
    Good,
    Bad,
    Candidate,
    NoLoop,
    NoReference,
}

impl EdgeState {
    pub fn observe(self, verdict: LoopVerdict) -> EdgeState {
        use EdgeState::*;
        match (self, verdict) {
            (NoLoop | NoReference, _) => self,
            (_, LoopVerdict::Inapplicable) => self,
            (Unknown, LoopVerdict::Good) => Good,
            (Unknown, LoopVerdict::Bad) => Bad,
            (Good, LoopVerdict::Bad) | (Bad, LoopVerdict::Good) => Candidate,
            (state, _) => state,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, EdgeState::NoLoop | EdgeState::NoReference)
    }
}

/// Runs the per-edge state machine over `loops` (indexed into the same edge
/// numbering as `initial`). Non-terminal edges touched by no loop at all
/// become `NoLoop`.
pub fn classify_edges(
    initial: &[EdgeState],
    loops: &[Loop],
    verdicts: &[LoopVerdict],
) -> Vec<EdgeState> {
    debug_assert_eq!(loops.len(), verdicts.len());
    let mut states = initial.to_vec();
    let mut touched = vec![false; states.len()];
    for (lp, &verdict) in loops.iter().zip(verdicts) {
        for &e in &lp.edges {
            touched[e] = true;
            states[e] = states[e].observe(verdict);
        }
    }
    for (state, touched) in states.iter_mut().zip(touched) {
        if !touched && !state.is_terminal() {
            *state = EdgeState::NoLoop;
        }
    }
    states
}

/// Indices of the edges in `state`.
pub fn edges_in(states: &[EdgeState], state: EdgeState) -> BTreeSet<usize> {
    states
        .iter()
        .enumerate()
        .filter(|(_, &s)| s == state)
        .map(|(ix, _)| ix)
        .collect()
}

/// Membership sets accumulated over a run. Sets only ever grow.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EdgeSets {
    /// bad from the reference-free pass
    pub bad_loop: BTreeSet<usize>,
    /// manually removed
    pub manual: BTreeSet<usize>,
    /// no data in the reference area
    pub no_reference: BTreeSet<usize>,
    /// bad from the reference-relative pass
    pub bad_loop_ref: BTreeSet<usize>,
    /// implicated in a bad loop of the reference-relative pass but not excluded
    pub candidates: BTreeSet<usize>,
    pub no_loop: BTreeSet<usize>,
}

impl EdgeSets {
    /// Edges excluded before the reference is chosen.
    pub fn excluded_pre_reference(&self) -> BTreeSet<usize> {
        self.bad_loop.union(&self.manual).copied().collect()
    }

    /// Every edge excluded from reference-relative computations.
    pub fn excluded(&self) -> BTreeSet<usize> {
        let mut all = self.excluded_pre_reference();
        all.extend(&self.no_reference);
        all.extend(&self.bad_loop_ref);
        all
    }

    /// Settles the remaining candidates once every exclusion is known.
    pub fn settle_candidates(&mut self, implicated: BTreeSet<usize>) {
        let excluded = self.excluded();
        self.candidates = implicated.difference(&excluded).copied().collect();
    }
}
