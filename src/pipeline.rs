//! Pass 1..4 driver.
//!
//! 1. scalar closure without reference, flags bad interferograms
//! 2. per-pixel closure votes without the pass-1 bad ones, picks the reference
//! 3. scalar closure relative to the reference, flags more bad interferograms
//! 4. per-pixel closure relative to the reference over the survivors,
//!    attributes errors to pixels and optionally nullifies them
//!
//! Passes 1 to 3 only read and run on a `rayon` pool. Pass 4 accumulates
//! first and decides afterwards; only its final step writes to the store.

use std::collections::{BTreeSet, HashMap};

use ndarray::{Array2, Axis, Zip};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::attribution::{nullified, support_masks, SupportTally};
use crate::classify::{classify_edges, edges_in, EdgeSets, EdgeState, LoopVerdict};
use crate::closure::{raster_closure, scalar_closure, ClosureOptions, ClosureVotes, LoopPhases};
use crate::config::LoopClosureConfig;
use crate::debias::CycleCorrection;
use crate::error::{LoopClosureError, Result};
use crate::network::{epochs_of, Edge, Epoch, Loop, Network};
use crate::raster::{has_data_in, Raster, RasterShape};
use crate::reference::{select_reference, RefArea, ReferenceInputs, ReferenceSelection};
use crate::store::EdgeStore;

/// Edge lists handed to a run.
#[derive(Debug, Clone, Default)]
pub struct RunInputs {
    /// every interferogram available in the store
    pub edges: Vec<Edge>,
    /// excluded earlier for unrelated reasons
    pub pre_excluded: BTreeSet<Edge>,
    /// operator's removal list
    pub manual: BTreeSet<Edge>,
}

#[derive(Debug, Clone)]
pub struct LoopRecord {
    pub lp: Loop,
    pub rms: Option<f32>,
    pub verdict: LoopVerdict,
    /// `None` when the loop was left out of the reference-relative pass
    pub verdict_ref: Option<LoopVerdict>,
    pub rms_ref: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct ReferenceOutcome {
    pub area: RefArea,
    /// `None` when the area was supplied
    pub selection: Option<ReferenceSelection>,
}

/// Per-pixel statistics of the last pass.
#[derive(Debug, Clone)]
pub struct LoopStatistics {
    pub n_loops: usize,
    pub n_loop_err: Array2<u32>,
    pub n_loop_err_rat: Array2<f32>,
    pub loop_ph_avg: Array2<f32>,
    pub loop_ph_avg_abs: Array2<f32>,
}

#[derive(Debug, Clone)]
pub struct NullifyOutcome {
    /// interferograms nullified at each pixel
    pub n_nullify: Array2<u32>,
    pub n_nullify_rat: Array2<f32>,
    /// edges whose stored raster was rewritten
    pub rewritten: Vec<usize>,
    pub n_pixels_removed: usize,
    pub n_loop_err_before: u64,
    pub n_loop_err_after: u64,
}

/// Aggregates over the retained interferograms.
#[derive(Debug, Clone)]
pub struct Aggregates {
    pub n_unw: Array2<u32>,
    pub coh_avg: Option<Array2<f32>>,
    /// average coherence of the most frequent temporal baseline (days)
    pub coh_avg_mode: Option<(i64, Array2<f32>)>,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub network: Network,
    pub dropped: Vec<(Edge, String)>,
    pub pre_excluded: Vec<Edge>,
    pub sets: EdgeSets,
    pub loops: Vec<LoopRecord>,
    /// no loop exists, nothing could be disambiguated
    pub degenerate_network: bool,
    pub reference: Option<ReferenceOutcome>,
    pub aggregates: Aggregates,
    pub loop_stats: Option<LoopStatistics>,
    pub nullification: Option<NullifyOutcome>,
}

impl RunOutcome {
    /// Interferograms surviving every exclusion.
    pub fn good_edges(&self) -> Vec<Edge> {
        retained(&self.network, &self.sets.excluded())
    }

    /// Epochs of the network no retained interferogram covers any more.
    pub fn removed_epochs(&self) -> Vec<Epoch> {
        let good: BTreeSet<Epoch> = epochs_of(&self.good_edges()).into_iter().collect();
        self.network
            .epochs()
            .into_iter()
            .filter(|e| !good.contains(e))
            .collect()
    }
}

fn retained(network: &Network, excluded: &BTreeSet<usize>) -> Vec<Edge> {
    network
        .edges()
        .iter()
        .enumerate()
        .filter(|(ix, _)| !excluded.contains(ix))
        .map(|(_, e)| *e)
        .collect()
}

/// Runs the four passes over `store`.
pub fn run<S: EdgeStore>(
    store: &mut S,
    inputs: &RunInputs,
    config: &LoopClosureConfig,
) -> Result<RunOutcome> {
    config.validate()?;
    let shape = store.shape();
    if let Some(area) = &config.reference {
        if !area.fits(shape) {
            return Err(LoopClosureError::Config(format!(
                "reference area {} lies outside the {}x{} raster",
                area, shape.width, shape.length
            )));
        }
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.n_para)
        .build()?;
    info!("[SETUP] {} worker threads", pool.current_num_threads());

    let reader: &S = store;
    let (kept, dropped) = pool.install(|| admit_edges(reader, inputs));
    let network = Network::new(kept);
    let n_edges = network.edges().len();
    info!(
        "[SETUP] {} interferograms, {} epochs, {} loops",
        n_edges,
        network.epochs().len(),
        network.loops().len()
    );

    let mut sets = EdgeSets::default();
    for edge in &inputs.manual {
        match network.index_of(edge) {
            Some(ix) => {
                sets.manual.insert(ix);
            }
            None => warn!("manually removed {} is not part of the network", edge),
        }
    }
    sets.no_loop = network.no_loop_edges().into_iter().collect();
    let pre_excluded: Vec<Edge> = inputs.pre_excluded.iter().copied().collect();

    if network.loops().is_empty() {
        warn!("[PASS 1] no loop found; erroneous interferograms cannot be disambiguated");
        let good = retained(&network, &sets.excluded());
        let aggregates = pool.install(|| aggregate(reader, &good, shape))?;
        return Ok(RunOutcome {
            network,
            dropped,
            pre_excluded,
            sets,
            loops: Vec::new(),
            degenerate_network: true,
            reference: None,
            aggregates,
            loop_stats: None,
            nullification: None,
        });
    }

    // pass 1
    let opts1 = ClosureOptions {
        reference: None,
        correction: CycleCorrection::Median {
            multi_prime: config.multi_prime,
        },
    };
    let rms1 = pool.install(|| scalar_pass(reader, &network, network.loops(), &opts1))?;
    let verdicts1: Vec<LoopVerdict> = rms1
        .iter()
        .map(|&r| LoopVerdict::from_rms(r, config.loop_threshold))
        .collect();
    let states1 = classify_edges(
        &vec![EdgeState::Unknown; n_edges],
        network.loops(),
        &verdicts1,
    );
    sets.bad_loop = edges_in(&states1, EdgeState::Bad);
    info!(
        "[PASS 1] {} of {} loops bad, {} interferograms bad, {} inapplicable loops",
        count(&verdicts1, LoopVerdict::Bad),
        verdicts1.len(),
        sets.bad_loop.len(),
        count(&verdicts1, LoopVerdict::Inapplicable)
    );
    for &ix in &sets.bad_loop {
        info!("[PASS 1] bad: {}", network.edge(ix));
    }

    // pass 2
    let excluded1 = sets.excluded_pre_reference();
    let loops2 = network.surviving_loops(&excluded1);
    let opts2 = opts1;
    let votes = pool.install(|| {
        loops2
            .par_iter()
            .try_fold(
                || ClosureVotes::zeros(shape),
                |mut acc, lp| -> Result<ClosureVotes> {
                    let phases = LoopPhases::load(reader, &network, lp)?;
                    acc.add(&raster_closure(&phases, &opts2));
                    Ok(acc)
                },
            )
            .try_reduce(|| ClosureVotes::zeros(shape), |a, b| Ok(a.merge(b)))
    })?;
    info!("[PASS 2] accumulated per-pixel votes of {} loops", loops2.len());

    let reference = match config.reference {
        Some(area) => {
            info!("[REF] using supplied reference area {}", area);
            ReferenceOutcome {
                area,
                selection: None,
            }
        }
        None => {
            let n_unw = pool.install(|| {
                count_valid(reader, &retained(&network, &excluded1), shape, Slot::Original)
            })?;
            let loop_rms = votes.rms();
            let selection = select_reference(&ReferenceInputs {
                n_unw: n_unw.view(),
                n_bad_loop: votes.n_bad.view(),
                loop_rms: loop_rms.view(),
            })?;
            ReferenceOutcome {
                area: selection.area,
                selection: Some(selection),
            }
        }
    };
    let area = reference.area;

    let checked: Vec<usize> = (0..n_edges).filter(|ix| !excluded1.contains(ix)).collect();
    let noref = pool.install(|| {
        checked
            .par_iter()
            .map(|&ix| -> Result<Option<usize>> {
                let phase = reader.original(&network.edge(ix))?;
                Ok((!has_data_in(phase.view(), &area)).then_some(ix))
            })
            .collect::<Result<Vec<_>>>()
    })?;
    sets.no_reference = noref.into_iter().flatten().collect();
    for &ix in &sets.no_reference {
        warn!("[REF] {} has no data in reference area {}", network.edge(ix), area);
    }

    // pass 3
    let mut excluded_ref = excluded1.clone();
    excluded_ref.extend(&sets.no_reference);
    let loops3 = network.surviving_loops(&excluded_ref);
    let opts3 = ClosureOptions {
        reference: Some(area),
        correction: CycleCorrection::Median { multi_prime: false },
    };
    let rms3 = pool.install(|| scalar_pass(reader, &network, &loops3, &opts3))?;
    let verdicts3: Vec<LoopVerdict> = rms3
        .iter()
        .map(|&r| LoopVerdict::from_rms(r, config.loop_threshold))
        .collect();
    let states3 = classify_edges(&vec![EdgeState::Unknown; n_edges], &loops3, &verdicts3);
    sets.bad_loop_ref = edges_in(&states3, EdgeState::Bad);
    let mut implicated = edges_in(&states3, EdgeState::Candidate);
    implicated.extend(&sets.bad_loop_ref);
    sets.settle_candidates(implicated);
    info!(
        "[PASS 3] {} of {} loops bad, {} more interferograms bad, {} candidates left",
        count(&verdicts3, LoopVerdict::Bad),
        verdicts3.len(),
        sets.bad_loop_ref.len(),
        sets.candidates.len()
    );
    for &ix in &sets.bad_loop_ref {
        info!("[PASS 3] bad: {}", network.edge(ix));
    }

    let pass3: HashMap<Loop, (Option<f32>, LoopVerdict)> = loops3
        .iter()
        .copied()
        .zip(rms3.iter().copied().zip(verdicts3.iter().copied()))
        .collect();
    let loops: Vec<LoopRecord> = network
        .loops()
        .iter()
        .zip(rms1.iter().zip(&verdicts1))
        .map(|(lp, (&rms, &verdict))| {
            let third = pass3.get(lp);
            LoopRecord {
                lp: *lp,
                rms,
                verdict,
                verdict_ref: third.map(|t| t.1),
                rms_ref: third.and_then(|t| t.0),
            }
        })
        .collect();

    // pass 4
    let bad_all = sets.excluded();
    let loops4 = network.surviving_loops(&bad_all);
    let opts4 = ClosureOptions {
        reference: Some(area),
        correction: CycleCorrection::Histogram {
            max_cycles: config.cycle_search,
        },
    };
    let tally = accumulate_support(reader, &network, &loops4, &opts4, config, Slot::Original)?;
    info!(
        "[PASS 4] {} loops, {} pixel loop errors",
        loops4.len(),
        total(&tally.n_loop_err)
    );
    let loop_stats = loop_statistics(&tally, loops4.len());

    let nullification = if config.nullify {
        let masks = support_masks(&tally, &loops4, config.policy);
        let mut n_nullify = Array2::<u32>::zeros(shape.dim());
        let mut n_checked = Array2::<u32>::zeros(shape.dim());
        let mut rewritten = Vec::new();
        let mut n_pixels_removed = 0;
        for e in 0..n_edges {
            let edge = network.edge(e);
            let original = store.original(&edge)?;
            if tally.loops_per_edge[e] == 0 {
                // no loop says anything here: the current slot is the original
                if !same_phase(&store.current(&edge)?, &original) {
                    store.replace_current(&edge, &original, config.save_original)?;
                    rewritten.push(e);
                    debug!("[NULLIFY] {}: restored from the original", edge);
                }
                continue;
            }
            let mask = masks.index_axis(Axis(0), e);
            Zip::from(&mut n_nullify)
                .and(&mut n_checked)
                .and(&original)
                .and(mask)
                .for_each(|n, checked, &v, &keep| {
                    if !v.is_nan() {
                        *checked += 1;
                        if !keep {
                            *n += 1;
                        }
                    }
                });
            let (phase, removed) = nullified(&original, mask);
            n_pixels_removed += removed;
            if !same_phase(&store.current(&edge)?, &phase) {
                store.replace_current(&edge, &phase, config.save_original)?;
                rewritten.push(e);
                debug!("[NULLIFY] {}: {} pixels", edge, removed);
            }
        }
        info!(
            "[NULLIFY] {:?} policy removed {} pixels, {} interferograms rewritten",
            config.policy,
            n_pixels_removed,
            rewritten.len()
        );

        let n_loop_err_before = total(&tally.n_loop_err);
        let n_loop_err_after = if rewritten.is_empty() {
            n_loop_err_before
        } else {
            let reader: &S = store;
            let after = accumulate_support(reader, &network, &loops4, &opts4, config, Slot::Current)?;
            total(&after.n_loop_err)
        };
        info!(
            "[NULLIFY] pixel loop errors {} -> {}",
            n_loop_err_before, n_loop_err_after
        );

        let n_nullify_rat = Zip::from(&n_nullify)
            .and(&n_checked)
            .map_collect(|&n, &c| if c == 0 { f32::NAN } else { n as f32 / c as f32 });
        Some(NullifyOutcome {
            n_nullify,
            n_nullify_rat,
            rewritten,
            n_pixels_removed,
            n_loop_err_before,
            n_loop_err_after,
        })
    } else {
        None
    };

    let reader: &S = store;
    let good = retained(&network, &bad_all);
    let aggregates = pool.install(|| aggregate(reader, &good, shape))?;

    Ok(RunOutcome {
        network,
        dropped,
        pre_excluded,
        sets,
        loops,
        degenerate_network: false,
        reference: Some(reference),
        aggregates,
        loop_stats: Some(loop_stats),
        nullification,
    })
}

/// Drops pre-excluded and unreadable interferograms.
fn admit_edges<S: EdgeStore + ?Sized>(
    store: &S,
    inputs: &RunInputs,
) -> (Vec<Edge>, Vec<(Edge, String)>) {
    let probed: Vec<(Edge, Result<()>)> = inputs
        .edges
        .par_iter()
        .filter(|e| !inputs.pre_excluded.contains(*e))
        .map(|e| (*e, store.probe(e)))
        .collect();
    let mut kept = Vec::new();
    let mut dropped = Vec::new();
    for (edge, status) in probed {
        match status {
            Ok(()) => kept.push(edge),
            Err(e) => {
                warn!("[SETUP] dropping {}: {}", edge, e);
                dropped.push((edge, e.to_string()));
            }
        }
    }
    (kept, dropped)
}

fn scalar_pass<S: EdgeStore + ?Sized>(
    store: &S,
    network: &Network,
    loops: &[Loop],
    opts: &ClosureOptions,
) -> Result<Vec<Option<f32>>> {
    loops
        .par_iter()
        .map(|lp| {
            let phases = LoopPhases::load(store, network, lp)?;
            Ok(scalar_closure(&phases, opts))
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Original,
    Current,
}

fn read_slot<S: EdgeStore + ?Sized>(store: &S, edge: &Edge, slot: Slot) -> Result<Raster> {
    match slot {
        Slot::Original => store.original(edge),
        Slot::Current => store.current(edge),
    }
}

fn accumulate_support<S: EdgeStore + ?Sized>(
    store: &S,
    network: &Network,
    loops: &[Loop],
    opts: &ClosureOptions,
    config: &LoopClosureConfig,
    slot: Slot,
) -> Result<SupportTally> {
    let mut tally = SupportTally::new(
        network.edges().len(),
        store.shape(),
        config.nullify_threshold,
    );
    for (i, lp) in loops.iter().enumerate() {
        if i % 100 == 0 {
            debug!("[PASS 4] {:>5}/{} loops", i, loops.len());
        }
        let phases = match slot {
            Slot::Original => LoopPhases::load(store, network, lp)?,
            Slot::Current => LoopPhases::load_current(store, network, lp)?,
        };
        tally.add_loop(lp, &raster_closure(&phases, opts));
    }
    Ok(tally)
}

fn loop_statistics(tally: &SupportTally, n_loops: usize) -> LoopStatistics {
    let (loop_ph_avg, loop_ph_avg_abs) = tally.loop_phase_averages();
    let n_loop_err_rat = tally.n_loop_err.mapv(|n| {
        if n_loops == 0 {
            f32::NAN
        } else {
            n as f32 / n_loops as f32
        }
    });
    LoopStatistics {
        n_loops,
        n_loop_err: tally.n_loop_err.clone(),
        n_loop_err_rat,
        loop_ph_avg,
        loop_ph_avg_abs,
    }
}

fn count_valid<S: EdgeStore + ?Sized>(
    store: &S,
    edges: &[Edge],
    shape: RasterShape,
    slot: Slot,
) -> Result<Array2<u32>> {
    edges
        .par_iter()
        .try_fold(
            || Array2::<u32>::zeros(shape.dim()),
            |mut acc, edge| -> Result<Array2<u32>> {
                let phase = read_slot(store, edge, slot)?;
                Zip::from(&mut acc).and(&phase).for_each(|n, &v| {
                    if !v.is_nan() {
                        *n += 1;
                    }
                });
                Ok(acc)
            },
        )
        .try_reduce(|| Array2::zeros(shape.dim()), |a, b| Ok(a + b))
}

/// Most frequent temporal baseline in days; the shortest wins ties.
pub fn most_frequent_baseline(edges: &[Edge]) -> Option<i64> {
    let mut counts: HashMap<i64, usize> = HashMap::new();
    for e in edges {
        *counts.entry(e.temporal_baseline_days()).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
        .map(|(days, _)| days)
}

struct CoherenceSums {
    sum: Array2<f32>,
    n: Array2<u32>,
    mode_sum: Array2<f32>,
    mode_n: Array2<u32>,
    seen: bool,
}

impl CoherenceSums {
    fn zeros(shape: RasterShape) -> Self {
        CoherenceSums {
            sum: Array2::zeros(shape.dim()),
            n: Array2::zeros(shape.dim()),
            mode_sum: Array2::zeros(shape.dim()),
            mode_n: Array2::zeros(shape.dim()),
            seen: false,
        }
    }

    fn merge(mut self, other: CoherenceSums) -> Self {
        self.sum += &other.sum;
        self.n += &other.n;
        self.mode_sum += &other.mode_sum;
        self.mode_n += &other.mode_n;
        self.seen |= other.seen;
        self
    }
}

fn coherence_mean(sum: &Array2<f32>, n: &Array2<u32>) -> Array2<f32> {
    Zip::from(sum).and(n).map_collect(|&s, &n| {
        let avg = if n == 0 { 0.0 } else { s / n as f32 };
        if avg == 0.0 {
            f32::NAN
        } else {
            avg
        }
    })
}

fn aggregate<S: EdgeStore + ?Sized>(
    store: &S,
    edges: &[Edge],
    shape: RasterShape,
) -> Result<Aggregates> {
    let n_unw = count_valid(store, edges, shape, Slot::Current)?;
    let mode = most_frequent_baseline(edges);
    let sums = edges
        .par_iter()
        .fold(
            || CoherenceSums::zeros(shape),
            |mut acc, edge| {
                let coh = match store.coherence(edge) {
                    Ok(Some(coh)) => coh,
                    Ok(None) => return acc,
                    Err(e) => {
                        warn!("[REPORT] coherence of {} skipped: {}", edge, e);
                        return acc;
                    }
                };
                acc.seen = true;
                let in_mode = Some(edge.temporal_baseline_days()) == mode;
                Zip::from(&mut acc.sum)
                    .and(&mut acc.n)
                    .and(&mut acc.mode_sum)
                    .and(&mut acc.mode_n)
                    .and(&coh)
                    .for_each(|s, n, ms, mn, &c| {
                        *s += c;
                        if c != 0.0 {
                            *n += 1;
                        }
                        if in_mode {
                            *ms += c;
                            if c != 0.0 {
                                *mn += 1;
                            }
                        }
                    });
                acc
            },
        )
        .reduce(|| CoherenceSums::zeros(shape), CoherenceSums::merge);

    let (coh_avg, coh_avg_mode) = if sums.seen {
        (
            Some(coherence_mean(&sums.sum, &sums.n)),
            mode.map(|days| (days, coherence_mean(&sums.mode_sum, &sums.mode_n))),
        )
    } else {
        (None, None)
    };
    Ok(Aggregates {
        n_unw,
        coh_avg,
        coh_avg_mode,
    })
}

fn same_phase(a: &Array2<f32>, b: &Array2<f32>) -> bool {
    a.dim() == b.dim()
        && Zip::from(a)
            .and(b)
            .all(|&x, &y| x == y || (x.is_nan() && y.is_nan()))
}

fn count(verdicts: &[LoopVerdict], which: LoopVerdict) -> usize {
    verdicts.iter().filter(|&&v| v == which).count()
}

fn total(counts: &Array2<u32>) -> u64 {
    counts.iter().map(|&n| n as u64).sum()
}
