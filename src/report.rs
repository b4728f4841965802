//! Evidence lists, loop table, aggregate rasters and run summary.

use std::fmt::Display;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use ndarray::Array2;
use serde::Serialize;
use tracing::info;

use crate::classify::EdgeSets;
use crate::config::LoopClosureConfig;
use crate::error::{LoopClosureError, Result};
use crate::network::{network_gaps, Network};
use crate::pipeline::{LoopRecord, RunOutcome};
use crate::raster::write_f32;
use crate::reference::RefArea;

/// `12loop/`, `info/` and `results/` under the time-series directory.
#[derive(Debug, Clone)]
pub struct OutputDirs {
    pub loop_dir: PathBuf,
    pub info_dir: PathBuf,
    pub results_dir: PathBuf,
}

impl OutputDirs {
    pub fn under(tsadir: &Path) -> Self {
        OutputDirs {
            loop_dir: tsadir.join("12loop"),
            info_dir: tsadir.join("info"),
            results_dir: tsadir.join("results"),
        }
    }

    pub fn create(&self) -> Result<()> {
        for dir in [&self.loop_dir, &self.info_dir, &self.results_dir] {
            fs::create_dir_all(dir).map_err(|e| LoopClosureError::io_at(dir, e))?;
        }
        Ok(())
    }
}

fn create(path: &Path) -> Result<BufWriter<File>> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|e| LoopClosureError::io_at(path, e))
}

/// One item per line.
pub fn write_list<I>(path: &Path, items: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Display,
{
    let mut w = create(path)?;
    for item in items {
        writeln!(w, "{}", item).map_err(|e| LoopClosureError::io_at(path, e))?;
    }
    w.flush().map_err(|e| LoopClosureError::io_at(path, e))
}

fn names(network: &Network, set: &std::collections::BTreeSet<usize>) -> Vec<String> {
    set.iter().map(|&ix| network.edge(ix).to_string()).collect()
}

/// Flags of a loop: first column for the reference-free pass, second for the
/// reference-relative one.
pub fn loop_flags(record: &LoopRecord, sets: &EdgeSets) -> (&'static str, &'static str) {
    let any = |set: &std::collections::BTreeSet<usize>| record.lp.touches_any(set);
    if any(&sets.bad_loop) {
        ("*", "  ")
    } else if any(&sets.manual) {
        ("+", "  ")
    } else if any(&sets.no_reference) {
        (" ", "**")
    } else if any(&sets.bad_loop_ref) {
        (" ", "***")
    } else if any(&sets.candidates) {
        ("/", "  ")
    } else {
        (" ", "  ")
    }
}

pub fn loop_line(record: &LoopRecord, sets: &EdgeSets) -> String {
    let [e1, e2, e3] = record.lp.epochs;
    let (flag1, flag2) = loop_flags(record, sets);
    let rms_ref = match record.verdict_ref {
        None => "--".to_string(),
        Some(_) => format!("{:.2}", record.rms_ref.unwrap_or(f32::NAN)),
    };
    format!(
        "{} {} {}    {:5.2} {}  {:5} {}",
        e1,
        e2,
        e3,
        record.rms.unwrap_or(f32::NAN),
        flag1,
        rms_ref,
        flag2
    )
}

pub fn write_loop_info(
    path: &Path,
    outcome: &RunOutcome,
    config: &LoopClosureConfig,
    manual_list: Option<&Path>,
) -> Result<()> {
    let io = |e: std::io::Error| LoopClosureError::io_at(path, e);
    let mut w = create(path)?;
    writeln!(w, "# loop_thre: {} rad", config.loop_threshold).map_err(io)?;
    writeln!(w, "# *: Removed w/o ref, **: No ref, ***: Removed w/ ref").map_err(io)?;
    if let Some(list) = manual_list {
        writeln!(
            w,
            "# +: Removed by manually indicating in {}",
            list.display()
        )
        .map_err(io)?;
    }
    writeln!(w, "# /: Candidates of bad loops but causative ifgs unidentified").map_err(io)?;
    writeln!(w, "# image1   image2   image3 RMS w/oref  w/ref").map_err(io)?;
    for record in &outcome.loops {
        writeln!(w, "{}", loop_line(record, &outcome.sets)).map_err(io)?;
    }
    w.flush().map_err(io)
}

/// Gaps and connected sub-networks of the retained interferograms.
pub fn gap_report(outcome: &RunOutcome) -> String {
    let gaps = network_gaps(&outcome.good_edges());
    let mut text = String::new();
    if !gaps.gaps.is_empty() {
        text.push_str("Gaps between:\n");
        for (a, b) in &gaps.gaps {
            text.push_str(&format!("{} {}\n", a, b));
        }
    }
    text.push_str("\nConnected network (year, n_image):\n");
    for span in &gaps.connected {
        text.push_str(&format!(
            "{}-{} ({:.2}, {})\n",
            span.first, span.last, span.years, span.n_images
        ));
    }
    text
}

fn counts_as_f32(counts: &Array2<u32>) -> Array2<f32> {
    counts.mapv(|n| n as f32)
}

/// Float32 rasters under `results/` (and the reference-selection RMS under `12loop/`).
pub fn write_results(dirs: &OutputDirs, outcome: &RunOutcome) -> Result<()> {
    let results = &dirs.results_dir;
    let agg = &outcome.aggregates;
    write_f32(&results.join("n_unw"), counts_as_f32(&agg.n_unw).view())?;
    if let Some(coh) = &agg.coh_avg {
        write_f32(&results.join("coh_avg"), coh.view())?;
    }
    if let Some((days, coh)) = &agg.coh_avg_mode {
        write_f32(&results.join(format!("coh_avg_{}", days)), coh.view())?;
    }
    if let Some(stats) = &outcome.loop_stats {
        write_f32(&results.join("n_loop_err"), counts_as_f32(&stats.n_loop_err).view())?;
        write_f32(&results.join("n_loop_err_rat"), stats.n_loop_err_rat.view())?;
        write_f32(&results.join("loop_ph_avg"), stats.loop_ph_avg.view())?;
        write_f32(&results.join("loop_ph_avg_abs"), stats.loop_ph_avg_abs.view())?;
    }
    if let Some(null) = &outcome.nullification {
        write_f32(&results.join("n_nullify"), counts_as_f32(&null.n_nullify).view())?;
        write_f32(&results.join("n_nullify_rat"), null.n_nullify_rat.view())?;
    }
    if let Some(sel) = outcome.reference.as_ref().and_then(|r| r.selection.as_ref()) {
        write_f32(&dirs.loop_dir.join("loop_ph_rms_masked"), sel.rms_masked.view())?;
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub generated: String,
    pub config: LoopClosureConfig,
    pub n_interferograms: usize,
    pub n_epochs: usize,
    pub n_loops: usize,
    pub degenerate_network: bool,
    pub reference: Option<RefArea>,
    pub reference_supplied: bool,
    pub bad_loop: Vec<String>,
    pub manual: Vec<String>,
    pub no_reference: Vec<String>,
    pub bad_loop_ref: Vec<String>,
    pub candidates: Vec<String>,
    pub no_loop: Vec<String>,
    pub dropped: Vec<String>,
    pub removed_epochs: Vec<String>,
    pub n_retained: usize,
    pub n_pixels_nullified: Option<usize>,
    pub n_rewritten: Option<usize>,
}

impl RunSummary {
    pub fn new(outcome: &RunOutcome, config: &LoopClosureConfig) -> Self {
        let net = &outcome.network;
        let sets = &outcome.sets;
        RunSummary {
            generated: Utc::now().to_rfc3339(),
            config: config.clone(),
            n_interferograms: net.edges().len(),
            n_epochs: net.epochs().len(),
            n_loops: net.loops().len(),
            degenerate_network: outcome.degenerate_network,
            reference: outcome.reference.as_ref().map(|r| r.area),
            reference_supplied: outcome
                .reference
                .as_ref()
                .is_some_and(|r| r.selection.is_none()),
            bad_loop: names(net, &sets.bad_loop),
            manual: names(net, &sets.manual),
            no_reference: names(net, &sets.no_reference),
            bad_loop_ref: names(net, &sets.bad_loop_ref),
            candidates: names(net, &sets.candidates),
            no_loop: names(net, &sets.no_loop),
            dropped: outcome.dropped.iter().map(|(e, _)| e.to_string()).collect(),
            removed_epochs: outcome
                .removed_epochs()
                .iter()
                .map(|e| e.to_string())
                .collect(),
            n_retained: outcome.good_edges().len(),
            n_pixels_nullified: outcome.nullification.as_ref().map(|n| n.n_pixels_removed),
            n_rewritten: outcome.nullification.as_ref().map(|n| n.rewritten.len()),
        }
    }
}

/// Writes every output of a run and returns the summary that went to JSON.
pub fn write_report(
    dirs: &OutputDirs,
    outcome: &RunOutcome,
    config: &LoopClosureConfig,
    manual_list: Option<&Path>,
) -> Result<RunSummary> {
    let net = &outcome.network;
    let sets = &outcome.sets;

    write_list(&dirs.loop_dir.join("bad_ifg_loop.txt"), names(net, &sets.bad_loop))?;
    write_list(&dirs.loop_dir.join("rm_ifg_man.txt"), names(net, &sets.manual))?;
    write_list(&dirs.loop_dir.join("bad_ifg_noref.txt"), names(net, &sets.no_reference))?;
    write_list(&dirs.loop_dir.join("bad_ifg_loopref.txt"), names(net, &sets.bad_loop_ref))?;
    write_list(
        &dirs.loop_dir.join("dropped_ifg.txt"),
        outcome.dropped.iter().map(|(e, why)| format!("{} {}", e, why)),
    )?;
    write_list(&dirs.info_dir.join("12bad_ifg.txt"), names(net, &sets.excluded()))?;
    write_list(&dirs.info_dir.join("12bad_ifg_cand.txt"), names(net, &sets.candidates))?;
    write_list(&dirs.info_dir.join("12no_loop_ifg.txt"), names(net, &sets.no_loop))?;
    write_list(&dirs.info_dir.join("12removed_image.txt"), outcome.removed_epochs())?;
    if let Some(reference) = &outcome.reference {
        write_list(&dirs.info_dir.join("12ref.txt"), [reference.area])?;
    }

    let gap_path = dirs.info_dir.join("12network_gap_info.txt");
    fs::write(&gap_path, gap_report(outcome)).map_err(|e| LoopClosureError::io_at(&gap_path, e))?;

    write_loop_info(&dirs.loop_dir.join("loop_info.txt"), outcome, config, manual_list)?;
    write_results(dirs, outcome)?;

    let summary = RunSummary::new(outcome, config);
    let json_path = dirs.loop_dir.join("loop_summary.json");
    let json = serde_json::to_string_pretty(&summary)
        .map_err(|e| LoopClosureError::Config(format!("summary serialization: {}", e)))?;
    fs::write(&json_path, json).map_err(|e| LoopClosureError::io_at(&json_path, e))?;
    info!("[REPORT] outputs written to {}", dirs.loop_dir.display());
    Ok(summary)
}
