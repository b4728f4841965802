use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};

use loopclosure::network::Edge;
use loopclosure::reference::RefArea;
use loopclosure::report::{write_report, OutputDirs};
use loopclosure::store::DirStore;
use loopclosure::{run, RunInputs, VERSION};

mod args;

use args::Args;

/// Interferogram names, one per line; anything after the name is ignored.
fn read_edge_list(path: &Path) -> Result<BTreeSet<Edge>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let mut edges = BTreeSet::new();
    for line in text.lines() {
        let Some(name) = line.split_whitespace().next() else {
            continue;
        };
        if name.starts_with('#') {
            continue;
        }
        match name.parse::<Edge>() {
            Ok(edge) => {
                edges.insert(edge);
            }
            Err(e) => warn!("{}: skipping '{}': {}", path.display(), name, e),
        }
    }
    Ok(edges)
}

fn read_reference(path: &Path) -> Result<RefArea> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let first = text.split_whitespace().next().unwrap_or_default();
    first
        .parse::<RefArea>()
        .with_context(|| format!("invalid reference area in {}", path.display()))
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = args
        .log_level
        .parse::<tracing_subscriber::filter::LevelFilter>()
        .unwrap_or(tracing_subscriber::filter::LevelFilter::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    let start = Instant::now();
    info!("loopclosure v{}", VERSION);

    let mut store = DirStore::open(&args.ifgdir)
        .with_context(|| format!("cannot open interferogram directory {}", args.ifgdir.display()))?;
    let tsadir = args.resolved_tsadir();
    if !tsadir.is_dir() {
        bail!("no {} directory exists", tsadir.display());
    }
    let dirs = OutputDirs::under(&tsadir);
    dirs.create()?;

    let mut config = args.to_config();
    if config.reference.is_none() {
        let ref120 = dirs.info_dir.join("120ref.txt");
        if ref120.exists() {
            let area = read_reference(&ref120)?;
            info!("[REF] reference area {} taken from {}", area, ref120.display());
            config.reference = Some(area);
        }
    }

    let mut pre_excluded = BTreeSet::new();
    for name in ["11bad_ifg.txt", "120bad_ifg.txt"] {
        let path = dirs.info_dir.join(name);
        if path.exists() {
            pre_excluded.extend(read_edge_list(&path)?);
        } else if name == "11bad_ifg.txt" {
            warn!("{} not found, no interferogram excluded beforehand", path.display());
        }
    }
    let manual = match &args.rm_ifg_list {
        Some(path) => read_edge_list(path)?,
        None => BTreeSet::new(),
    };

    let inputs = RunInputs {
        edges: store.list_edges()?,
        pre_excluded,
        manual,
    };
    let outcome = run(&mut store, &inputs, &config).context("loop closure failed")?;
    let summary = write_report(&dirs, &outcome, &config, args.rm_ifg_list.as_deref())?;

    if summary.degenerate_network {
        println!("\nNo loop in the network; bad interferograms cannot be identified.");
    }
    if !summary.no_loop.is_empty() {
        println!(
            "\nThere are {} interferograms without loop, check them manually.",
            summary.no_loop.len()
        );
    }
    if !summary.candidates.is_empty() {
        println!(
            "\nThere are {} remaining candidates of bad interferograms but not identified.",
            summary.candidates.len()
        );
    }
    let n_discarded = summary.n_interferograms - summary.n_retained;
    println!(
        "\n{}/{} interferograms are discarded from further processing.",
        n_discarded, summary.n_interferograms
    );
    if let Some(area) = summary.reference {
        println!("Reference area: {}", area);
    }
    if let Some(n) = summary.n_pixels_nullified {
        println!("Nullified pixels: {}", n);
    }
    println!("\nGaps and connected networks:\n{}", loopclosure::report::gap_report(&outcome));

    let elapsed = start.elapsed().as_secs();
    println!(
        "Elapsed time: {:02}h {:02}m {:02}s",
        elapsed / 3600,
        (elapsed / 60) % 60,
        elapsed % 60
    );
    println!("Output directory: {}", tsadir.display());
    Ok(())
}
