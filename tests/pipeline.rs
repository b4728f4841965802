use std::f32::consts::PI;
use std::fs;
use std::path::Path;

use approx::assert_relative_eq;
use ndarray::Array2;
use tempfile::tempdir;

use loopclosure::attribution::NullifyPolicy;
use loopclosure::network::Edge;
use loopclosure::raster::{read_f32, write_f32, RasterShape};
use loopclosure::reference::RefArea;
use loopclosure::report::{write_report, OutputDirs};
use loopclosure::store::{DirStore, EdgeStore, MemoryStore};
use loopclosure::{run, LoopClosureConfig, RunInputs};

const DATES: [&str; 4] = ["20200101", "20200113", "20200125", "20200206"];

fn edge(i: usize, j: usize) -> Edge {
    format!("{}_{}", DATES[i], DATES[j]).parse().unwrap()
}

/// Smooth per-epoch phase screen, never zero away from the first epoch.
fn epoch_phase(k: usize, y: usize, x: usize) -> f32 {
    0.4 * k as f32 + 0.05 * (y * 10 + x) as f32 * k as f32
}

fn consistent(shape: RasterShape, i: usize, j: usize) -> Array2<f32> {
    Array2::from_shape_fn(shape.dim(), |(y, x)| {
        epoch_phase(j, y, x) - epoch_phase(i, y, x) + 0.1
    })
}

fn store_with(shape: RasterShape, pairs: &[(usize, usize)]) -> MemoryStore {
    let mut store = MemoryStore::new(shape);
    for &(i, j) in pairs {
        store.insert(edge(i, j), consistent(shape, i, j));
    }
    store
}

/// A triangle whose phases do not close: the closing edge gets the same
/// constant so the loop sum is exactly `offset`.
fn triangle_closing_at(shape: RasterShape, offset: f32) -> MemoryStore {
    let mut store = MemoryStore::new(shape);
    store.insert(edge(0, 1), Array2::from_elem(shape.dim(), 1.0));
    store.insert(edge(1, 2), Array2::from_elem(shape.dim(), offset - 0.5));
    store.insert(edge(0, 2), Array2::from_elem(shape.dim(), 0.5));
    store
}

fn inputs_of(store: &MemoryStore) -> RunInputs {
    RunInputs {
        edges: store.edges(),
        ..Default::default()
    }
}

#[test]
fn whole_cycle_loop_is_clean() {
    let shape = RasterShape::new(3, 4);
    let mut store = triangle_closing_at(shape, 4.0 * PI);
    for ((i, j), coh) in [((0, 1), 0.6f32), ((1, 2), 0.8), ((0, 2), 0.4)] {
        store.insert_coherence(edge(i, j), Array2::from_elem(shape.dim(), coh));
    }
    let inputs = inputs_of(&store);
    let config = LoopClosureConfig {
        nullify: true,
        ..Default::default()
    };
    let outcome = run(&mut store, &inputs, &config).unwrap();

    assert!(!outcome.degenerate_network);
    assert_eq!(outcome.loops.len(), 1);
    assert_relative_eq!(outcome.loops[0].rms.unwrap(), 0.0, epsilon = 1e-5);
    assert!(outcome.sets.excluded().is_empty());
    assert!(outcome.sets.candidates.is_empty());
    assert_eq!(outcome.good_edges().len(), 3);

    let null = outcome.nullification.as_ref().unwrap();
    assert_eq!(null.n_pixels_removed, 0);
    assert!(null.rewritten.is_empty());
    assert!(!store.has_preserved(&edge(0, 1)));
    assert!(outcome.aggregates.n_unw.iter().all(|&n| n == 3));
    let coh = outcome.aggregates.coh_avg.as_ref().unwrap();
    assert_relative_eq!(coh[[2, 3]], 0.6, epsilon = 1e-6);
    let (days, coh_mode) = outcome.aggregates.coh_avg_mode.as_ref().unwrap();
    assert_eq!(*days, 12);
    assert_relative_eq!(coh_mode[[0, 0]], 0.7, epsilon = 1e-6);
}

#[test]
fn half_cycle_pixel_is_nullified_and_rerun_is_idempotent() {
    let shape = RasterShape::new(3, 4);
    let mut store = triangle_closing_at(shape, 0.0);
    let mut ac = Array2::from_elem(shape.dim(), 0.5f32);
    ac[[1, 2]] += PI;
    store.insert(edge(0, 2), ac);

    let inputs = inputs_of(&store);
    let config = LoopClosureConfig {
        nullify: true,
        nullify_threshold: 0.5 * PI,
        policy: NullifyPolicy::Gentle,
        ..Default::default()
    };
    let first = run(&mut store, &inputs, &config).unwrap();
    assert!(first.sets.excluded().is_empty());
    assert_ne!(first.reference.as_ref().unwrap().area, RefArea::pixel(2, 1));

    let null = first.nullification.as_ref().unwrap();
    assert_eq!(null.n_pixels_removed, 3);
    assert_eq!(null.rewritten.len(), 3);
    assert_eq!(null.n_nullify[[1, 2]], 3);
    assert_eq!(null.n_nullify.iter().map(|&n| n as usize).sum::<usize>(), 3);
    for (i, j) in [(0, 1), (1, 2), (0, 2)] {
        let current = store.current(&edge(i, j)).unwrap();
        assert!(current[[1, 2]].is_nan());
        assert!(!current[[0, 0]].is_nan());
        assert!(store.has_preserved(&edge(i, j)));
        assert!(!store.original(&edge(i, j)).unwrap()[[1, 2]].is_nan());
    }

    let second = run(&mut store, &inputs, &config).unwrap();
    let null2 = second.nullification.as_ref().unwrap();
    assert_eq!(null2.n_pixels_removed, 3);
    assert!(null2.rewritten.is_empty());
    assert_relative_eq!(store.original(&edge(0, 2)).unwrap()[[1, 2]], 0.5 + PI);
}

#[test]
fn aggressive_nullifies_at_least_as_much_as_gentle() {
    let shape = RasterShape::new(2, 5);
    let pairs = [(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)];
    let build = || {
        let mut store = store_with(shape, &pairs);
        let mut bc = consistent(shape, 1, 2);
        bc[[0, 1]] += 2.0 * PI + 2.0;
        bc[[1, 3]] -= 2.5;
        store.insert(edge(1, 2), bc);
        let mut ad = consistent(shape, 0, 3);
        ad[[1, 3]] += 2.5;
        store.insert(edge(0, 3), ad);
        store
    };
    let removed = |policy| {
        let mut store = build();
        let inputs = inputs_of(&store);
        let config = LoopClosureConfig {
            nullify: true,
            policy,
            loop_threshold: 10.0,
            ..Default::default()
        };
        let outcome = run(&mut store, &inputs, &config).unwrap();
        outcome.nullification.unwrap().n_pixels_removed
    };
    let gentle = removed(NullifyPolicy::Gentle);
    let aggressive = removed(NullifyPolicy::Aggressive);
    assert!(gentle <= aggressive, "gentle {} > aggressive {}", gentle, aggressive);
    assert!(aggressive > 0);
}

#[test]
fn two_epochs_have_no_loop() {
    let shape = RasterShape::new(2, 2);
    let mut store = store_with(shape, &[(0, 1)]);
    let inputs = inputs_of(&store);
    let config = LoopClosureConfig {
        nullify: true,
        ..Default::default()
    };
    let outcome = run(&mut store, &inputs, &config).unwrap();

    assert!(outcome.degenerate_network);
    assert!(outcome.loops.is_empty());
    assert_eq!(outcome.sets.no_loop.len(), 1);
    assert!(outcome.reference.is_none());
    assert!(outcome.nullification.is_none());
    assert!(!store.has_preserved(&edge(0, 1)));
}

#[test]
fn pass_one_bad_edge_never_reaches_later_passes() {
    let shape = RasterShape::new(3, 3);
    let pairs = [(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)];
    let mut store = store_with(shape, &pairs);
    let broken = consistent(shape, 1, 2).mapv(|v| v + 2.0);
    store.insert(edge(1, 2), broken);

    let inputs = inputs_of(&store);
    let outcome = run(&mut store, &inputs, &LoopClosureConfig::default()).unwrap();
    let bc = outcome.network.index_of(&edge(1, 2)).unwrap();

    assert_eq!(outcome.sets.bad_loop.iter().copied().collect::<Vec<_>>(), vec![bc]);
    assert!(outcome.sets.bad_loop_ref.is_empty());
    assert!(outcome.sets.candidates.is_empty());
    for record in &outcome.loops {
        if record.lp.touches(bc) {
            assert!(record.verdict_ref.is_none());
        } else {
            assert!(record.verdict_ref.is_some());
        }
    }
    assert!(!outcome.good_edges().contains(&edge(1, 2)));
    assert!(outcome.removed_epochs().is_empty());
}

#[test]
fn manual_removal_is_reported() {
    let shape = RasterShape::new(2, 2);
    let pairs = [(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)];
    let mut store = store_with(shape, &pairs);
    let inputs = RunInputs {
        edges: store.edges(),
        manual: [edge(0, 3)].into_iter().collect(),
        ..Default::default()
    };
    let outcome = run(&mut store, &inputs, &LoopClosureConfig::default()).unwrap();
    let ad = outcome.network.index_of(&edge(0, 3)).unwrap();
    assert!(outcome.sets.manual.contains(&ad));
    assert!(!outcome.good_edges().contains(&edge(0, 3)));
}

fn write_pair(ifgdir: &Path, e: &Edge, phase: &Array2<f32>, coh: u8) {
    let dir = ifgdir.join(e.to_string());
    fs::create_dir_all(&dir).unwrap();
    write_f32(&dir.join(format!("{}.unw", e)), phase.view()).unwrap();
    fs::write(dir.join(format!("{}.cc", e)), vec![coh; phase.len()]).unwrap();
}

#[test]
fn directory_run_writes_every_output() {
    let root = tempdir().unwrap();
    let ifgdir = root.path().join("GEOCml1");
    let tsadir = root.path().join("TS_GEOCml1");
    fs::create_dir_all(&ifgdir).unwrap();
    fs::create_dir_all(tsadir.join("info")).unwrap();
    fs::write(
        ifgdir.join("slc.mli.par"),
        "range_samples:   4\nazimuth_lines:   3\n",
    )
    .unwrap();

    let shape = RasterShape::new(3, 4);
    for (i, j) in [(0, 1), (1, 2), (0, 2)] {
        write_pair(&ifgdir, &edge(i, j), &consistent(shape, i, j), 204);
    }
    // wrong size: must be dropped, not fatal
    let short = edge(2, 3);
    write_pair(&ifgdir, &short, &Array2::from_elem((1, 4), 1.0), 204);

    let mut store = DirStore::open(&ifgdir).unwrap();
    let inputs = RunInputs {
        edges: store.list_edges().unwrap(),
        ..Default::default()
    };
    assert_eq!(inputs.edges.len(), 4);
    let config = LoopClosureConfig {
        nullify: true,
        ..Default::default()
    };
    let outcome = run(&mut store, &inputs, &config).unwrap();
    assert_eq!(outcome.dropped.len(), 1);
    assert_eq!(outcome.dropped[0].0, short);
    assert_eq!(outcome.network.edges().len(), 3);

    let dirs = OutputDirs::under(&tsadir);
    dirs.create().unwrap();
    let summary = write_report(&dirs, &outcome, &config, None).unwrap();
    assert_eq!(summary.n_loops, 1);
    assert_eq!(summary.dropped, vec![short.to_string()]);

    let loop_info = fs::read_to_string(dirs.loop_dir.join("loop_info.txt")).unwrap();
    assert_eq!(loop_info.lines().filter(|l| !l.starts_with('#')).count(), 1);
    assert!(loop_info.contains("20200101 20200113 20200125"));

    let reference = fs::read_to_string(dirs.info_dir.join("12ref.txt")).unwrap();
    assert!(reference.trim().parse::<RefArea>().is_ok());

    let dropped = fs::read_to_string(dirs.loop_dir.join("dropped_ifg.txt")).unwrap();
    assert!(dropped.starts_with(&short.to_string()));

    let n_unw = read_f32(&dirs.results_dir.join("n_unw"), shape).unwrap();
    assert!(n_unw.iter().all(|&n| n == 3.0));
    let coh = read_f32(&dirs.results_dir.join("coh_avg"), shape).unwrap();
    assert_relative_eq!(coh[[0, 0]], 0.8, epsilon = 1e-6);
    assert!(dirs.results_dir.join("coh_avg_12").exists());
    assert!(dirs.results_dir.join("n_nullify").exists());

    let json = fs::read_to_string(dirs.loop_dir.join("loop_summary.json")).unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["n_interferograms"], 3);
    assert_eq!(value["degenerate_network"], false);

    let gaps = fs::read_to_string(dirs.info_dir.join("12network_gap_info.txt")).unwrap();
    assert!(gaps.contains("20200101-20200125 (0.07, 3)"));

    // nothing was nullified, so no backup exists
    assert!(!store.original_path(&edge(0, 1)).exists());
}

const FULL: [(usize, usize); 6] = [(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)];

/// `GEOCml1/` holding every pair of the four dates, plus an empty `TS_GEOCml1/`.
fn full_tree(root: &Path, shape: RasterShape) -> (std::path::PathBuf, std::path::PathBuf) {
    let ifgdir = root.join("GEOCml1");
    let tsadir = root.join("TS_GEOCml1");
    fs::create_dir_all(&ifgdir).unwrap();
    fs::create_dir_all(&tsadir).unwrap();
    fs::write(
        ifgdir.join("slc.mli.par"),
        format!(
            "range_samples:   {}\nazimuth_lines:   {}\n",
            shape.width, shape.length
        ),
    )
    .unwrap();
    for (i, j) in FULL {
        write_pair(&ifgdir, &edge(i, j), &consistent(shape, i, j), 204);
    }
    (ifgdir, tsadir)
}

fn run_dir(ifgdir: &Path, config: &LoopClosureConfig) -> (DirStore, loopclosure::RunOutcome) {
    let mut store = DirStore::open(ifgdir).unwrap();
    let inputs = RunInputs {
        edges: store.list_edges().unwrap(),
        ..Default::default()
    };
    let outcome = run(&mut store, &inputs, config).unwrap();
    (store, outcome)
}

#[test]
fn wrong_size_coherence_drops_the_edge() {
    let root = tempdir().unwrap();
    let shape = RasterShape::new(3, 4);
    let (ifgdir, tsadir) = full_tree(root.path(), shape);
    let ab = edge(0, 1);
    fs::write(ifgdir.join(ab.to_string()).join(format!("{}.cc", ab)), [1u8; 5]).unwrap();

    let (_, outcome) = run_dir(&ifgdir, &LoopClosureConfig::default());
    assert_eq!(outcome.dropped.len(), 1);
    assert_eq!(outcome.dropped[0].0, ab);
    assert_eq!(outcome.network.edges().len(), 5);
    assert_eq!(outcome.loops.len(), 2);

    let dirs = OutputDirs::under(&tsadir);
    dirs.create().unwrap();
    write_report(&dirs, &outcome, &LoopClosureConfig::default(), None).unwrap();
    let coh = read_f32(&dirs.results_dir.join("coh_avg"), shape).unwrap();
    assert_relative_eq!(coh[[1, 1]], 0.8, epsilon = 1e-6);
}

#[test]
fn wrong_size_current_next_to_backup_drops_the_edge() {
    let root = tempdir().unwrap();
    let shape = RasterShape::new(3, 4);
    let (ifgdir, _) = full_tree(root.path(), shape);
    let ab = edge(0, 1);
    let pair_dir = ifgdir.join(ab.to_string());
    write_f32(
        &pair_dir.join(format!("{}.unw.ori", ab)),
        consistent(shape, 0, 1).view(),
    )
    .unwrap();
    write_f32(
        &pair_dir.join(format!("{}.unw", ab)),
        Array2::from_elem((1, 4), 1.0f32).view(),
    )
    .unwrap();

    let config = LoopClosureConfig {
        nullify: true,
        ..Default::default()
    };
    let (_, outcome) = run_dir(&ifgdir, &config);
    assert_eq!(outcome.dropped.len(), 1);
    assert_eq!(outcome.dropped[0].0, ab);
    assert_eq!(outcome.network.index_of(&ab), None);
    assert_eq!(outcome.nullification.unwrap().n_pixels_removed, 0);
}

#[test]
fn edge_without_data_at_supplied_reference_is_set_aside() {
    let shape = RasterShape::new(3, 4);
    let mut store = store_with(shape, &FULL);
    let mut ad = consistent(shape, 0, 3);
    ad[[0, 0]] = f32::NAN;
    store.insert(edge(0, 3), ad);

    let inputs = inputs_of(&store);
    let config = LoopClosureConfig {
        reference: Some(RefArea::pixel(0, 0)),
        ..Default::default()
    };
    let outcome = run(&mut store, &inputs, &config).unwrap();
    let ad = outcome.network.index_of(&edge(0, 3)).unwrap();

    let reference = outcome.reference.as_ref().unwrap();
    assert_eq!(reference.area, RefArea::pixel(0, 0));
    assert!(reference.selection.is_none());
    assert_eq!(outcome.sets.no_reference.iter().copied().collect::<Vec<_>>(), vec![ad]);
    assert!(outcome.sets.bad_loop.is_empty());
    assert!(!outcome.good_edges().contains(&edge(0, 3)));
    for record in &outcome.loops {
        assert_eq!(record.verdict_ref.is_none(), record.lp.touches(ad));
    }
    assert_eq!(outcome.loop_stats.as_ref().unwrap().n_loops, 2);

    let root = tempdir().unwrap();
    let dirs = OutputDirs::under(root.path());
    dirs.create().unwrap();
    write_report(&dirs, &outcome, &config, None).unwrap();
    let loop_info = fs::read_to_string(dirs.loop_dir.join("loop_info.txt")).unwrap();
    let rows: Vec<&str> = loop_info.lines().filter(|l| !l.starts_with('#')).collect();
    assert_eq!(rows.len(), 4);
    for row in rows {
        let through_ad = row.starts_with(DATES[0]) && row.contains(DATES[3]);
        assert_eq!(row.ends_with("**"), through_ad, "{}", row);
    }
    let noref = fs::read_to_string(dirs.loop_dir.join("bad_ifg_noref.txt")).unwrap();
    assert_eq!(noref.trim(), edge(0, 3).to_string());
    let saved = fs::read_to_string(dirs.info_dir.join("12ref.txt")).unwrap();
    assert_eq!(saved.trim(), "0:1/0:1");
    assert!(!dirs.loop_dir.join("loop_ph_rms_masked").exists());
}

#[test]
fn offset_at_reference_is_caught_only_by_reference_pass() {
    let shape = RasterShape::new(3, 4);
    let mut store = store_with(shape, &FULL);
    let mut bc = consistent(shape, 1, 2);
    bc[[0, 0]] += 2.0;
    store.insert(edge(1, 2), bc);

    let inputs = inputs_of(&store);
    let config = LoopClosureConfig {
        reference: Some(RefArea::pixel(0, 0)),
        ..Default::default()
    };
    let outcome = run(&mut store, &inputs, &config).unwrap();
    let bc = outcome.network.index_of(&edge(1, 2)).unwrap();

    assert!(outcome.sets.bad_loop.is_empty());
    assert_eq!(outcome.sets.bad_loop_ref.iter().copied().collect::<Vec<_>>(), vec![bc]);
    assert_eq!(outcome.sets.candidates.len(), 4);
    assert!(!outcome.sets.candidates.contains(&bc));
    for record in &outcome.loops {
        assert_eq!(record.verdict, loopclosure::classify::LoopVerdict::Good);
        if record.lp.touches(bc) {
            assert_eq!(record.verdict_ref, Some(loopclosure::classify::LoopVerdict::Bad));
            assert!(record.rms_ref.unwrap() >= 1.5);
        }
    }
    assert_eq!(outcome.good_edges().len(), 5);
    assert_eq!(outcome.loop_stats.as_ref().unwrap().n_loops, 2);
}

#[test]
fn loop_without_any_data_is_inapplicable() {
    let shape = RasterShape::new(3, 4);
    let mut store = store_with(shape, &FULL);
    store.insert(edge(0, 3), Array2::from_elem(shape.dim(), f32::NAN));

    let inputs = inputs_of(&store);
    let config = LoopClosureConfig {
        nullify: true,
        ..Default::default()
    };
    let outcome = run(&mut store, &inputs, &config).unwrap();
    let ad = outcome.network.index_of(&edge(0, 3)).unwrap();

    assert!(!outcome.degenerate_network);
    for record in outcome.loops.iter().filter(|r| r.lp.touches(ad)) {
        assert!(record.rms.is_none());
        assert_eq!(record.verdict, loopclosure::classify::LoopVerdict::Inapplicable);
        assert!(record.verdict_ref.is_none());
    }
    assert!(outcome.sets.bad_loop.is_empty());
    assert!(outcome.sets.bad_loop_ref.is_empty());
    assert!(outcome.sets.no_reference.contains(&ad));
    assert_eq!(outcome.nullification.unwrap().n_pixels_removed, 0);
}

#[test]
fn edges_left_without_loops_get_their_original_back() {
    let shape = RasterShape::new(3, 4);
    let mut store = triangle_closing_at(shape, 0.0);
    let mut ac = Array2::from_elem(shape.dim(), 0.5f32);
    ac[[1, 2]] += PI;
    store.insert(edge(0, 2), ac);
    let config = LoopClosureConfig {
        nullify: true,
        nullify_threshold: 0.5 * PI,
        ..Default::default()
    };
    let inputs = inputs_of(&store);
    let first = run(&mut store, &inputs, &config).unwrap();
    assert_eq!(first.nullification.unwrap().rewritten.len(), 3);
    assert!(store.current(&edge(0, 2)).unwrap()[[1, 2]].is_nan());

    // with AC removed the only loop is gone
    let inputs = RunInputs {
        edges: store.edges(),
        manual: [edge(0, 2)].into_iter().collect(),
        ..Default::default()
    };
    let second = run(&mut store, &inputs, &config).unwrap();
    let null = second.nullification.unwrap();
    assert_eq!(null.rewritten.len(), 3);
    assert_eq!(null.n_pixels_removed, 0);
    for (i, j) in [(0, 1), (1, 2), (0, 2)] {
        let e = edge(i, j);
        assert_eq!(store.current(&e).unwrap(), store.original(&e).unwrap());
    }
}
