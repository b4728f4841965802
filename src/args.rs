use std::f32::consts::PI;
use std::path::PathBuf;

use clap::Parser;

use loopclosure::attribution::NullifyPolicy;
use loopclosure::reference::RefArea;
use loopclosure::LoopClosureConfig;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "loopclosure",
    version,
    author = "Masanori AKIMOTO",
    about = "Identify bad unwrapped interferograms by loop closure and pick a stable reference area.",
    after_help = "This program is licensed under the MIT License
see https://opensource.org/license/mit"
)]
pub struct Args {
    /// Directory holding the yyyymmdd_yyyymmdd interferogram folders and slc.mli.par
    #[arg(short = 'd', long, aliases = ["ifg-dir", "ifgdir"])]
    pub ifgdir: PathBuf,

    /// Time-series output directory. Defaults to TS_<ifgdir> next to ifgdir.
    #[arg(short = 't', long, aliases = ["tsa-dir", "tsadir"])]
    pub tsadir: Option<PathBuf>,

    /// Loop RMS threshold in radians.
    #[arg(short = 'l', long = "loop-thre", default_value_t = 1.5)]
    pub loop_thre: f32,

    /// Also remove the fractional median bias of every loop.
    #[arg(long)]
    pub multi_prime: bool,

    /// Text file listing interferograms to remove manually.
    #[arg(long, value_name = "FILE")]
    pub rm_ifg_list: Option<PathBuf>,

    /// Number of worker threads (0 uses every CPU).
    #[arg(long, default_value_t = 0)]
    pub n_para: usize,

    /// Nullify unwrapped pixels with loop closure errors.
    #[arg(long)]
    pub nullify: bool,

    /// Loop phase in radians from which a pixel counts as an unwrapping error.
    #[arg(long, default_value_t = PI)]
    pub nullify_threshold: f32,

    /// When nullifying, keep a pixel only if every loop through it closes.
    #[arg(long)]
    pub treat_as_bad: bool,

    /// Do not keep the original .unw as .unw.ori before nullifying.
    #[arg(long)]
    pub nullify_skip_backup: bool,

    /// Reference area x1:x2/y1:y2 (overrides info/120ref.txt and the search).
    #[arg(long = "ref", value_name = "x1:x2/y1:y2")]
    pub reference: Option<RefArea>,

    /// Log level: error, warn, info, debug or trace.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Args {
    pub fn to_config(&self) -> LoopClosureConfig {
        LoopClosureConfig {
            loop_threshold: self.loop_thre,
            multi_prime: self.multi_prime,
            nullify: self.nullify,
            nullify_threshold: self.nullify_threshold,
            policy: if self.treat_as_bad {
                NullifyPolicy::Aggressive
            } else {
                NullifyPolicy::Gentle
            },
            save_original: !self.nullify_skip_backup,
            reference: self.reference,
            n_para: self.n_para,
            ..LoopClosureConfig::default()
        }
    }

    /// `TS_<name>` beside the interferogram directory unless given.
    pub fn resolved_tsadir(&self) -> PathBuf {
        if let Some(dir) = &self.tsadir {
            return dir.clone();
        }
        let name = self
            .ifgdir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "GEOCml".to_string());
        self.ifgdir
            .parent()
            .unwrap_or_else(|| std::path::Path::new("."))
            .join(format!("TS_{}", name))
    }
}
