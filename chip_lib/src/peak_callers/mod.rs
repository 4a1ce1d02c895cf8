//! Peak-calling strategies.
//!
//! Every strategy shares [`PeakCallCore`]: identity, inputs, options and the
//! populated results. Strategies differ in the tool they run, the inputs they
//! require and the post-processing of the tool's output.

use crate::cluster::argv;
use crate::context::PipelineContext;
use crate::peaks::{count_peaks, trim_peak_file};
use anyhow::{ensure, Result};
use chip_types::{make_safe_name, Algorithm, Checkpointable, JobSpec, PeakCallerOpts, Sample};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

mod fseq;
mod idr;
pub(crate) mod macs;
mod macs_merged;
mod spp;

pub use fseq::Fseq;
pub use idr::{IdrCategory, Reproducibility};
pub use macs::Macs;
pub use macs_merged::MacsMerged;
pub use spp::Spp;

/// Results of a strategy as saved in its checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeakCallState {
    /// Ranked result files.
    pub peak_paths: Vec<PathBuf>,
    /// Peak count of each result file, same order as `peak_paths`.
    pub num_peaks: Vec<u64>,
    /// Secondary outputs by kind, e.g. `summits` or `cross_correlation`.
    pub outputs: BTreeMap<String, PathBuf>,
}

/// Identity, inputs and results shared by all strategies.
#[derive(Debug)]
pub struct PeakCallCore {
    name: String,
    safe_name: OnceLock<String>,
    treatments: Vec<Arc<Sample>>,
    controls: Vec<Arc<Sample>>,
    pub opts: PeakCallerOpts,
    state: PeakCallState,
    errors: Vec<String>,
}

impl PeakCallCore {
    pub fn new(
        name: impl Into<String>,
        treatments: Vec<Arc<Sample>>,
        controls: Vec<Arc<Sample>>,
        opts: PeakCallerOpts,
    ) -> Self {
        PeakCallCore {
            name: name.into(),
            safe_name: OnceLock::new(),
            treatments,
            controls,
            opts,
            state: PeakCallState::default(),
            errors: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn treatments(&self) -> &[Arc<Sample>] {
        &self.treatments
    }

    pub fn controls(&self) -> &[Arc<Sample>] {
        &self.controls
    }

    /// Label of the treatment side: the configured name or the first treatment.
    pub fn treatments_label(&self) -> String {
        self.opts
            .treatment_name
            .as_deref()
            .map(make_safe_name)
            .or_else(|| self.treatments.first().map(|s| s.safe_name().to_string()))
            .unwrap_or_default()
    }

    /// Label of the control side, empty without controls.
    pub fn controls_label(&self) -> String {
        self.opts
            .control_name
            .as_deref()
            .map(make_safe_name)
            .or_else(|| self.controls.first().map(|s| s.safe_name().to_string()))
            .unwrap_or_default()
    }

    /// `<name>_<treatments>_vs_<controls>`, fixed after the first call.
    pub fn safe_name(&self) -> &str {
        self.safe_name.get_or_init(|| {
            let controls = self.controls_label();
            let mut s = format!("{}_{}", self.name, self.treatments_label());
            if !controls.is_empty() {
                s.push_str("_vs_");
                s.push_str(&controls);
            }
            make_safe_name(&s)
        })
    }

    /// Treatment alignment used by single-input tools.
    pub fn first_treatment(&self) -> Result<&Sample> {
        match self.treatments.first() {
            Some(s) => Ok(s.as_ref()),
            None => anyhow::bail!("{} has no treatment", self.name),
        }
    }

    pub fn first_control(&self) -> Result<&Sample> {
        match self.controls.first() {
            Some(s) => Ok(s.as_ref()),
            None => anyhow::bail!("{} has no control", self.name),
        }
    }

    /// Record an error and report the strategy as failed.
    pub fn fail(&mut self, msg: impl Into<String>) -> bool {
        let msg = msg.into();
        warn!("{msg}");
        self.errors.push(msg);
        false
    }

    /// Check that every listed sample has its alignment on disk, recording
    /// an error for the first one that does not.
    pub fn require_ready(&mut self, samples: &[Arc<Sample>]) -> bool {
        for s in samples {
            if let Err(e) = sample_ready(s) {
                return self.fail(e.to_string());
            }
        }
        true
    }

    /// Populate the ranked results; counts are taken from the files.
    pub fn set_results(&mut self, peak_paths: Vec<PathBuf>) -> Result<()> {
        let num_peaks = peak_paths
            .iter()
            .map(|p| count_peaks(p))
            .collect::<Result<Vec<_>>>()?;
        self.state.peak_paths = peak_paths;
        self.state.num_peaks = num_peaks;
        Ok(())
    }

    /// Populate results whose counts are already known.
    pub fn set_counted_results(&mut self, peak_paths: Vec<PathBuf>, num_peaks: Vec<u64>) -> Result<()> {
        ensure!(
            peak_paths.len() == num_peaks.len(),
            "{}: {} result files but {} counts",
            self.name,
            peak_paths.len(),
            num_peaks.len()
        );
        self.state.peak_paths = peak_paths;
        self.state.num_peaks = num_peaks;
        Ok(())
    }

    pub fn set_output(&mut self, kind: &str, path: PathBuf) {
        self.state.outputs.insert(kind.to_string(), path);
    }

    pub fn output(&self, kind: &str) -> Option<&Path> {
        self.state.outputs.get(kind).map(PathBuf::as_path)
    }
}

impl fmt::Display for PeakCallCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {}", self.name, self.treatments_label())?;
        let controls = self.controls_label();
        if !controls.is_empty() {
            write!(f, " vs {controls}")?;
        }
        Ok(())
    }
}

/// Precondition shared by all strategies: the sample's alignment exists.
pub fn sample_ready(sample: &Sample) -> Result<(), chip_types::PipelineError> {
    sample.ready_bam().map(|_| ())
}

/// A pluggable peak-finding tool.
pub trait PeakCaller: fmt::Display + Send + Sync {
    fn core(&self) -> &PeakCallCore;
    fn core_mut(&mut self) -> &mut PeakCallCore;
    fn algorithm(&self) -> Algorithm;

    /// 1-based column of the ranked result files holding the peak score.
    fn score_column(&self) -> usize;

    /// Run the tool into `out_dir`. `Ok(false)` means the strategy refused to
    /// run or a step failed; the reason is available from [`PeakCaller::error`].
    fn find_peaks(&mut self, out_dir: &Path, ctx: &PipelineContext) -> Result<bool>;

    /// True if a previous run left complete, non-empty results in `out_dir`.
    fn already_called(&self, _out_dir: &Path, _ctx: &PipelineContext) -> bool {
        false
    }

    fn name(&self) -> &str {
        self.core().name()
    }

    fn safe_name(&self) -> &str {
        self.core().safe_name()
    }

    fn treatments(&self) -> &[Arc<Sample>] {
        self.core().treatments()
    }

    fn controls(&self) -> &[Arc<Sample>] {
        self.core().controls()
    }

    fn peak_path(&self) -> Vec<PathBuf> {
        self.core().state.peak_paths.clone()
    }

    fn num_peaks(&self) -> Vec<u64> {
        self.core().state.num_peaks.clone()
    }

    /// Every recorded error, one per line; empty if there were none.
    fn error(&self) -> String {
        self.core().errors.join("\n")
    }

    /// Secondary outputs by kind.
    fn outputs(&self) -> &BTreeMap<String, PathBuf> {
        &self.core().state.outputs
    }

    /// Keep only the `limit` best peaks of every ranked result; 0 keeps all.
    fn trim_peaks(&mut self, limit: usize) -> Result<()> {
        if limit == 0 {
            return Ok(());
        }
        let column = self.score_column();
        let core = self.core_mut();
        let mut counts = Vec::with_capacity(core.state.peak_paths.len());
        for path in &core.state.peak_paths {
            counts.push(trim_peak_file(path, column, limit)?);
        }
        core.state.num_peaks = counts;
        Ok(())
    }
}

impl Checkpointable for dyn PeakCaller {
    type State = PeakCallState;

    fn snapshot(&self) -> PeakCallState {
        self.core().state.clone()
    }

    /// Paths and counts are restored together.
    fn restore(&mut self, state: PeakCallState) {
        let core = self.core_mut();
        if state.peak_paths.len() == state.num_peaks.len() && !state.peak_paths.is_empty() {
            core.state.peak_paths = state.peak_paths;
            core.state.num_peaks = state.num_peaks;
        }
        core.state.outputs.extend(state.outputs);
    }
}

/// Build a strategy for `algorithm`. Preconditions that can be checked
/// without touching the filesystem fail here, before any work starts.
pub fn create_peak_caller(
    algorithm: Algorithm,
    name: &str,
    treatments: Vec<Arc<Sample>>,
    controls: Vec<Arc<Sample>>,
    opts: PeakCallerOpts,
) -> Result<Box<dyn PeakCaller>> {
    let caller: Box<dyn PeakCaller> = match algorithm {
        Algorithm::Macs => Box::new(Macs::new(name, treatments, controls, opts)?),
        Algorithm::MacsMerged => Box::new(MacsMerged::new(name, treatments, controls, opts)?),
        Algorithm::Spp => Box::new(Spp::new(name, treatments, controls, opts)?),
        Algorithm::Fseq => Box::new(Fseq::new(name, treatments, controls, opts)?),
        Algorithm::MacsIdr | Algorithm::SppIdr | Algorithm::FseqIdr => {
            Box::new(Reproducibility::new(algorithm, name, treatments, controls, opts)?)
        }
    };
    Ok(caller)
}

/// Phantom-peak cross-correlation QC of one alignment. The plot and the
/// statistics table are recorded as outputs of `core`.
pub(crate) fn cross_correlation(
    core: &mut PeakCallCore,
    bam: &Path,
    out_dir: &Path,
    ctx: &PipelineContext,
) -> Result<()> {
    let base = format!("{}_cross_correlation", core.safe_name());
    let plot = out_dir.join(format!("{base}.pdf"));
    let stats = out_dir.join(format!("{base}.txt"));
    let cmd = argv![
        "run_spp.R",
        format!("-c={}", bam.display()),
        format!("-savp={}", plot.display()),
        format!("-out={}", stats.display()),
        format!("-odir={}", out_dir.display()),
    ];
    let job = JobSpec::named(format!("xcor_{}", core.safe_name()))
        .memory(4, 8)
        .in_dir(out_dir);
    ctx.run(&job, &cmd)?;
    info!("cross-correlation for {core} in {}", stats.display());
    core.set_output("cross_correlation_plot", plot);
    core.set_output("cross_correlation", stats);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chip_types::{Bam, PipelineError};

    fn sample(name: &str) -> Arc<Sample> {
        Arc::new(Sample::synthetic(name, Bam::new(format!("/nonexistent/{name}.bam"), false)))
    }

    #[test]
    fn registry_checks_replicates() {
        let opts = PeakCallerOpts::default();
        let err = create_peak_caller(
            Algorithm::MacsIdr,
            "h3",
            vec![sample("rep1")],
            vec![sample("input")],
            opts.clone(),
        )
        .err()
        .unwrap();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Precondition(_))
        ));

        let caller = create_peak_caller(
            Algorithm::Fseq,
            "open chromatin",
            vec![sample("dnase 1")],
            vec![],
            opts,
        )
        .unwrap();
        assert_eq!(caller.algorithm(), Algorithm::Fseq);
        assert_eq!(caller.safe_name(), "open_chromatin_dnase_1");
        assert_eq!(caller.to_string(), "open chromatin of dnase_1");
    }

    #[test]
    fn naming_uses_configured_labels() {
        let mut opts = PeakCallerOpts::default();
        opts.treatment_name = Some("all reps".into());
        let core = PeakCallCore::new("macs", vec![sample("rep1")], vec![sample("in put")], opts);
        assert_eq!(core.safe_name(), "macs_all_reps_vs_in_put");
        assert_eq!(core.to_string(), "macs of all_reps vs in_put");
    }

    #[test]
    fn not_ready_input_is_recorded() {
        let mut core = PeakCallCore::new("x", vec![sample("a")], vec![], PeakCallerOpts::default());
        let treatments = core.treatments().to_vec();
        assert!(!core.require_ready(&treatments));
        assert!(core.errors[0].contains("not ready"));
    }

    #[test]
    fn counted_results_must_align() {
        let mut core = PeakCallCore::new("x", vec![sample("a")], vec![], PeakCallerOpts::default());
        assert!(core
            .set_counted_results(vec!["/a".into(), "/b".into()], vec![1])
            .is_err());
        core.set_counted_results(vec!["/a".into()], vec![3]).unwrap();
        assert_eq!(core.state.num_peaks, vec![3]);
    }
}
