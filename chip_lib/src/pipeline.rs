//! The analysis driver: per-sample stages, peak calling, SPOT scores and
//! the final report, each stage a fan-out that has to succeed completely
//! before the next one starts.

use crate::context::PipelineContext;
use crate::peak_callers::{create_peak_caller, PeakCaller};
use crate::report::write_report;
use crate::stages::{prepare_bam, run_fastqc, spotters_for, Spotter};
use crate::visual::visualize;
use anyhow::{bail, Context, Result};
use chip_types::{checkpointed, Configuration, Sample};
use log::{error, info};
use par_proc::ErrorSink;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const LOGS_DIR: &str = "logs";
pub const FASTQC_DIR: &str = "00_fastqc";
pub const ALIGNMENT_DIR: &str = "01_alignment";
pub const VISUALIZATION_DIR: &str = "02_visualization";
pub const PEAKS_DIR: &str = "03_peaks";
pub const SPOT_DIR: &str = "04_spot";

pub const REPORT_FILE: &str = "report.md";

/// What a run produced, and every error it ran into.
pub struct AnalysisOutcome {
    pub samples: Vec<Arc<Sample>>,
    pub peak_callers: Vec<Box<dyn PeakCaller>>,
    pub spotters: Vec<Spotter>,
    pub report: Option<PathBuf>,
    pub errors: Vec<String>,
}

impl AnalysisOutcome {
    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
    }

    fn halted(samples: Vec<Arc<Sample>>, errors: Vec<String>) -> Self {
        AnalysisOutcome {
            samples,
            peak_callers: Vec::new(),
            spotters: Vec::new(),
            report: None,
            errors,
        }
    }
}

/// Fan a checkpointed per-sample stage out over `samples`. Each sample works
/// in `<stage>/<safe_name>`. Returns the errors of the stage.
fn sample_stage<F>(ctx: &PipelineContext, stage: &str, samples: &mut [Sample], work: F) -> Vec<String>
where
    F: Fn(&mut Sample, &Path) -> Result<bool> + Sync,
{
    info!("starting stage {stage} for {} samples", samples.len());
    let root = ctx.stage_dir(stage);
    let sink = ErrorSink::new();
    let ok = ctx.fan_out(samples.iter_mut(), &sink, |sample| {
        let dir = root.join(sample.safe_name());
        checkpointed(sample, Some(&dir), |d, s| work(s, d))
    });
    let mut errors = sink.into_errors();
    if !ok && errors.is_empty() {
        errors.push(format!("stage {stage} failed"));
    }
    errors
}

/// Drives one analysis over the configured samples and peak callers.
pub struct ChipAnalysis {
    config: Configuration,
    ctx: PipelineContext,
}

impl ChipAnalysis {
    pub fn new(config: Configuration, ctx: PipelineContext) -> Self {
        ChipAnalysis { config, ctx }
    }

    fn setup_directories(&self) -> Result<()> {
        for dir in [LOGS_DIR, FASTQC_DIR, ALIGNMENT_DIR, VISUALIZATION_DIR, PEAKS_DIR, SPOT_DIR] {
            let path = self.ctx.stage_dir(dir);
            fs::create_dir_all(&path).with_context(|| format!("creating {}", path.display()))?;
        }
        Ok(())
    }

    /// Peak callers over the frozen samples, in configuration order.
    fn build_peak_callers(&self, samples: &[Arc<Sample>]) -> Result<Vec<Box<dyn PeakCaller>>> {
        let by_name: BTreeMap<&str, &Arc<Sample>> =
            samples.iter().map(|s| (s.name(), s)).collect();
        let lookup = |names: &[String]| -> Result<Vec<Arc<Sample>>> {
            names
                .iter()
                .map(|n| match by_name.get(n.as_str()) {
                    Some(s) => Ok(Arc::clone(s)),
                    None => bail!("unknown sample {n}"),
                })
                .collect()
        };
        self.config
            .peak_callers
            .iter()
            .map(|def| {
                create_peak_caller(
                    def.algorithm,
                    &def.name,
                    lookup(&def.treatments)?,
                    lookup(&def.controls)?,
                    def.opts.clone(),
                )
                .with_context(|| format!("setting up peak caller {}", def.name))
            })
            .collect()
    }

    /// Run the whole analysis. Configuration problems are returned as an
    /// error before any work starts; failures of individual units are
    /// collected in the outcome and stop the run at the end of their stage.
    pub fn run(&self) -> Result<AnalysisOutcome> {
        let settings = self.ctx.settings();
        self.config.validate()?;
        settings.validate_output_base()?;
        self.setup_directories()?;
        let ctx = &self.ctx;

        let mut samples = self.config.build_samples();
        if !settings.skip_fastqc {
            let errors = sample_stage(ctx, FASTQC_DIR, &mut samples, |s, d| run_fastqc(s, d, ctx));
            if !errors.is_empty() {
                return Ok(halt(FASTQC_DIR, samples, errors));
            }
        }
        let errors = sample_stage(ctx, ALIGNMENT_DIR, &mut samples, |s, d| prepare_bam(s, d, ctx));
        if !errors.is_empty() {
            return Ok(halt(ALIGNMENT_DIR, samples, errors));
        }
        if !settings.skip_visualization {
            let errors = sample_stage(ctx, VISUALIZATION_DIR, &mut samples, |s, d| visualize(s, d, ctx));
            if !errors.is_empty() {
                return Ok(halt(VISUALIZATION_DIR, samples, errors));
            }
        }

        let samples: Vec<Arc<Sample>> = samples.into_iter().map(Arc::new).collect();
        let mut callers = self.build_peak_callers(&samples)?;
        let peaks_root = ctx.stage_dir(PEAKS_DIR);
        let sink = ErrorSink::new();
        ctx.fan_out(callers.iter_mut(), &sink, |caller| {
            let dir = peaks_root.join(caller.safe_name());
            if checkpointed(&mut **caller, Some(&dir), |d, c| c.find_peaks(d, ctx))? {
                Ok(true)
            } else {
                bail!("{}", caller.error())
            }
        });
        let errors = sink.into_errors();
        if !errors.is_empty() {
            let mut outcome = halt(PEAKS_DIR, samples, errors);
            outcome.peak_callers = callers;
            return Ok(outcome);
        }

        let mut spotters = Vec::new();
        if settings.hotspot_config.is_some() {
            spotters = spotters_for(&callers);
            let spot_root = ctx.stage_dir(SPOT_DIR);
            let sink = ErrorSink::new();
            ctx.fan_out(spotters.iter_mut(), &sink, |s| s.calculate(&spot_root, ctx));
            let errors = sink.into_errors();
            if !errors.is_empty() {
                let mut outcome = halt(SPOT_DIR, samples, errors);
                outcome.peak_callers = callers;
                outcome.spotters = spotters;
                return Ok(outcome);
            }
        }

        let report = settings.output_base.join(REPORT_FILE);
        write_report(&report, &samples, &callers, &spotters)?;
        info!("report written to {}", report.display());
        Ok(AnalysisOutcome {
            samples,
            peak_callers: callers,
            spotters,
            report: Some(report),
            errors: Vec::new(),
        })
    }
}

fn halt<S: Into<Arc<Sample>>>(stage: &str, samples: Vec<S>, errors: Vec<String>) -> AnalysisOutcome {
    error!("stage {stage} failed with {} errors, stopping", errors.len());
    AnalysisOutcome::halted(samples.into_iter().map(Into::into).collect(), errors)
}
