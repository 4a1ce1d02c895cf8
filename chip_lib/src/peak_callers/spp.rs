use super::{cross_correlation, PeakCallCore, PeakCaller};
use crate::cluster::argv;
use crate::context::PipelineContext;
use crate::peaks::non_empty;
use anyhow::{Context, Result};
use chip_types::{Algorithm, JobSpec, PeakCallerOpts, PipelineError, Sample};
use flate2::read::GzDecoder;
use log::info;
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// SPP (phantompeakqualtools) on the first treatment against the first
/// control. The ranked result is the uncompressed regionPeak file.
#[derive(Debug)]
pub struct Spp {
    core: PeakCallCore,
}

fn part_name(sample: &Sample) -> String {
    sample
        .bam
        .as_ref()
        .and_then(|b| b.path.file_stem())
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| sample.safe_name().to_string())
}

/// Decompress `gz` next to itself and remove the compressed file.
fn gunzip(gz: &Path, dest: &Path) -> Result<()> {
    let mut decoder = GzDecoder::new(File::open(gz).with_context(|| format!("opening {}", gz.display()))?);
    let tmp = dest.with_extension("tmp");
    let mut out = File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
    io::copy(&mut decoder, &mut out).with_context(|| format!("decompressing {}", gz.display()))?;
    fs::rename(&tmp, dest)?;
    fs::remove_file(gz)?;
    Ok(())
}

impl Spp {
    pub fn new(
        name: &str,
        treatments: Vec<Arc<Sample>>,
        controls: Vec<Arc<Sample>>,
        opts: PeakCallerOpts,
    ) -> Result<Self> {
        if treatments.is_empty() || controls.is_empty() {
            return Err(PipelineError::Precondition(format!(
                "spp peak caller {name} needs a treatment and a control"
            ))
            .into());
        }
        Ok(Spp {
            core: PeakCallCore::new(name, treatments, controls, opts),
        })
    }

    fn region_peak_path(&self, out_dir: &Path) -> PathBuf {
        let t = &self.core.treatments()[0];
        let c = &self.core.controls()[0];
        out_dir.join(format!("{}_VS_{}.regionPeak", part_name(t), part_name(c)))
    }

    fn run_spp(&self, out_dir: &Path, ctx: &PipelineContext) -> Result<()> {
        let treatment = self.core.first_treatment()?.ready_bam()?;
        let control = self.core.first_control()?.ready_bam()?;
        let script = if treatment.dupes_removed {
            "run_spp_nodups.R"
        } else {
            "run_spp.R"
        };
        let mut cmd = argv![
            script,
            format!("-c={}", treatment.path.display()),
            format!("-i={}", control.path.display()),
            "-odir=.",
            "-savr",
            "-savp",
            "-rf",
        ];
        cmd.extend(self.core.opts.args.iter().cloned());
        let job = JobSpec::named(format!("spp_{}", self.core.safe_name()))
            .memory(4, 8)
            .in_dir(out_dir);
        ctx.run(&job, &cmd)
            .with_context(|| format!("Failed to execute spp for {self}"))
    }
}

impl fmt::Display for Spp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.core, f)
    }
}

impl PeakCaller for Spp {
    fn core(&self) -> &PeakCallCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PeakCallCore {
        &mut self.core
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::Spp
    }

    fn score_column(&self) -> usize {
        7
    }

    fn already_called(&self, out_dir: &Path, _ctx: &PipelineContext) -> bool {
        non_empty(&self.region_peak_path(out_dir))
    }

    fn find_peaks(&mut self, out_dir: &Path, ctx: &PipelineContext) -> Result<bool> {
        let inputs = [
            self.core.treatments()[0].clone(),
            self.core.controls()[0].clone(),
        ];
        if !self.core.require_ready(&inputs) {
            return Ok(false);
        }
        let region = self.region_peak_path(out_dir);
        if self.already_called(out_dir, ctx) {
            info!("{self}: reusing peaks in {}", out_dir.display());
        } else {
            info!("Calling peaks for {self}");
            self.run_spp(out_dir, ctx)?;
            let mut gz = region.clone().into_os_string();
            gz.push(".gz");
            gunzip(Path::new(&gz), &region)
                .with_context(|| format!("Failed to uncompress region peaks for {self}"))?;
            let bam = inputs[0].ready_bam()?.path.clone();
            cross_correlation(&mut self.core, &bam, out_dir, ctx)?;
        }
        self.core.set_results(vec![region])?;
        Ok(true)
    }
}
