use super::{cross_correlation, PeakCallCore, PeakCaller};
use crate::cluster::{argv, bash_script, shell_quote};
use crate::context::PipelineContext;
use crate::peaks::non_empty;
use anyhow::{Context, Result};
use chip_types::{Algorithm, JobSpec, PeakCallerOpts, PipelineError, Sample};
use log::info;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const TMP_BED_SUFFIX: &str = "-tmp.bed";
const NARROW_SUFFIX: &str = ".narrowPeak";

/// F-Seq density peaks of the first treatment; no control is used.
#[derive(Debug)]
pub struct Fseq {
    core: PeakCallCore,
}

impl Fseq {
    pub fn new(
        name: &str,
        treatments: Vec<Arc<Sample>>,
        controls: Vec<Arc<Sample>>,
        opts: PeakCallerOpts,
    ) -> Result<Self> {
        if treatments.is_empty() {
            return Err(PipelineError::Precondition(format!(
                "fseq peak caller {name} needs a treatment"
            ))
            .into());
        }
        Ok(Fseq {
            core: PeakCallCore::new(name, treatments, controls, opts),
        })
    }

    fn basename(&self) -> String {
        self.core.treatments()[0]
            .bam
            .as_ref()
            .and_then(|b| b.path.file_stem())
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.core.treatments()[0].safe_name().to_string())
    }

    fn narrow_peak_path(&self, out_dir: &Path) -> PathBuf {
        out_dir.join(format!("{}{NARROW_SUFFIX}", self.basename()))
    }

    fn cleanup(&self, out_dir: &Path) -> Result<()> {
        let base = self.basename();
        let per_chrom = out_dir.join(&base);
        if per_chrom.is_dir() {
            fs::remove_dir_all(&per_chrom)?;
        }
        let bed = out_dir.join(format!("{base}{TMP_BED_SUFFIX}"));
        if bed.exists() {
            fs::remove_file(&bed)?;
        }
        Ok(())
    }

    fn run_fseq(&self, bam: &Path, out_dir: &Path, ctx: &PipelineContext) -> Result<PathBuf> {
        let base = self.basename();
        let bed = out_dir.join(format!("{base}{TMP_BED_SUFFIX}"));
        self.cleanup(out_dir)?;

        let job = JobSpec::named(format!("bam2bed_{}", self.core.safe_name()))
            .memory(4, 8)
            .in_dir(out_dir);
        let script = format!("bamToBed -i {} > {}", shell_quote(bam), shell_quote(&bed));
        ctx.run(&job, &bash_script(script))
            .with_context(|| format!("Failed to convert bam to bed for {self}"))?;

        let per_chrom = out_dir.join(&base);
        fs::create_dir_all(&per_chrom)?;
        let mut cmd = argv!["fseq", bed, "-of", "npf", "-o", per_chrom];
        cmd.extend(self.core.opts.args.iter().cloned());
        let job = JobSpec::named(format!("fseq_{}", self.core.safe_name()))
            .memory(4, 32)
            .in_dir(out_dir);
        ctx.run(&job, &cmd)
            .with_context(|| format!("Failed to run fseq for {self}"))?;

        let narrow = self.narrow_peak_path(out_dir);
        merge_npf(&per_chrom, &narrow)
            .with_context(|| format!("Failed to merge fseq results for {self}"))?;
        self.cleanup(out_dir)?;
        Ok(narrow)
    }
}

/// Concatenate the per-chromosome `.npf` files of `dir`, in name order.
fn merge_npf(dir: &Path, dest: &Path) -> Result<()> {
    let mut parts: Vec<PathBuf> = fs::read_dir(dir)?
        .map(|e| e.map(|e| e.path()))
        .collect::<io::Result<_>>()?;
    parts.retain(|p| p.extension().is_some_and(|e| e == "npf"));
    parts.sort();
    let mut out = BufWriter::new(File::create(dest)?);
    for p in parts {
        io::copy(&mut File::open(&p)?, &mut out)?;
    }
    Ok(())
}

impl fmt::Display for Fseq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.core, f)
    }
}

impl PeakCaller for Fseq {
    fn core(&self) -> &PeakCallCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PeakCallCore {
        &mut self.core
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::Fseq
    }

    fn score_column(&self) -> usize {
        7
    }

    fn already_called(&self, out_dir: &Path, _ctx: &PipelineContext) -> bool {
        non_empty(&self.narrow_peak_path(out_dir))
    }

    fn find_peaks(&mut self, out_dir: &Path, ctx: &PipelineContext) -> Result<bool> {
        let treatments = self.core.treatments().to_vec();
        if !self.core.require_ready(&treatments) {
            return Ok(false);
        }
        let narrow = if self.already_called(out_dir, ctx) {
            info!("{self}: reusing peaks in {}", out_dir.display());
            self.narrow_peak_path(out_dir)
        } else {
            info!("Calling peaks for {self}");
            let bam = treatments[0].ready_bam()?.path.clone();
            let narrow = self.run_fseq(&bam, out_dir, ctx)?;
            cross_correlation(&mut self.core, &bam, out_dir, ctx)?;
            narrow
        };
        self.core.set_results(vec![narrow])?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn npf_parts_are_concatenated_in_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let parts = dir.path().join("rep1");
        fs::create_dir_all(&parts)?;
        fs::write(parts.join("chr2.npf"), "chr2\t1\t2\n")?;
        fs::write(parts.join("chr1.npf"), "chr1\t1\t2\n")?;
        fs::write(parts.join("notes.txt"), "ignored\n")?;
        let dest = dir.path().join("rep1.narrowPeak");
        merge_npf(&parts, &dest)?;
        assert_eq!(fs::read_to_string(&dest)?, "chr1\t1\t2\nchr2\t1\t2\n");
        Ok(())
    }
}
