use super::{PeakCallCore, PeakCaller};
use crate::cluster::argv;
use crate::context::PipelineContext;
use crate::peaks::non_empty;
use anyhow::{Context, Result};
use chip_types::{Algorithm, JobSpec, PeakCallerOpts, PipelineError, Sample};
use log::{info, warn};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const CONTROL_BDG: &str = "_control_lambda.bdg";
const MODEL_R: &str = "_model.r";
const MODEL_PDF: &str = "_model.pdf";
const PEAK_BED: &str = "_peaks.bed";
const ENCODE_PEAK: &str = "_peaks.encodePeak";
const PEAK_XLS: &str = "_peaks.xls";
const SUMMIT_BED: &str = "_summits.bed";
const PILEUP: &str = "_treat_pileup.bdg";
const PEAK_VS_GENE: &str = "_peak_vs_gene.xls";

/// Secondary outputs recorded when present, by kind.
const SECONDARY: [(&str, &str); 6] = [
    ("control_bdg", CONTROL_BDG),
    ("peak_bed", PEAK_BED),
    ("peak_xls", PEAK_XLS),
    ("summit_bed", SUMMIT_BED),
    ("pileup", PILEUP),
    ("model_pdf", MODEL_PDF),
];

/// MACS2 on the first treatment against the first control. The ranked
/// result is the encodePeak file, scored by its p-value column.
#[derive(Debug)]
pub struct Macs {
    core: PeakCallCore,
}

impl Macs {
    pub fn new(
        name: &str,
        treatments: Vec<Arc<Sample>>,
        controls: Vec<Arc<Sample>>,
        opts: PeakCallerOpts,
    ) -> Result<Self> {
        if treatments.is_empty() || controls.is_empty() {
            return Err(PipelineError::Precondition(format!(
                "macs peak caller {name} needs a treatment and a control"
            ))
            .into());
        }
        Ok(Macs {
            core: PeakCallCore::new(name, treatments, controls, opts),
        })
    }

    fn output(&self, out_dir: &Path, suffix: &str) -> PathBuf {
        out_dir.join(format!("{}{suffix}", self.core.safe_name()))
    }

    fn run_macs(&self, out_dir: &Path, ctx: &PipelineContext) -> Result<()> {
        let treatment = self.core.first_treatment()?.ready_bam()?;
        let control = self.core.first_control()?.ready_bam()?;
        let fragment_size = treatment
            .fragment_size
            .unwrap_or(ctx.settings().default_fragment_size);
        let mut cmd = argv![
            "macs2",
            "callpeak",
            "--bdg",
            "-f",
            "BAM",
            "-t",
            treatment.path,
            "-c",
            control.path,
            "-n",
            self.core.safe_name(),
            "--outdir",
            out_dir,
        ];
        if fragment_size > 0 {
            cmd.extend(argv!["--bw", fragment_size]);
        }
        cmd.extend(self.core.opts.args.iter().cloned());
        let job = JobSpec::named(self.core.safe_name())
            .memory(4, 8)
            .in_dir(out_dir);
        ctx.run(&job, &cmd)
            .with_context(|| format!("Failed to execute macs for {self}"))
    }

    /// Render the fragment model to PDF, when MACS built one.
    fn model_to_pdf(&mut self, out_dir: &Path, ctx: &PipelineContext) -> Result<()> {
        let script = self.output(out_dir, MODEL_R);
        if !script.is_file() {
            return Ok(());
        }
        let job = JobSpec::named(format!("r_{}", self.core.safe_name()))
            .memory(2, 4)
            .in_dir(out_dir);
        ctx.run(&job, &argv!["Rscript", script])
            .with_context(|| format!("Failed to make pdf of macs for {self}"))?;
        fs::remove_file(&script)?;
        Ok(())
    }

    /// Peak names carry the run name as a prefix; drop it on data rows.
    fn strip_name_prefix(&self, out_dir: &Path) -> Result<()> {
        let prefix = format!("{}_", self.core.safe_name());
        for suffix in [PEAK_BED, ENCODE_PEAK, PEAK_XLS, SUMMIT_BED] {
            let path = self.output(out_dir, suffix);
            if !path.is_file() {
                continue;
            }
            let text = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let mut stripped = String::with_capacity(text.len());
            for line in text.lines() {
                if line.starts_with("chr") {
                    stripped.push_str(&line.replacen(&prefix, "", 1));
                } else {
                    stripped.push_str(line);
                }
                stripped.push('\n');
            }
            fs::write(&path, stripped).with_context(|| format!("writing {}", path.display()))?;
        }
        Ok(())
    }

    fn add_track_header(&self, path: &Path, ctx: &PipelineContext) -> Result<()> {
        if !path.is_file() {
            return Ok(());
        }
        let text = fs::read_to_string(path)?;
        if text.starts_with("track") {
            return Ok(());
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let header = format!(
            "track name=\"{name}\" description=\"{name}\" visibility=full color=\"{}\"\n",
            ctx.random_color()
        );
        fs::write(path, header + &text).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    fn find_genes_near_peaks(&mut self, out_dir: &Path, ctx: &PipelineContext) -> Result<()> {
        let Some(refflat) = &ctx.settings().ucsc_refflat_path else {
            return Ok(());
        };
        let output = self.output(out_dir, PEAK_VS_GENE);
        let cmd = argv![
            "find_nearby_genes.pl",
            self.output(out_dir, ENCODE_PEAK),
            refflat,
            output,
            ctx.settings().gene_peak_neighbor_distance,
            "1,2,3,8",
        ];
        let job = JobSpec::named(format!("findgenes_{}", self.core.safe_name())).memory(1, 1);
        match ctx.run(&job, &cmd) {
            Ok(()) => self.core.set_output("peak_vs_gene", output),
            Err(e) => warn!("Failed to find genes near peaks for {self}: {e:#}"),
        }
        Ok(())
    }

    fn populate(&mut self, out_dir: &Path) -> Result<()> {
        for (kind, suffix) in SECONDARY {
            let path = self.output(out_dir, suffix);
            if path.is_file() {
                self.core.set_output(kind, path);
            }
        }
        let ranked = self.output(out_dir, ENCODE_PEAK);
        self.core.set_results(vec![ranked])
    }
}

impl fmt::Display for Macs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.core, f)
    }
}

impl PeakCaller for Macs {
    fn core(&self) -> &PeakCallCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PeakCallCore {
        &mut self.core
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::Macs
    }

    fn score_column(&self) -> usize {
        8
    }

    fn already_called(&self, out_dir: &Path, _ctx: &PipelineContext) -> bool {
        non_empty(&self.output(out_dir, ENCODE_PEAK))
    }

    fn find_peaks(&mut self, out_dir: &Path, ctx: &PipelineContext) -> Result<bool> {
        let inputs = [
            self.core.treatments()[0].clone(),
            self.core.controls()[0].clone(),
        ];
        if !self.core.require_ready(&inputs) {
            return Ok(false);
        }
        if self.already_called(out_dir, ctx) {
            info!("{self}: reusing peaks in {}", out_dir.display());
        } else {
            info!("Calling peaks for {self}");
            self.run_macs(out_dir, ctx)?;
            self.model_to_pdf(out_dir, ctx)?;
            self.strip_name_prefix(out_dir)?;
            self.add_track_header(&self.output(out_dir, PEAK_BED), ctx)?;
            self.find_genes_near_peaks(out_dir, ctx)?;
        }
        self.populate(out_dir)?;
        Ok(true)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::testing::{arg_after, RecordingRunner};
    use chip_types::{Bam, Settings};
    use pretty_assertions::assert_eq;

    /// Fake `macs2 callpeak`: writes an encodePeak with `peaks` rows and a
    /// peak BED named like the real tool does.
    pub(crate) fn fake_macs(argv: &[String], peaks: usize) -> Result<()> {
        let (Some(name), Some(dir)) = (arg_after(argv, "-n"), arg_after(argv, "--outdir")) else {
            return Ok(());
        };
        let dir = Path::new(dir);
        let mut encode = String::new();
        let mut bed = String::new();
        for i in 0..peaks {
            let start = 1000 * (i + 1);
            encode.push_str(&format!(
                "chr1\t{start}\t{}\t{name}_peak_{i}\t0\t.\t5.0\t{}\t-1\t50\n",
                start + 200,
                100 - i
            ));
            bed.push_str(&format!("chr1\t{start}\t{}\t{name}_peak_{i}\t{}\n", start + 200, 100 - i));
        }
        fs::write(dir.join(format!("{name}{ENCODE_PEAK}")), encode)?;
        fs::write(dir.join(format!("{name}{PEAK_BED}")), bed)?;
        Ok(())
    }

    fn ready(dir: &Path, name: &str) -> Result<Arc<Sample>> {
        let path = dir.join(format!("{name}.bam"));
        fs::write(&path, b"bam")?;
        let mut bam = Bam::new(path, false);
        bam.fragment_size = Some(180);
        Ok(Arc::new(Sample::synthetic(name, bam)))
    }

    #[test]
    fn calls_and_post_processes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = Arc::new(RecordingRunner::with_handler(|_, argv| {
            if argv[0] == "macs2" {
                fake_macs(argv, 3)?;
            }
            Ok(())
        }));
        let ctx = PipelineContext::new(Settings::new("/ref.fa", dir.path()), runner.clone())?;
        let mut macs = Macs::new(
            "macs",
            vec![ready(dir.path(), "rep1")?],
            vec![ready(dir.path(), "input")?],
            PeakCallerOpts::default(),
        )?;
        let out = dir.path().join("peaks");
        fs::create_dir_all(&out)?;
        assert!(macs.find_peaks(&out, &ctx)?);

        let calls = runner.calls_to("macs2");
        assert_eq!(calls.len(), 1);
        assert_eq!(arg_after(&calls[0], "--bw"), Some("180"));
        assert_eq!(macs.num_peaks(), vec![3]);
        assert_eq!(macs.peak_path(), vec![out.join("macs_rep1_vs_input_peaks.encodePeak")]);

        let bed = fs::read_to_string(out.join("macs_rep1_vs_input_peaks.bed"))?;
        assert!(bed.starts_with("track name=\"macs_rep1_vs_input_peaks.bed\""));
        assert!(bed.contains("\tpeak_0\t"));
        assert!(macs.outputs().contains_key("peak_bed"));
        Ok(())
    }

    #[test]
    fn existing_results_are_not_recomputed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = Arc::new(RecordingRunner::with_handler(|_, argv| {
            if argv[0] == "macs2" {
                fake_macs(argv, 4)?;
            }
            Ok(())
        }));
        let ctx = PipelineContext::new(Settings::new("/ref.fa", dir.path()), runner.clone())?;
        let t = ready(dir.path(), "rep1")?;
        let c = ready(dir.path(), "input")?;
        let mut first = Macs::new("macs", vec![t.clone()], vec![c.clone()], PeakCallerOpts::default())?;
        assert!(first.find_peaks(dir.path(), &ctx)?);

        let mut second = Macs::new("macs", vec![t], vec![c], PeakCallerOpts::default())?;
        assert!(second.already_called(dir.path(), &ctx));
        assert!(second.find_peaks(dir.path(), &ctx)?);
        assert_eq!(runner.calls_to("macs2").len(), 1);
        assert_eq!(second.peak_path(), first.peak_path());
        assert_eq!(second.num_peaks(), first.num_peaks());
        Ok(())
    }

    #[test]
    fn missing_input_refuses_to_run() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = Arc::new(RecordingRunner::new());
        let ctx = PipelineContext::new(Settings::new("/ref.fa", dir.path()), runner.clone())?;
        let gone = Arc::new(Sample::synthetic("input", Bam::new(dir.path().join("no.bam"), false)));
        let mut macs = Macs::new("macs", vec![ready(dir.path(), "rep1")?], vec![gone], PeakCallerOpts::default())?;
        assert!(!macs.find_peaks(dir.path(), &ctx)?);
        assert!(macs.error().contains("input is not ready"));
        assert!(runner.calls().is_empty());
        Ok(())
    }
}
