//! Irreproducible Discovery Rate analysis over replicate peak calls.
//!
//! The engine pools the replicates, builds pseudo-replicates by splitting
//! alignments in two, calls peaks on every original, pseudo-replicate and
//! pooled input with a base strategy, compares the calls pairwise with the
//! IDR script and keeps as many of the pooled peaks as were reproducible.

use super::{Fseq, Macs, PeakCallCore, PeakCaller, Spp};
use crate::cluster::argv;
use crate::context::PipelineContext;
use crate::peaks::{count_passing, select_top_peaks};
use crate::pipeline::VISUALIZATION_DIR;
use crate::pool::pool_samples;
use crate::pseudo_replicate::make_pseudo_replicates;
use crate::visual::visualize_pooled;
use anyhow::{anyhow, bail, Context, Result};
use chip_types::{Algorithm, JobSpec, PeakCallerOpts, PipelineError, Sample};
use itertools::Itertools;
use log::{info, warn};
use par_proc::ErrorSink;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const PSEUDO_REPLICATES: usize = 2;
const INNER_NAME: &str = "idr";
const SUMMARY_FILE: &str = "idr_summary.txt";

/// Groups of pairwise comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IdrCategory {
    /// Every pair of original replicates.
    Original,
    /// The two halves of each replicate.
    SelfPseudoReplicates,
    /// The two halves of the pooled replicates.
    PooledPseudoReplicates,
}

impl IdrCategory {
    const ALL: [IdrCategory; 3] = [
        IdrCategory::Original,
        IdrCategory::SelfPseudoReplicates,
        IdrCategory::PooledPseudoReplicates,
    ];
}

impl fmt::Display for IdrCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IdrCategory::Original => "individual",
            IdrCategory::SelfPseudoReplicates => "self_pseudo_replicates",
            IdrCategory::PooledPseudoReplicates => "pooled_pseudo_replicates",
        })
    }
}

/// One pairing of two base callers, by index.
struct Comparison {
    category: IdrCategory,
    left: usize,
    right: usize,
    label: String,
    overlap: Option<PathBuf>,
    passing: u64,
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} comparison {}", self.category, self.label)
    }
}

/// A sample to split, with the seed of its split.
struct SplitJob {
    sample: Arc<Sample>,
    seed: u64,
}

impl fmt::Display for SplitJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pseudo-replication of {}", self.sample)
    }
}

/// The IDR protocol over a base strategy chosen by the algorithm.
#[derive(Debug)]
pub struct Reproducibility {
    algorithm: Algorithm,
    core: PeakCallCore,
}

impl Reproducibility {
    pub fn new(
        algorithm: Algorithm,
        name: &str,
        treatments: Vec<Arc<Sample>>,
        controls: Vec<Arc<Sample>>,
        opts: PeakCallerOpts,
    ) -> Result<Self> {
        if !algorithm.is_idr() {
            return Err(PipelineError::Precondition(format!(
                "{algorithm} is not a reproducibility algorithm"
            ))
            .into());
        }
        if treatments.len() < 2 {
            return Err(PipelineError::Precondition(format!(
                "Too few treatments (< 2) for {name}"
            ))
            .into());
        }
        if algorithm.needs_control() && controls.is_empty() {
            return Err(PipelineError::Precondition(format!("no control for {name}")).into());
        }
        Ok(Reproducibility {
            algorithm,
            core: PeakCallCore::new(name, treatments, controls, opts),
        })
    }

    /// Final peaks supported by the original replicates.
    pub fn conservative_peak_path(&self) -> Option<PathBuf> {
        self.peak_path().first().cloned()
    }

    /// Final peaks supported by the pooled pseudo-replicates.
    pub fn optimal_peak_path(&self) -> Option<PathBuf> {
        self.peak_path().get(1).cloned()
    }

    fn base_caller(&self, treatment: Arc<Sample>, control: Option<&Arc<Sample>>) -> Result<Box<dyn PeakCaller>> {
        let controls: Vec<Arc<Sample>> = control.into_iter().cloned().collect();
        let mut opts = self.core.opts.clone();
        opts.treatment_name = None;
        opts.control_name = None;
        let caller: Box<dyn PeakCaller> = match self.algorithm {
            Algorithm::MacsIdr => Box::new(Macs::new(INNER_NAME, vec![treatment], controls, opts)?),
            Algorithm::SppIdr => Box::new(Spp::new(INNER_NAME, vec![treatment], controls, opts)?),
            Algorithm::FseqIdr => Box::new(Fseq::new(INNER_NAME, vec![treatment], controls, opts)?),
            other => bail!("{other} has no base strategy"),
        };
        Ok(caller)
    }

    fn pool(&self, label: &str, samples: &[Arc<Sample>], out_dir: &Path, ctx: &PipelineContext) -> Result<Arc<Sample>> {
        let mut pooled = pool_samples(label, samples, &out_dir.join(label), ctx)?;
        visualize_pooled(
            self.core.name(),
            &mut pooled,
            &ctx.stage_dir(VISUALIZATION_DIR),
            ctx,
        )?;
        Ok(Arc::new(pooled))
    }

    /// Two halves of every job's sample, in job order. Any failed split fails
    /// the whole run.
    fn split_all(&mut self, jobs: Vec<SplitJob>, out_dir: &Path, ctx: &PipelineContext) -> Result<Vec<[Arc<Sample>; 2]>> {
        let order: Vec<String> = jobs.iter().map(|j| j.sample.safe_name().to_string()).collect();
        let made = Mutex::new(BTreeMap::new());
        let sink = ErrorSink::new();
        let ok = ctx.fan_out(jobs, &sink, |job| {
            let reps = make_pseudo_replicates(&job.sample, PSEUDO_REPLICATES, out_dir, job.seed)?;
            let [a, b]: [Sample; PSEUDO_REPLICATES] = reps
                .try_into()
                .map_err(|_| anyhow!("Failed to make pseudo replicates for {}", job.sample))?;
            made.lock()
                .map_err(|_| anyhow!("pseudo-replicate registry poisoned"))?
                .insert(job.sample.safe_name().to_string(), [Arc::new(a), Arc::new(b)]);
            Ok(true)
        });
        if !ok {
            let errors = sink.into_errors();
            for e in &errors {
                self.core.fail(e.clone());
            }
            bail!("pseudo-replication failed for {self}: {}", errors.join("; "));
        }
        let mut made = made.into_inner().map_err(|_| anyhow!("pseudo-replicate registry poisoned"))?;
        order
            .iter()
            .map(|name| made.remove(name).ok_or_else(|| anyhow!("no pseudo-replicates of {name}")))
            .collect()
    }

    /// Run the IDR script on one pairing. Empty sides skip the script; a
    /// failing script counts as no overlap.
    fn compare(
        &self,
        left: &dyn PeakCaller,
        right: &dyn PeakCaller,
        out_dir: &Path,
        ctx: &PipelineContext,
    ) -> Option<PathBuf> {
        let empty = |p: &dyn PeakCaller| p.num_peaks().first().copied().unwrap_or(0) == 0;
        if empty(left) || empty(right) {
            return None;
        }
        let (Some(lpeaks), Some(rpeaks)) = (left.peak_path().first().cloned(), right.peak_path().first().cloned()) else {
            return None;
        };
        let out = out_dir.join(format!("{}_AND_{}", left.safe_name(), right.safe_name()));
        let settings = ctx.settings();
        let mut cmd = argv!["Rscript", settings.idr_script, lpeaks, rpeaks, "-1", out];
        cmd.extend(self.core.opts.idr_args.iter().cloned());
        if let Some(table) = &settings.genome_table_path {
            cmd.push(format!("--genometable={}", table.display()));
        }
        let job_name = out
            .file_name()
            .map(|n| format!("idr_{}", n.to_string_lossy()))
            .unwrap_or_else(|| format!("idr_{}", self.core.safe_name()));
        let job = JobSpec::named(job_name).memory(2, 8).in_dir(out_dir);
        match ctx.run(&job, &cmd) {
            Ok(()) => Some(out),
            Err(e) => {
                let soft = PipelineError::SoftComparison(format!("{left} and {right}: {e:#}"));
                warn!("{soft}");
                None
            }
        }
    }

    fn passing(&self, overlap: &Path) -> u64 {
        let mut table = overlap.as_os_str().to_owned();
        table.push("-overlapped-peaks.txt");
        match count_passing(Path::new(&table), self.core.opts.idr_threshold) {
            Ok(n) => n,
            Err(e) => {
                warn!("{}", PipelineError::SoftComparison(format!("{e:#}")));
                0
            }
        }
    }

    fn plot(&self, comparisons: &[Comparison], out_dir: &Path, ctx: &PipelineContext) {
        let Some(script) = &ctx.settings().idr_plot_script else {
            return;
        };
        for category in IdrCategory::ALL {
            let passed: Vec<String> = comparisons
                .iter()
                .filter(|c| c.category == category)
                .filter_map(|c| c.overlap.as_ref())
                .filter_map(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .collect();
            if passed.is_empty() {
                continue;
            }
            let mut cmd = argv!["Rscript", script, passed.len(), format!("{category}_")];
            cmd.extend(passed);
            let job = JobSpec::named(format!("idr_plot_{category}_{}", self.core.safe_name()))
                .memory(2, 8)
                .in_dir(out_dir);
            if let Err(e) = ctx.run(&job, &cmd) {
                warn!("IDR plot of {category} for {self} failed: {e:#}");
            }
        }
    }

    fn write_summary(&self, comparisons: &[Comparison], conservative: u64, optimal: u64, path: &Path) -> Result<()> {
        let mut out = BufWriter::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        );
        writeln!(out, "type\tidr1_name\tidr1_peaks\tidr2_name\tidr2_peaks\tratio")?;
        for category in IdrCategory::ALL {
            let set: Vec<&Comparison> = comparisons.iter().filter(|c| c.category == category).collect();
            for (a, b) in set.iter().tuple_combinations() {
                writeln!(
                    out,
                    "{category}\t{}\t{}\t{}\t{}\t{}",
                    a.label,
                    a.passing,
                    b.label,
                    b.passing,
                    ratio(a.passing, b.passing)
                )?;
            }
            let counts: Vec<u64> = set.iter().map(|c| c.passing).collect();
            let non_zero: Vec<u64> = counts.iter().copied().filter(|&n| n > 0).collect();
            info!(
                "{category} had a max of {} peaks under the {} threshold from {}",
                counts.iter().max().copied().unwrap_or(0),
                self.core.opts.idr_threshold,
                non_zero.len()
            );
            if non_zero.len() != counts.len() {
                warn!(
                    "{category} had {} with 0 passing overlaps",
                    counts.len() - non_zero.len()
                );
            }
            for (&a, &b) in non_zero.iter().tuple_combinations() {
                if not_within_2x(a, b) {
                    warn!("{category} had some passing not within the 2x ({a}, {b})");
                }
            }
        }
        writeln!(
            out,
            "final\tconservative (max individuals)\t{conservative}\toptimal (max pooled pseudo)\t{optimal}\t{}",
            ratio(conservative, optimal)
        )?;
        out.flush()?;
        Ok(())
    }
}

fn ratio(a: u64, b: u64) -> String {
    if a == 0 || b == 0 {
        "0".to_string()
    } else {
        format!("{:.2}", a as f64 / b as f64)
    }
}

fn not_within_2x(a: u64, b: u64) -> bool {
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    hi > 2 * lo
}

/// Readable side of a pairing: the treatments of both callers.
fn pairing_label(left: &dyn PeakCaller, right: &dyn PeakCaller) -> String {
    format!(
        "{} overlapped {}",
        left.core().treatments_label(),
        right.core().treatments_label()
    )
}

impl fmt::Display for Reproducibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.core, f)
    }
}

impl PeakCaller for Reproducibility {
    fn core(&self) -> &PeakCallCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PeakCallCore {
        &mut self.core
    }

    fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    fn score_column(&self) -> usize {
        match self.algorithm {
            Algorithm::MacsIdr => 8,
            _ => 7,
        }
    }

    fn find_peaks(&mut self, out_dir: &Path, ctx: &PipelineContext) -> Result<bool> {
        let treatments = self.core.treatments().to_vec();
        let all: Vec<Arc<Sample>> = treatments.iter().chain(self.core.controls()).cloned().collect();
        if !self.core.require_ready(&all) {
            return Ok(false);
        }
        fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;

        // one pooled control for every call
        let control = if self.algorithm.needs_control() {
            Some(self.pool(&self.core.controls_label(), self.core.controls(), out_dir, ctx)?)
        } else {
            None
        };
        let treatment = self.pool(&self.core.treatments_label(), &treatments, out_dir, ctx)?;

        let seed = ctx.settings().pseudo_replicate_seed.unwrap_or_else(rand::random);
        let mut callers: Vec<Box<dyn PeakCaller>> = Vec::new();
        for t in &treatments {
            callers.push(self.base_caller(t.clone(), control.as_ref())?);
        }
        let originals = callers.len();
        let mut comparisons = Vec::new();
        for (left, right) in (0..originals).tuple_combinations() {
            comparisons.push((IdrCategory::Original, left, right));
        }

        let jobs = treatments
            .iter()
            .enumerate()
            .map(|(i, t)| SplitJob {
                sample: t.clone(),
                seed: seed.wrapping_add(i as u64 + 1),
            })
            .collect();
        let self_halves = self.split_all(jobs, out_dir, ctx)?;
        let pooled_halves = self.split_all(
            vec![SplitJob {
                sample: treatment.clone(),
                seed,
            }],
            out_dir,
            ctx,
        )?;
        let mut pseudo_bams = Vec::new();
        for (category, halves) in [
            (IdrCategory::SelfPseudoReplicates, &self_halves),
            (IdrCategory::PooledPseudoReplicates, &pooled_halves),
        ] {
            for [a, b] in halves {
                for half in [a, b] {
                    pseudo_bams.push(half.ready_bam()?.path.clone());
                    callers.push(self.base_caller(half.clone(), control.as_ref())?);
                }
                comparisons.push((category, callers.len() - 2, callers.len() - 1));
            }
        }
        callers.push(self.base_caller(treatment.clone(), control.as_ref())?);
        let merged = callers.len() - 1;

        let sink = ErrorSink::new();
        let ok = ctx.fan_out(callers.iter_mut(), &sink, |caller| {
            info!("Calling peaks for {caller}");
            if caller.find_peaks(out_dir, ctx)? {
                info!("{} peaks for {caller}", caller.num_peaks().first().copied().unwrap_or(0));
                Ok(true)
            } else {
                Err(anyhow!("{}", caller.error()))
            }
        });
        if !ok {
            for e in sink.into_errors() {
                self.core.fail(e);
            }
            return Ok(false);
        }
        for caller in callers.iter_mut().take(originals) {
            caller.trim_peaks(self.core.opts.individual_peaks_limit)?;
        }

        for bam in &pseudo_bams {
            if bam.exists() {
                fs::remove_file(bam).with_context(|| format!("removing {}", bam.display()))?;
            }
        }

        let mut comparisons: Vec<Comparison> = comparisons
            .into_iter()
            .map(|(category, left, right)| Comparison {
                category,
                left,
                right,
                label: pairing_label(callers[left].as_ref(), callers[right].as_ref()),
                overlap: None,
                passing: 0,
            })
            .collect();
        let sink = ErrorSink::new();
        let this = &*self;
        let callers_ref = &callers;
        let compared = ctx.fan_out(comparisons.iter_mut(), &sink, |c| {
            c.overlap = this.compare(
                callers_ref[c.left].as_ref(),
                callers_ref[c.right].as_ref(),
                out_dir,
                ctx,
            );
            c.passing = c.overlap.as_deref().map_or(0, |p| this.passing(p));
            Ok(true)
        });
        if !compared {
            for e in sink.into_errors() {
                warn!("{}", PipelineError::SoftComparison(e));
            }
        }

        self.plot(&comparisons, out_dir, ctx);

        let merged_caller = &callers[merged];
        let merged_count = merged_caller.num_peaks().first().copied().unwrap_or(0);
        let best = |category: IdrCategory| {
            comparisons
                .iter()
                .filter(|c| c.category == category)
                .map(|c| c.passing)
                .max()
                .unwrap_or(0)
                .min(merged_count)
        };
        let conservative = best(IdrCategory::Original);
        let optimal = best(IdrCategory::PooledPseudoReplicates);
        let summary = out_dir.join(SUMMARY_FILE);
        self.write_summary(&comparisons, conservative, optimal, &summary)?;
        if not_within_2x(conservative, optimal) {
            warn!("The conservative count & optimal count not within 2x ({conservative}, {optimal}) for {self}");
        }

        let Some(ranked) = merged_caller.peak_path().first().cloned() else {
            return Ok(self.core.fail(format!("{merged_caller} produced no ranked peaks")));
        };
        let basename = ranked
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.core.safe_name().to_string());
        let column = merged_caller.score_column();
        let mut paths = Vec::new();
        let mut counts = Vec::new();
        for (kind, count) in [("conservative", conservative), ("optimal", optimal)] {
            info!("Getting {kind} {count} of final peaks from {merged_caller}");
            let dest = out_dir.join(format!("final_{kind}_{basename}"));
            counts.push(
                select_top_peaks(&ranked, column, count, &dest)
                    .with_context(|| format!("Failure in creating final {kind} for {self}"))?,
            );
            paths.push(dest);
        }
        self.core.set_counted_results(paths, counts)?;
        self.core.set_output("merged_peaks", ranked);
        self.core.set_output("idr_summary", summary);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peak_callers::macs::tests::fake_macs;
    use crate::testing::{arg_after, write_test_bam, RecordingRunner};
    use chip_types::{Bam, Settings};
    use pretty_assertions::assert_eq;

    fn ready(dir: &Path, name: &str, reads: usize) -> Result<Arc<Sample>> {
        let path = dir.join(format!("{name}.bam"));
        write_test_bam(&path, reads, false)?;
        Ok(Arc::new(Sample::synthetic(name, Bam::new(path, false))))
    }

    /// Stand-in for picard, macs2 and the IDR script. Halves named `_01`
    /// produce no peaks when `empty_first_half` is set.
    fn simulate(argv: &[String], empty_first_half: bool) -> Result<()> {
        simulate_counts(argv, empty_first_half, 5, 2)
    }

    /// As [`simulate`], with `merged_peaks` peaks for the merged-vs-merged
    /// call and `passing` overlaps under the threshold in every comparison.
    fn simulate_counts(argv: &[String], empty_first_half: bool, merged_peaks: usize, passing: usize) -> Result<()> {
        match argv[0].as_str() {
            "picard" => {
                if let Some(out) = argv.iter().find_map(|a| a.strip_prefix("OUTPUT=")) {
                    write_test_bam(Path::new(out), 40, false)?;
                }
            }
            "macs2" => {
                let name = arg_after(argv, "-n").unwrap_or_default();
                let peaks = if empty_first_half && name.contains("pseudo_replicate_01") {
                    0
                } else if name.contains("_pooled_vs_") && !name.contains("pseudo") {
                    merged_peaks
                } else {
                    5
                };
                fake_macs(argv, peaks)?;
            }
            "Rscript" => {
                let out = arg_after(argv, "-1").unwrap_or_default();
                let table = format!("{out}-overlapped-peaks.txt");
                let mut text = String::from("ID1 chr1 start1 stop1 sig1 ID2 chr2 start2 stop2 sig2 idr\n");
                let scores = (0..passing).map(|i| format!("0.00{}", i + 1)).chain(["0.5".to_string()]);
                for (i, idr) in scores.enumerate() {
                    text.push_str(&format!("\"{i}\" chr1 1 2 5 \"{i}\" chr1 1 2 5 {idr}\n"));
                }
                fs::write(table, text)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn context(dir: &Path, runner: Arc<RecordingRunner>) -> Result<PipelineContext> {
        let mut settings = Settings::new("/ref.fa", dir);
        settings.skip_visualization = true;
        settings.pseudo_replicate_seed = Some(7);
        PipelineContext::new(settings, runner)
    }

    #[test]
    fn two_replicates_one_control() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = Arc::new(RecordingRunner::with_handler(|_, argv| simulate(argv, false)));
        let ctx = context(dir.path(), runner.clone())?;
        let treatments = vec![ready(dir.path(), "rep1", 30)?, ready(dir.path(), "rep2", 30)?];
        let controls = vec![ready(dir.path(), "input", 30)?];
        let mut idr = Reproducibility::new(
            Algorithm::MacsIdr,
            "ctcf",
            treatments,
            controls,
            PeakCallerOpts::default(),
        )?;
        let out = dir.path().join("peaks");
        assert!(idr.find_peaks(&out, &ctx)?, "{}", idr.error());

        // 2 originals, 2x2 self halves, 2 pooled halves, 1 merged
        assert_eq!(runner.calls_to("macs2").len(), 9);
        // 1 original, 2 self, 1 pooled pairing
        assert_eq!(runner.calls_to("Rscript").len(), 4);
        assert_eq!(runner.calls_to("picard").len(), 1);

        assert_eq!(idr.num_peaks(), vec![2, 2]);
        let conservative = idr.conservative_peak_path().unwrap_or_default();
        assert_eq!(
            conservative,
            out.join("final_conservative_idr_rep1_pooled_vs_input_pooled_peaks.encodePeak")
        );
        assert_eq!(fs::read_to_string(&conservative)?.lines().count(), 2);
        assert!(idr.optimal_peak_path().is_some_and(|p| p.is_file()));

        let summary = fs::read_to_string(out.join(SUMMARY_FILE))?;
        let lines: Vec<&str> = summary.lines().collect();
        assert_eq!(lines[0], "type\tidr1_name\tidr1_peaks\tidr2_name\tidr2_peaks\tratio");
        assert!(lines[1].starts_with("self_pseudo_replicates\t"));
        assert!(lines[1].ends_with("\t1.00"));
        assert!(lines.last().is_some_and(|l| l.starts_with("final\t")));

        assert!(!out.join("rep1_pseudo_replicate_01.bam").exists());
        assert!(!out.join("rep1_pooled_pseudo_replicate_02.bam").exists());
        assert!(out.join("rep1_pooled.bam").exists());
        assert!(out.join("input_pooled.bam").exists());
        Ok(())
    }

    #[test]
    fn final_counts_never_exceed_merged_peaks() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = Arc::new(RecordingRunner::with_handler(|_, argv| simulate_counts(argv, false, 2, 3)));
        let ctx = context(dir.path(), runner.clone())?;
        let treatments = vec![ready(dir.path(), "rep1", 30)?, ready(dir.path(), "rep2", 30)?];
        let controls = vec![ready(dir.path(), "input", 30)?];
        let mut idr = Reproducibility::new(
            Algorithm::MacsIdr,
            "ctcf",
            treatments,
            controls,
            PeakCallerOpts::default(),
        )?;
        let out = dir.path().join("peaks");
        assert!(idr.find_peaks(&out, &ctx)?, "{}", idr.error());

        assert_eq!(idr.num_peaks(), vec![2, 2]);
        for path in idr.peak_path() {
            assert_eq!(fs::read_to_string(&path)?.lines().count(), 2, "{}", path.display());
        }
        let summary = fs::read_to_string(out.join(SUMMARY_FILE))?;
        assert!(summary.lines().any(|l| l.ends_with("\t3\t1.00")));
        assert_eq!(
            summary.lines().last(),
            Some("final\tconservative (max individuals)\t2\toptimal (max pooled pseudo)\t2\t1.00")
        );
        Ok(())
    }

    #[test]
    fn empty_side_skips_comparison() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = Arc::new(RecordingRunner::with_handler(|_, argv| simulate(argv, true)));
        let ctx = context(dir.path(), runner.clone())?;
        let treatments = vec![ready(dir.path(), "rep1", 20)?, ready(dir.path(), "rep2", 20)?];
        let controls = vec![ready(dir.path(), "input", 20)?];
        let mut idr = Reproducibility::new(
            Algorithm::MacsIdr,
            "ctcf",
            treatments,
            controls,
            PeakCallerOpts::default(),
        )?;
        assert!(idr.find_peaks(dir.path(), &ctx)?);
        // only the original pairing has peaks on both sides
        assert_eq!(runner.calls_to("Rscript").len(), 1);
        assert_eq!(idr.num_peaks(), vec![2, 0]);
        Ok(())
    }

    #[test]
    fn failed_comparison_counts_as_zero() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = Arc::new(RecordingRunner::with_handler(|_, argv| {
            if argv[0] == "Rscript" {
                bail!("idr script crashed");
            }
            simulate(argv, false)
        }));
        let ctx = context(dir.path(), runner.clone())?;
        let treatments = vec![ready(dir.path(), "rep1", 20)?, ready(dir.path(), "rep2", 20)?];
        let controls = vec![ready(dir.path(), "input", 20)?];
        let mut idr = Reproducibility::new(
            Algorithm::MacsIdr,
            "ctcf",
            treatments,
            controls,
            PeakCallerOpts::default(),
        )?;
        assert!(idr.find_peaks(dir.path(), &ctx)?);
        assert_eq!(runner.calls_to("Rscript").len(), 4);
        assert_eq!(idr.num_peaks(), vec![0, 0]);
        assert_eq!(idr.error(), "");
        Ok(())
    }

    #[test]
    fn one_treatment_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let err = Reproducibility::new(
            Algorithm::SppIdr,
            "ctcf",
            vec![ready(dir.path(), "rep1", 1)?],
            vec![ready(dir.path(), "input", 1)?],
            PeakCallerOpts::default(),
        )
        .err()
        .map(|e| e.to_string())
        .unwrap_or_default();
        assert!(err.contains("Too few treatments"));
        Ok(())
    }

    #[test]
    fn ratios_and_spread() {
        assert_eq!(ratio(3, 2), "1.50");
        assert_eq!(ratio(0, 2), "0");
        assert!(not_within_2x(10, 3));
        assert!(!not_within_2x(4, 8));
        assert!(not_within_2x(0, 1));
        assert!(!not_within_2x(0, 0));
    }
}
