//! Run configuration, read from a TOML file.
//!
//! ```toml
//! [settings]
//! reference = "/ref/hg19.fa"
//! output_base = "/scratch/run1"
//!
//! [[samples]]
//! name = "H3K4me3 rep1"
//! [[samples.libraries]]
//! parts = [{ run = "r1", lane = "1", fastq_paths = ["a.fq.gz"] }]
//!
//! [[peak_callers]]
//! name = "H3K4me3"
//! algorithm = "macs_idr"
//! treatments = ["H3K4me3 rep1", "H3K4me3 rep2"]
//! controls = ["input"]
//! ```

use crate::errors::PipelineError;
use crate::job::JobSpec;
use crate::sample::{Library, LibraryPart, Sample};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Which alignments survive between alignment and duplicate marking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentFilterKind {
    #[default]
    Null,
    OnlyUnique,
    PrimaryAlignment,
    AtLeastOneEndUnique,
}

/// Peak-calling strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    Macs,
    MacsMerged,
    Spp,
    Fseq,
    MacsIdr,
    SppIdr,
    FseqIdr,
}

impl Algorithm {
    /// Strategies built on several treatment replicates.
    pub fn needs_replicates(self) -> bool {
        matches!(
            self,
            Algorithm::MacsMerged | Algorithm::MacsIdr | Algorithm::SppIdr | Algorithm::FseqIdr
        )
    }

    pub fn needs_control(self) -> bool {
        !matches!(self, Algorithm::Fseq | Algorithm::FseqIdr)
    }

    pub fn is_idr(self) -> bool {
        matches!(self, Algorithm::MacsIdr | Algorithm::SppIdr | Algorithm::FseqIdr)
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Algorithm::Macs => "macs",
            Algorithm::MacsMerged => "macs_merged",
            Algorithm::Spp => "spp",
            Algorithm::Fseq => "fseq",
            Algorithm::MacsIdr => "macs_idr",
            Algorithm::SppIdr => "spp_idr",
            Algorithm::FseqIdr => "fseq_idr",
        };
        f.write_str(s)
    }
}

/// `base/path` for a relative `path`, with `.` components dropped.
fn resolve(base: &Path, path: &mut PathBuf) {
    if path.is_relative() {
        *path = base.join(&*path).components().collect();
    }
}

fn default_true() -> bool {
    true
}
fn default_output_base() -> PathBuf {
    PathBuf::from(".")
}
fn default_bwa_threads() -> u32 {
    1
}
fn default_wig_step_size() -> u32 {
    20
}
fn default_neighbor_distance() -> u32 {
    2000
}
fn default_idr_script() -> String {
    "batch-consistency-analysis.r".to_string()
}
fn default_bedgraph_to_wig() -> String {
    "bedgraph_to_wig".to_string()
}
fn default_normalize_bedgraph() -> String {
    "normalize_bedgraph".to_string()
}

/// Global settings shared by every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Indexed reference genome used by the aligner.
    pub reference: PathBuf,
    #[serde(default = "default_output_base")]
    pub output_base: PathBuf,
    #[serde(default = "default_true")]
    pub use_qsub: bool,
    /// Extra arguments appended to every qsub call.
    #[serde(default)]
    pub qsub_opts: Vec<String>,
    #[serde(default)]
    pub skip_fastqc: bool,
    #[serde(default)]
    pub skip_alignment: bool,
    #[serde(default)]
    pub skip_visualization: bool,
    #[serde(default)]
    pub remove_duplicates: bool,
    #[serde(default = "default_bwa_threads")]
    pub bwa_threads: u32,
    #[serde(default)]
    pub min_map_quality_score: u8,
    /// Used when no fragment size could be estimated.
    #[serde(default)]
    pub default_fragment_size: u32,
    #[serde(default = "default_wig_step_size")]
    pub wig_step_size: u32,
    #[serde(default)]
    pub alignment_filter: AlignmentFilterKind,
    /// One `r,g,b` entry per line.
    #[serde(default)]
    pub viz_color_list: Option<PathBuf>,
    #[serde(default)]
    pub genome_table_path: Option<PathBuf>,
    #[serde(default = "default_idr_script")]
    pub idr_script: String,
    #[serde(default)]
    pub idr_plot_script: Option<String>,
    #[serde(default)]
    pub ucsc_refflat_path: Option<PathBuf>,
    #[serde(default = "default_neighbor_distance")]
    pub gene_peak_neighbor_distance: u32,
    #[serde(default)]
    pub hotspot_config: Option<PathBuf>,
    /// Bound on concurrently running units per fan-out; unset runs everything at once.
    #[serde(default)]
    pub max_concurrent_jobs: Option<usize>,
    #[serde(default)]
    pub pseudo_replicate_seed: Option<u64>,
    #[serde(default = "default_bedgraph_to_wig")]
    pub bedgraph_to_wig: String,
    #[serde(default = "default_normalize_bedgraph")]
    pub normalize_bedgraph: String,
}

impl Settings {
    /// Settings with every optional field at its default.
    pub fn new(reference: impl Into<PathBuf>, output_base: impl Into<PathBuf>) -> Self {
        Settings {
            reference: reference.into(),
            output_base: output_base.into(),
            use_qsub: true,
            qsub_opts: Vec::new(),
            skip_fastqc: false,
            skip_alignment: false,
            skip_visualization: false,
            remove_duplicates: false,
            bwa_threads: default_bwa_threads(),
            min_map_quality_score: 0,
            default_fragment_size: 0,
            wig_step_size: default_wig_step_size(),
            alignment_filter: AlignmentFilterKind::Null,
            viz_color_list: None,
            genome_table_path: None,
            idr_script: default_idr_script(),
            idr_plot_script: None,
            ucsc_refflat_path: None,
            gene_peak_neighbor_distance: default_neighbor_distance(),
            hotspot_config: None,
            max_concurrent_jobs: None,
            pseudo_replicate_seed: None,
            bedgraph_to_wig: default_bedgraph_to_wig(),
            normalize_bedgraph: default_normalize_bedgraph(),
        }
    }

    /// Command prefix that submits a job to the cluster and waits for it.
    /// Empty when jobs run locally.
    pub fn cluster_cmd_prefix(&self, job: &JobSpec) -> Vec<String> {
        if !self.use_qsub {
            return Vec::new();
        }
        let work_dir = job.work_dir.as_deref().unwrap_or(&self.output_base);
        let mut cmd: Vec<String> = [
            "qsub",
            "-b",
            "y",
            "-j",
            "y",
            "-V",
            "-l",
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        cmd.push(format!(
            "virtual_free={}G,h_vmem={}G",
            job.free_gb, job.max_gb
        ));
        cmd.push("-wd".into());
        cmd.push(work_dir.display().to_string());
        cmd.push("-o".into());
        cmd.push(self.log_dir().display().to_string());
        cmd.push("-sync".into());
        cmd.push("y".into());
        if let Some(name) = job.scheduler_name() {
            cmd.push("-N".into());
            cmd.push(name);
        }
        if let Some(threads) = job.threads {
            cmd.push("-pe".into());
            cmd.push("threaded".into());
            cmd.push(threads.to_string());
        }
        cmd.extend(self.qsub_opts.iter().cloned());
        cmd
    }

    /// Anchor every relative path at `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        resolve(base, &mut self.reference);
        resolve(base, &mut self.output_base);
        for path in [
            &mut self.viz_color_list,
            &mut self.genome_table_path,
            &mut self.ucsc_refflat_path,
            &mut self.hotspot_config,
        ]
        .into_iter()
        .flatten()
        {
            resolve(base, path);
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.output_base.join("logs")
    }

    /// The output base must be an existing, writable directory.
    pub fn validate_output_base(&self) -> Result<(), PipelineError> {
        let base = &self.output_base;
        let meta = fs::metadata(base).map_err(|e| {
            PipelineError::Precondition(format!("output base {}: {e}", base.display()))
        })?;
        if !meta.is_dir() {
            return Err(PipelineError::Precondition(format!(
                "output base {} is not a directory",
                base.display()
            )));
        }
        if meta.permissions().readonly() {
            return Err(PipelineError::Precondition(format!(
                "output base {} is not writable",
                base.display()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartDef {
    #[serde(default)]
    pub run: String,
    #[serde(default)]
    pub lane: String,
    #[serde(default)]
    pub fastq_paths: Vec<PathBuf>,
    #[serde(default)]
    pub downsample: Option<u64>,
    /// Pre-computed alignment, used when alignment is skipped.
    #[serde(default)]
    pub bam_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LibraryDef {
    pub parts: Vec<PartDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SampleDef {
    pub name: String,
    #[serde(default)]
    pub libraries: Vec<LibraryDef>,
}

fn default_idr_args() -> Vec<String> {
    ["0.3", "F", "p.value", "hg19"]
        .iter()
        .map(ToString::to_string)
        .collect()
}
fn default_idr_threshold() -> f64 {
    0.01
}

/// Per-strategy options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeakCallerOpts {
    /// Extra arguments passed to the peak-calling tool.
    #[serde(default)]
    pub args: Vec<String>,
    /// Parameters handed to the pairwise comparison script.
    #[serde(default = "default_idr_args")]
    pub idr_args: Vec<String>,
    /// Overlaps scoring at or below this value pass.
    #[serde(default = "default_idr_threshold")]
    pub idr_threshold: f64,
    /// Keep only this many top-scoring peaks of each original replicate; 0 keeps all.
    #[serde(default)]
    pub individual_peaks_limit: usize,
    #[serde(default)]
    pub treatment_name: Option<String>,
    #[serde(default)]
    pub control_name: Option<String>,
}

impl Default for PeakCallerOpts {
    fn default() -> Self {
        PeakCallerOpts {
            args: Vec::new(),
            idr_args: default_idr_args(),
            idr_threshold: default_idr_threshold(),
            individual_peaks_limit: 0,
            treatment_name: None,
            control_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeakCallerDef {
    pub name: String,
    pub algorithm: Algorithm,
    pub treatments: Vec<String>,
    #[serde(default)]
    pub controls: Vec<String>,
    #[serde(default)]
    pub opts: PeakCallerOpts,
}

/// The whole run description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Configuration {
    pub settings: Settings,
    #[serde(default)]
    pub samples: Vec<SampleDef>,
    #[serde(default)]
    pub peak_callers: Vec<PeakCallerDef>,
}

impl Configuration {
    /// Read and validate a configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading configuration {}", path.display()))?;
        let mut conf = Self::parse(&text)
            .with_context(|| format!("loading configuration {}", path.display()))?;
        let cwd = std::env::current_dir().context("reading the working directory")?;
        conf.resolve_paths(&cwd);
        Ok(conf)
    }

    /// Parse and validate TOML text.
    pub fn parse(text: &str) -> Result<Self> {
        let conf: Configuration = toml::from_str(text)?;
        conf.validate()?;
        Ok(conf)
    }

    /// Anchor the relative paths of the settings and of every library part at `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        self.settings.resolve_paths(base);
        for part in self
            .samples
            .iter_mut()
            .flat_map(|s| &mut s.libraries)
            .flat_map(|l| &mut l.parts)
        {
            for fastq in &mut part.fastq_paths {
                resolve(base, fastq);
            }
            if let Some(bam) = &mut part.bam_path {
                resolve(base, bam);
            }
        }
    }

    pub fn sample_def(&self, name: &str) -> Option<&SampleDef> {
        self.samples.iter().find(|s| s.name == name)
    }

    /// Structural checks that do not touch the filesystem.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let mut seen = HashSet::new();
        for s in &self.samples {
            if !seen.insert(s.name.as_str()) {
                return Err(PipelineError::Precondition(format!(
                    "duplicate sample name {}",
                    s.name
                )));
            }
            if self.settings.skip_alignment {
                let missing = s
                    .libraries
                    .iter()
                    .flat_map(|l| &l.parts)
                    .any(|p| p.bam_path.is_none());
                if missing {
                    return Err(PipelineError::Precondition(format!(
                        "alignment is skipped but sample {} has parts without bam_path",
                        s.name
                    )));
                }
            }
        }

        let mut callers = HashSet::new();
        for pc in &self.peak_callers {
            if !callers.insert(pc.name.as_str()) {
                return Err(PipelineError::Precondition(format!(
                    "duplicate peak caller name {}",
                    pc.name
                )));
            }
            if pc.treatments.is_empty() {
                return Err(PipelineError::Precondition(format!(
                    "peak caller {} has no treatments",
                    pc.name
                )));
            }
            if pc.algorithm.needs_replicates() && pc.treatments.len() < 2 {
                return Err(PipelineError::Precondition(format!(
                    "peak caller {} ({}) needs at least 2 treatments, got {}",
                    pc.name,
                    pc.algorithm,
                    pc.treatments.len()
                )));
            }
            if pc.algorithm.needs_control() && pc.controls.is_empty() {
                return Err(PipelineError::Precondition(format!(
                    "peak caller {} ({}) needs a control",
                    pc.name, pc.algorithm
                )));
            }
            for name in pc.treatments.iter().chain(&pc.controls) {
                if !seen.contains(name.as_str()) {
                    return Err(PipelineError::Precondition(format!(
                        "peak caller {} refers to unknown sample {name}",
                        pc.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Fresh samples, in configuration order.
    pub fn build_samples(&self) -> Vec<Sample> {
        self.samples
            .iter()
            .map(|s| {
                let libraries = s
                    .libraries
                    .iter()
                    .map(|l| {
                        Library::new(
                            l.parts
                                .iter()
                                .map(|p| LibraryPart {
                                    run: p.run.clone(),
                                    lane: p.lane.clone(),
                                    fastq_paths: p.fastq_paths.clone(),
                                    downsample: p.downsample,
                                    bam_path: p.bam_path.clone(),
                                })
                                .collect(),
                        )
                    })
                    .collect();
                Sample::new(s.name.clone(), libraries)
            })
            .collect()
    }
}
