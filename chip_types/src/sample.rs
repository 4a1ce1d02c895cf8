use crate::checkpoint::{merge_list, merge_option, replace_if_some, Checkpointable, Merge};
use crate::errors::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// File-system safe form of a sample or strategy name.
pub fn make_safe_name(name: &str) -> String {
    name.replace([' ', '/'], "_")
}

/// An alignment file together with what downstream stages learned about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bam {
    pub path: PathBuf,
    paired: bool,
    pub fragment_size: Option<u32>,
    pub num_alignments: Option<u64>,
    pub dupes_removed: bool,
}

impl Bam {
    pub fn new(path: impl Into<PathBuf>, paired: bool) -> Self {
        Bam {
            path: path.into(),
            paired,
            fragment_size: None,
            num_alignments: None,
            dupes_removed: false,
        }
    }

    pub fn paired(&self) -> bool {
        self.paired
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }
}

impl Merge for Bam {
    /// The paired flag is fixed when the alignment is created and is never restored.
    fn merge(&mut self, restored: Self) {
        self.path = restored.path;
        replace_if_some(&mut self.fragment_size, restored.fragment_size);
        replace_if_some(&mut self.num_alignments, restored.num_alignments);
        self.dupes_removed = restored.dupes_removed;
    }
}

/// Signal tracks rendered from an alignment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisualTracks {
    pub bedgraph: Option<PathBuf>,
    pub wig: Option<PathBuf>,
    pub normalized_bedgraph: Option<PathBuf>,
}

impl Merge for VisualTracks {
    fn merge(&mut self, restored: Self) {
        replace_if_some(&mut self.bedgraph, restored.bedgraph);
        replace_if_some(&mut self.wig, restored.wig);
        replace_if_some(&mut self.normalized_bedgraph, restored.normalized_bedgraph);
    }
}

/// One sequencing run/lane of a library: one FASTQ for single-end data, two
/// for paired-end data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LibraryPart {
    pub run: String,
    pub lane: String,
    pub fastq_paths: Vec<PathBuf>,
    pub downsample: Option<u64>,
    pub bam_path: Option<PathBuf>,
}

impl LibraryPart {
    pub fn paired(&self) -> bool {
        self.fastq_paths.len() == 2
    }
}

impl fmt::Display for LibraryPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.run, self.lane)
    }
}

impl Merge for LibraryPart {
    fn merge(&mut self, restored: Self) {
        replace_if_some(&mut self.downsample, restored.downsample);
        replace_if_some(&mut self.bam_path, restored.bam_path);
    }
}

/// A sequencing library, aligned as a unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Library {
    pub parts: Vec<LibraryPart>,
    pub fastqc_reports: Vec<PathBuf>,
    pub aligned_bam: Option<PathBuf>,
    pub filtered_bam: Option<PathBuf>,
    pub qc_path: Option<PathBuf>,
    pub mapping_counts: BTreeMap<String, u64>,
}

impl Library {
    pub fn new(parts: Vec<LibraryPart>) -> Self {
        Library {
            parts,
            ..Default::default()
        }
    }

    /// A library is paired if its parts carry read pairs.
    pub fn paired(&self) -> bool {
        self.parts.first().is_some_and(LibraryPart::paired)
    }

    pub fn fastq_paths(&self) -> impl Iterator<Item = &Path> + '_ {
        self.parts
            .iter()
            .flat_map(|p| p.fastq_paths.iter().map(PathBuf::as_path))
    }
}

impl Merge for Library {
    fn merge(&mut self, restored: Self) {
        merge_list(&mut self.parts, restored.parts);
        if !restored.fastqc_reports.is_empty() {
            self.fastqc_reports = restored.fastqc_reports;
        }
        replace_if_some(&mut self.aligned_bam, restored.aligned_bam);
        replace_if_some(&mut self.filtered_bam, restored.filtered_bam);
        replace_if_some(&mut self.qc_path, restored.qc_path);
        self.mapping_counts.extend(restored.mapping_counts);
    }
}

/// A biological sample, either configured or synthesized by pooling or
/// pseudo-replication.
#[derive(Debug)]
pub struct Sample {
    name: String,
    safe_name: OnceLock<String>,
    pub libraries: Vec<Library>,
    pub bam: Option<Bam>,
    pub bam_visual: Option<VisualTracks>,
    pub qc_report: Option<PathBuf>,
}

impl Sample {
    pub fn new(name: impl Into<String>, libraries: Vec<Library>) -> Self {
        Sample {
            name: name.into(),
            safe_name: OnceLock::new(),
            libraries,
            bam: None,
            bam_visual: None,
            qc_report: None,
        }
    }

    /// A sample that exists only as an alignment, e.g. a pool of other samples.
    pub fn synthetic(name: impl Into<String>, bam: Bam) -> Self {
        let mut s = Sample::new(name, Vec::new());
        s.bam = Some(bam);
        s
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Computed on first use, fixed for the lifetime of the sample.
    pub fn safe_name(&self) -> &str {
        self.safe_name.get_or_init(|| make_safe_name(&self.name))
    }

    pub fn paired(&self) -> bool {
        match &self.bam {
            Some(bam) => bam.paired(),
            None => self.libraries.first().is_some_and(Library::paired),
        }
    }

    /// True if the alignment exists on disk.
    pub fn is_ready(&self) -> bool {
        self.bam.as_ref().is_some_and(Bam::exists)
    }

    /// The alignment, provided it exists on disk.
    pub fn ready_bam(&self) -> Result<&Bam, PipelineError> {
        match &self.bam {
            Some(bam) if bam.exists() => Ok(bam),
            other => Err(PipelineError::InputNotReady {
                sample: self.name.clone(),
                bam: other
                    .as_ref()
                    .map_or_else(|| "<none>".to_string(), |b| b.path.display().to_string()),
            }),
        }
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Checkpointed fields of a [`Sample`]. Identity is not part of the state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleState {
    pub bam: Option<Bam>,
    pub bam_visual: Option<VisualTracks>,
    pub qc_report: Option<PathBuf>,
    pub libraries: Vec<Library>,
}

impl Checkpointable for Sample {
    type State = SampleState;

    fn snapshot(&self) -> SampleState {
        SampleState {
            bam: self.bam.clone(),
            bam_visual: self.bam_visual.clone(),
            qc_report: self.qc_report.clone(),
            libraries: self.libraries.clone(),
        }
    }

    fn restore(&mut self, state: SampleState) {
        merge_option(&mut self.bam, state.bam);
        merge_option(&mut self.bam_visual, state.bam_visual);
        replace_if_some(&mut self.qc_report, state.qc_report);
        merge_list(&mut self.libraries, state.libraries);
    }
}
