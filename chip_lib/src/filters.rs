//! Alignment filters applied to each library between alignment and merging.

use anyhow::{bail, Context, Result};
use chip_types::{AlignmentFilterKind, Library};
use log::info;
use rust_htslib::bam::record::{Aux, Record};
use rust_htslib::bam::{self, Read};
use std::fs;
use std::path::{Path, PathBuf};

/// Counts of one filtering pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterCounts {
    pub total: u64,
    pub kept: u64,
}

/// bwa marks uniquely placed reads with `XT:A:U`.
fn is_unique(rec: &Record) -> bool {
    matches!(rec.aux(b"XT"), Ok(Aux::Char(b'U')))
}

fn is_primary(rec: &Record) -> bool {
    !rec.is_secondary() && !rec.is_supplementary()
}

/// Stream `input` to `output`, keeping the mapped records with at least
/// `min_mapq` for which `keep` holds.
fn filter_bam(
    input: &Path,
    output: &Path,
    min_mapq: u8,
    keep: impl Fn(&Record) -> bool,
) -> Result<FilterCounts> {
    let mut reader =
        bam::Reader::from_path(input).with_context(|| format!("opening {}", input.display()))?;
    let header = bam::Header::from_template(reader.header());
    let tmp = output.with_extension("tmp.bam");
    let mut counts = FilterCounts { total: 0, kept: 0 };
    {
        let mut writer = bam::Writer::from_path(&tmp, &header, bam::Format::Bam)
            .with_context(|| format!("creating {}", tmp.display()))?;
        let mut rec = Record::new();
        while let Some(r) = reader.read(&mut rec) {
            r.with_context(|| format!("reading {}", input.display()))?;
            counts.total += 1;
            if !rec.is_unmapped() && rec.mapq() >= min_mapq && keep(&rec) {
                writer.write(&rec)?;
                counts.kept += 1;
            }
        }
    }
    fs::rename(&tmp, output)
        .with_context(|| format!("moving {} to {}", tmp.display(), output.display()))?;
    Ok(counts)
}

/// Filter the aligned BAM of `lib` into `output` and record the result as
/// the library's filtered BAM. The null filter passes the alignment through.
///
/// Paired-end filtering is not implemented; asking for it fails the library.
pub fn filter_library(
    kind: AlignmentFilterKind,
    lib: &mut Library,
    output: &Path,
    min_mapq: u8,
) -> Result<()> {
    let Some(aligned) = lib.aligned_bam.clone() else {
        bail!("library has no aligned bam to filter");
    };
    if kind == AlignmentFilterKind::Null {
        lib.filtered_bam = Some(aligned);
        return Ok(());
    }
    if lib.paired() {
        bail!(
            "alignment filter {kind:?} is not implemented for paired-end data ({})",
            aligned.display()
        );
    }
    let counts = match kind {
        AlignmentFilterKind::PrimaryAlignment => filter_bam(&aligned, output, min_mapq, is_primary)?,
        // single-end reads with one unique end are simply unique
        _ => filter_bam(&aligned, output, min_mapq, |r| is_primary(r) && is_unique(r))?,
    };
    info!(
        "kept {} of {} alignments of {} in {}",
        counts.kept,
        counts.total,
        aligned.display(),
        output.display()
    );
    lib.filtered_bam = Some(PathBuf::from(output));
    Ok(())
}
