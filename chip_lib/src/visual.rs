//! Signal tracks of an alignment: a fragment-extended coverage bedgraph, its
//! wig rendering and a depth-normalized bedgraph.

use crate::cluster::{argv, bash_script, shell_quote};
use crate::context::PipelineContext;
use anyhow::{Context, Result};
use chip_types::{checkpointed, make_safe_name, Bam, JobSpec, Sample, VisualTracks};
use log::{info, warn};
use rust_htslib::bam::{self, Read};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

/// What one pass over an alignment learned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignmentScan {
    pub num_alignments: u64,
    /// Median template length of paired reads; `None` for single-end data.
    pub fragment_size: Option<u32>,
}

fn median(values: &mut [u32]) -> Option<u32> {
    if values.is_empty() {
        return None;
    }
    let mid = values.len() / 2;
    let (_, m, _) = values.select_nth_unstable(mid);
    Some(*m)
}

/// Count primary mapped alignments and write one fragment interval per read
/// (per pair for paired data) to `bed`. Single-end reads are extended to
/// `fragment_size` in their own direction.
pub fn scan_alignment(path: &Path, paired: bool, fragment_size: u32, bed: &Path) -> Result<AlignmentScan> {
    let mut reader =
        bam::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;
    let names: Vec<String> = reader
        .header()
        .target_names()
        .iter()
        .map(|n| String::from_utf8_lossy(n).into_owned())
        .collect();
    let mut out = BufWriter::new(
        File::create(bed).with_context(|| format!("creating {}", bed.display()))?,
    );

    let mut record = bam::Record::new();
    let mut num_alignments = 0u64;
    let mut template_lengths = Vec::new();
    while let Some(r) = reader.read(&mut record) {
        r.with_context(|| format!("reading {}", path.display()))?;
        if record.is_unmapped() || record.is_secondary() || record.is_supplementary() {
            continue;
        }
        num_alignments += 1;
        let Some(chrom) = usize::try_from(record.tid()).ok().and_then(|t| names.get(t)) else {
            continue;
        };
        let start = record.pos().max(0);
        if paired {
            let tlen = record.insert_size();
            if record.is_first_in_template() && tlen > 0 {
                template_lengths.push(u32::try_from(tlen).unwrap_or(u32::MAX));
                writeln!(out, "{chrom}\t{start}\t{}", start + tlen)?;
            }
        } else {
            let end = record.cigar().end_pos();
            let extend = i64::from(fragment_size).max(end - start);
            if record.is_reverse() {
                writeln!(out, "{chrom}\t{}\t{end}", (end - extend).max(0))?;
            } else {
                writeln!(out, "{chrom}\t{start}\t{}", start + extend)?;
            }
        }
    }
    out.flush()?;
    Ok(AlignmentScan {
        num_alignments,
        fragment_size: if paired {
            median(&mut template_lengths)
        } else {
            None
        },
    })
}

/// Build the signal tracks of `sample` in `out_dir`, updating the alignment's
/// count and, for paired data, its fragment size.
pub fn visualize(sample: &mut Sample, out_dir: &Path, ctx: &PipelineContext) -> Result<bool> {
    let settings = ctx.settings();
    let bam: Bam = sample.ready_bam()?.clone();
    let stem = bam
        .path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| sample.safe_name().to_string());
    let prefix = out_dir.join(&stem);
    let with_suffix = |suffix: &str| {
        let mut p = prefix.as_os_str().to_owned();
        p.push(suffix);
        std::path::PathBuf::from(p)
    };

    let tmp_bed = with_suffix("_tmp.bed");
    let fragment_size = bam.fragment_size.unwrap_or(settings.default_fragment_size);
    let scan = scan_alignment(&bam.path, bam.paired(), fragment_size, &tmp_bed)?;
    if let Some(b) = sample.bam.as_mut() {
        b.num_alignments = Some(scan.num_alignments);
        if scan.fragment_size.is_some() {
            b.fragment_size = scan.fragment_size;
        }
    }
    info!("{sample}: {} alignments, fragment size {:?}", scan.num_alignments, sample.bam.as_ref().and_then(|b| b.fragment_size));

    let genome_table = settings
        .genome_table_path
        .as_deref()
        .context("genome_table_path is required to build signal tracks")?;
    let color = ctx.random_color();
    let raw_bedgraph = with_suffix("_raw.bedgraph");
    let track_opts = format!(
        "name=\"{stem}_raw.bedgraph\" description=\"{stem}_raw.bedgraph\" visibility=full color=\"{color}\""
    );
    let script = format!(
        "genomeCoverageBed -i {} -g {} -bg -trackline -trackopts {} > {}",
        shell_quote(&tmp_bed),
        shell_quote(genome_table),
        shell_quote(&track_opts),
        shell_quote(&raw_bedgraph),
    );
    let job = JobSpec::named(format!("bedgraph_{stem}")).memory(1, 4).in_dir(out_dir);
    ctx.run(&job, &bash_script(script))
        .with_context(|| format!("Failure creating bedgraph for {sample}"))?;
    if let Err(e) = fs::remove_file(&tmp_bed) {
        warn!("could not remove {}: {e}", tmp_bed.display());
    }

    let wig = with_suffix("_raw.wig");
    let job = JobSpec::named(format!("wig_{stem}")).memory(1, 4).in_dir(out_dir);
    let cmd = argv![
        settings.bedgraph_to_wig,
        "-b",
        raw_bedgraph,
        "-c",
        color,
        "-s",
        settings.wig_step_size,
        "-o",
        wig,
    ];
    ctx.run(&job, &cmd)
        .with_context(|| format!("Failure creating wig for {sample}"))?;

    let normalized = with_suffix("_normalized.bedgraph");
    let job = JobSpec::named(format!("normalize_bedgraph_{stem}")).memory(1, 2).in_dir(out_dir);
    let cmd = argv![
        settings.normalize_bedgraph,
        "-b",
        raw_bedgraph,
        "-c",
        scan.num_alignments,
        "-o",
        normalized,
    ];
    ctx.run(&job, &cmd)
        .with_context(|| format!("Failure normalizing bedgraph for {sample}"))?;

    sample.bam_visual = Some(VisualTracks {
        bedgraph: Some(raw_bedgraph),
        wig: Some(wig),
        normalized_bedgraph: Some(normalized),
    });
    Ok(true)
}

/// Checkpointed signal tracks of a pooled sample built by strategy `owner`.
/// Nothing happens when visualization is switched off.
pub fn visualize_pooled(owner: &str, sample: &mut Sample, vis_root: &Path, ctx: &PipelineContext) -> Result<()> {
    if ctx.settings().skip_visualization {
        return Ok(());
    }
    let dir = vis_root.join(make_safe_name(owner)).join(sample.safe_name());
    if !checkpointed(sample, Some(&dir), |d, s| visualize(s, d, ctx))? {
        anyhow::bail!("signal tracks of {sample} were not created");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{write_test_bam, RecordingRunner};
    use chip_types::Settings;
    use std::sync::Arc;

    #[test]
    fn scan_single_end_extends_reads() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let bam = dir.path().join("se.bam");
        write_test_bam(&bam, 5, false)?;
        let bed = dir.path().join("se_tmp.bed");
        let scan = scan_alignment(&bam, false, 100, &bed)?;
        assert_eq!(scan, AlignmentScan { num_alignments: 5, fragment_size: None });
        let text = fs::read_to_string(&bed)?;
        assert_eq!(text.lines().next(), Some("chr1\t0\t100"));
        assert_eq!(text.lines().count(), 5);
        Ok(())
    }

    #[test]
    fn scan_paired_estimates_fragment() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let bam = dir.path().join("pe.bam");
        write_test_bam(&bam, 9, true)?;
        let scan = scan_alignment(&bam, true, 0, &dir.path().join("pe_tmp.bed"))?;
        assert_eq!(scan.fragment_size, Some(150));
        assert_eq!(scan.num_alignments, 9);
        Ok(())
    }

    #[test]
    fn visualize_records_tracks() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("s1.bam");
        write_test_bam(&path, 20, true)?;
        let mut settings = Settings::new("/ref.fa", dir.path());
        settings.genome_table_path = Some(dir.path().join("genome.txt"));
        let runner = Arc::new(RecordingRunner::new());
        let ctx = PipelineContext::new(settings, runner.clone())?;

        let mut sample = Sample::synthetic("s1", Bam::new(&path, true));
        let out = dir.path().join("vis");
        fs::create_dir_all(&out)?;
        assert!(visualize(&mut sample, &out, &ctx)?);

        let bam = sample.bam.as_ref().unwrap();
        assert_eq!(bam.num_alignments, Some(20));
        assert_eq!(bam.fragment_size, Some(150));
        let tracks = sample.bam_visual.as_ref().unwrap();
        assert_eq!(tracks.wig, Some(out.join("s1_raw.wig")));
        assert!(!out.join("s1_tmp.bed").exists());
        assert_eq!(runner.calls().len(), 3);
        assert_eq!(runner.calls_to("normalize_bedgraph")[0][4], "20");
        Ok(())
    }
}
