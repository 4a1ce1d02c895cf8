//! From FASTQ to one analysis-ready alignment per sample.

use crate::cluster::{argv, bash_script, shell_quote};
use crate::context::PipelineContext;
use crate::filters::filter_library;
use crate::pool::{link_into_place, merge_bams};
use anyhow::{bail, Context, Result};
use chip_types::{Bam, JobSpec, Library, PipelineError, Sample};
use log::info;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const SINGLE_QC_FIELDS: [&str; 8] = [
    "unique_mapped_reads",
    "multiple_hit_reads",
    "unmapped_reads",
    "total_reads",
    "total_mapped_reads",
    "genomic_positions_with_single_unique_read_mapped",
    "genomic_positions_with_greater_than_one_unique_read_mapped",
    "total_genomic_positions_with_unique_read_mapped",
];

const PAIRED_QC_FIELDS: [&str; 11] = [
    "unique_mapped_pairs",
    "multiple_hit_both_of_pairs",
    "multiple_hit_one_of_pairs",
    "unmapped_pairs",
    "total_pairs",
    "total_mapped_pairs",
    "half_mapped_pairs",
    "unproperly_mapped_pairs",
    "genomic_positions_with_single_unique_pair_mapped",
    "genomic_positions_with_greater_than_one_unique_pair_mapped",
    "total_genomic_positions_with_unique_pairs_mapped",
];

/// Parse a library complexity table: a header, then one tab-separated row
/// of `name` followed by the counts. The last well-formed row wins.
pub fn parse_library_qc(text: &str, paired: bool) -> Result<BTreeMap<String, u64>> {
    let fields: &[&str] = if paired {
        &PAIRED_QC_FIELDS
    } else {
        &SINGLE_QC_FIELDS
    };
    let mut counts: Option<BTreeMap<String, u64>> = None;
    for line in text.lines().skip(1) {
        let values: Option<Vec<u64>> = line
            .split('\t')
            .skip(1)
            .map(|v| v.trim().parse().ok())
            .collect();
        if let Some(values) = values.filter(|v| v.len() >= fields.len()) {
            counts = Some(
                fields
                    .iter()
                    .zip(values)
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
            );
        }
    }
    counts.context("no complexity counts found in library qc table")
}

/// `bwa aln` and `samse`/`sampe` into a coordinate-sorted BAM.
fn bwa_aln(lib: &mut Library, lib_bam: &Path, safe: &str, ctx: &PipelineContext) -> Result<()> {
    let settings = ctx.settings();
    let reference = shell_quote(&settings.reference);
    let threads = settings.bwa_threads;
    let aln_threads = if threads > 1 { threads / 2 } else { 1 };
    let (run, lane) = lib
        .parts
        .first()
        .map(|p| (p.run.clone(), p.lane.clone()))
        .unwrap_or_default();
    let mode = if lib.paired() { "sampe" } else { "samse" };
    let fastqs: Vec<String> = lib.fastq_paths().map(shell_quote).collect();

    let mut script = format!(
        "bwa {mode} -r '@RG\\tID:{safe}_{run}_{lane}\\tSM:{safe}\\tPL:Illumina\\tPU:{lane}' {reference}"
    );
    for fq in &fastqs {
        script.push_str(&format!(" <(bwa aln -t {aln_threads} {reference} {fq})"));
    }
    for fq in &fastqs {
        script.push(' ');
        script.push_str(fq);
    }
    let sort_tmp = lib_bam.with_extension("sorting");
    script.push_str(&format!(
        " | samtools view -Shu - | samtools sort -@ 2 -m 4G -T {} -o {} -",
        shell_quote(&sort_tmp),
        shell_quote(lib_bam)
    ));

    let job = JobSpec::named(format!("bwa_{safe}"))
        .memory(1, 48)
        .threads(threads);
    ctx.run(&job, &bash_script(script))
        .with_context(|| format!("Failure in bwa of library {run}_{lane} for {safe}"))?;
    lib.aligned_bam = Some(lib_bam.to_path_buf());
    Ok(())
}

/// Library complexity table of the aligned BAM, parsed onto the library.
fn library_qc(lib: &mut Library, out_dir: &Path, safe: &str, index: usize, ctx: &PipelineContext) -> Result<()> {
    let Some(aligned) = lib.aligned_bam.clone() else {
        bail!("library {index} of {safe} has no alignment");
    };
    let paired = lib.paired();
    let qc_bam = if paired {
        let sorted = out_dir.join(format!("{safe}_{index}_namesorted.bam"));
        let job = JobSpec::named(format!("namesort_{safe}_{index}")).memory(1, 12);
        ctx.run(&job, &argv!["samtools", "sort", "-n", "-o", sorted, aligned])
            .with_context(|| format!("Failure in sorting by name the bam {index} for {safe}"))?;
        sorted
    } else {
        aligned
    };
    let qc_file = out_dir.join(format!("{safe}_{index}_alignment_qc.txt"));
    let endness = if paired { "pe" } else { "se" };
    let script = format!(
        "library_complexity.sh {endness} {} > {}",
        shell_quote(&qc_bam),
        shell_quote(&qc_file)
    );
    let job = JobSpec::named(format!("align_qc_{safe}_{index}")).memory(1, 12);
    ctx.run(&job, &bash_script(script))
        .with_context(|| format!("Failure in qc of library {index} for {safe}"))?;
    if paired {
        fs::remove_file(&qc_bam)?;
    }
    let text = fs::read_to_string(&qc_file)
        .with_context(|| format!("reading {}", qc_file.display()))?;
    lib.mapping_counts = parse_library_qc(&text, paired)
        .with_context(|| format!("parsing {}", qc_file.display()))?;
    lib.qc_path = Some(qc_file);
    Ok(())
}

/// Link `target` at `link` unless something is already there.
fn mark_duplicates(input: &Path, out_dir: &Path, safe: &str, ctx: &PipelineContext) -> Result<PathBuf> {
    let output = out_dir.join(format!("{safe}_dedup.bam"));
    let metrics = out_dir.join(format!("{safe}_dup_metrics.txt"));
    let cmd = argv![
        "picard",
        "MarkDuplicates",
        format!("INPUT={}", input.display()),
        format!("OUTPUT={}", output.display()),
        format!("METRICS_FILE={}", metrics.display()),
        "REMOVE_DUPLICATES=true",
        "ASSUME_SORTED=true",
        "VALIDATION_STRINGENCY=LENIENT",
    ];
    let job = JobSpec::named(format!("dedup_{safe}")).memory(8, 24);
    ctx.run(&job, &cmd)
        .with_context(|| format!("Failure in removing duplicates for {safe}"))?;
    Ok(output)
}

/// Align, QC and filter every library of the sample, merge the libraries
/// into one BAM and optionally remove duplicates. The result becomes the
/// sample's alignment.
pub fn prepare_bam(sample: &mut Sample, out_dir: &Path, ctx: &PipelineContext) -> Result<bool> {
    info!("Preparing bam {sample}");
    let settings = ctx.settings();
    let safe = sample.safe_name().to_string();
    let paired = sample.paired();

    let mut filtered = Vec::with_capacity(sample.libraries.len());
    for (i, lib) in sample.libraries.iter_mut().enumerate() {
        if settings.skip_alignment {
            let Some(existing) = lib.parts.iter().find_map(|p| p.bam_path.clone()) else {
                return Err(PipelineError::Precondition(format!(
                    "library {i} of {safe} has no bam_path while alignment is skipped"
                ))
                .into());
            };
            lib.aligned_bam = Some(existing);
        } else {
            bwa_aln(lib, &out_dir.join(format!("{safe}_{i}.bam")), &safe, ctx)?;
            library_qc(lib, out_dir, &safe, i, ctx)?;
        }
        let output = out_dir.join(format!("{safe}_filtered_{i}.bam"));
        filter_library(settings.alignment_filter, lib, &output, settings.min_map_quality_score)
            .with_context(|| format!("Failure in filtering library {i} of {safe}"))?;
        if let Some(path) = &lib.filtered_bam {
            filtered.push(path.clone());
        }
    }

    let merged = out_dir.join(format!("{safe}.bam"));
    match filtered.as_slice() {
        [] => bail!("{safe} has no libraries"),
        [single] => link_into_place(single, &merged)?,
        many => {
            let inputs: Vec<&Path> = many.iter().map(PathBuf::as_path).collect();
            merge_bams(&inputs, &merged, ctx)
                .with_context(|| format!("Failure in merging libraries of {safe}"))?;
        }
    }

    let bam = if settings.remove_duplicates {
        let mut bam = Bam::new(mark_duplicates(&merged, out_dir, &safe, ctx)?, paired);
        bam.dupes_removed = true;
        bam
    } else {
        Bam::new(merged, paired)
    };
    sample.bam = Some(bam);
    Ok(true)
}
