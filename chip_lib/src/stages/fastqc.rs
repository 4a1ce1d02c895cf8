use crate::cluster::argv;
use crate::context::PipelineContext;
use anyhow::{Context, Result};
use chip_types::{JobSpec, Sample};
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};

/// `<stem>_fastqc` for a FASTQ, dropping `.gz` and `.fastq`.
fn report_base(fastq: &Path) -> String {
    let name = fastq
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = name.strip_suffix(".gz").unwrap_or(&name);
    let name = name.strip_suffix(".fastq").unwrap_or(name);
    format!("{name}_fastqc")
}

/// FastQC every FASTQ of the sample into `out_dir`, recording the HTML
/// report of each on its library.
pub fn run_fastqc(sample: &mut Sample, out_dir: &Path, ctx: &PipelineContext) -> Result<bool> {
    info!("Fastqc for {sample}");
    let safe = sample.safe_name().to_string();
    for lib in &mut sample.libraries {
        let fastqs: Vec<PathBuf> = lib.fastq_paths().map(Path::to_path_buf).collect();
        for fastq in fastqs {
            let job = JobSpec::named(format!("fastqc_{safe}")).memory(2, 4);
            ctx.run(&job, &argv!["fastqc", "--extract", "-q", "-o", out_dir, fastq])
                .with_context(|| format!("Failure in fastqc of {} for {safe}", fastq.display()))?;
            let base = report_base(&fastq);
            let zip = out_dir.join(format!("{base}.zip"));
            if let Err(e) = fs::remove_file(&zip) {
                debug!("no fastqc archive {} to remove: {e}", zip.display());
            }
            lib.fastqc_reports.push(out_dir.join(format!("{base}.html")));
        }
    }
    Ok(true)
}
