//! Pooling the alignments of several samples into one synthetic sample.

use crate::cluster::argv;
use crate::context::PipelineContext;
use crate::peaks::non_empty;
use anyhow::{ensure, Context, Result};
use chip_types::{Bam, JobSpec, Sample};
use log::info;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

/// Symlink `link` to the absolute form of `target` unless something is
/// already there.
pub fn link_into_place(target: &Path, link: &Path) -> Result<()> {
    if link.symlink_metadata().is_ok() {
        return Ok(());
    }
    let target = std::path::absolute(target)
        .with_context(|| format!("resolving {}", target.display()))?;
    symlink(&target, link)
        .with_context(|| format!("linking {} to {}", link.display(), target.display()))
}

/// Coordinate-sorted merge of `inputs` into `output` with Picard.
pub fn merge_bams(inputs: &[&Path], output: &Path, ctx: &PipelineContext) -> Result<()> {
    let file_name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = output.with_extension("tmp.bam");
    let mut cmd = argv![
        "picard",
        "MergeSamFiles",
        format!("OUTPUT={}", tmp.display()),
        "VALIDATION_STRINGENCY=LENIENT",
        "MAX_RECORDS_IN_RAM=6000000",
        "COMPRESSION_LEVEL=8",
        "USE_THREADING=True",
        "ASSUME_SORTED=true",
        "SORT_ORDER=coordinate",
    ];
    cmd.extend(inputs.iter().map(|p| format!("INPUT={}", p.display())));
    let job = JobSpec::named(format!("merge_{file_name}")).memory(8, 56);
    ctx.run(&job, &cmd)?;
    fs::rename(&tmp, output)
        .with_context(|| format!("moving {} to {}", tmp.display(), output.display()))?;
    Ok(())
}

/// Pool the alignments of `samples` into `<prefix>_pooled.bam`, as a sample
/// named `<label>_pooled`. A single sample is linked rather than copied.
///
/// The pooled alignment takes the mean fragment size of its inputs and the
/// paired and duplicate flags of the first input.
pub fn pool_samples<S: AsRef<Sample>>(
    label: &str,
    samples: &[S],
    prefix: &Path,
    ctx: &PipelineContext,
) -> Result<Sample> {
    ensure!(!samples.is_empty(), "nothing to pool for {label}");
    let bams = samples
        .iter()
        .map(|s| s.as_ref().ready_bam())
        .collect::<Result<Vec<&Bam>, _>>()?;

    let mut dest = prefix.as_os_str().to_owned();
    dest.push("_pooled.bam");
    let dest = PathBuf::from(dest);
    if let Some(dir) = dest.parent() {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }

    if bams.len() == 1 {
        link_into_place(&bams[0].path, &dest)?;
    } else if non_empty(&dest) {
        info!("reusing pooled alignment {}", dest.display());
    } else {
        let inputs: Vec<&Path> = bams.iter().map(|b| b.path.as_path()).collect();
        merge_bams(&inputs, &dest, ctx)?;
    }

    let first = bams[0];
    let mut pooled = Bam::new(&dest, first.paired());
    let sizes: Vec<u32> = bams.iter().filter_map(|b| b.fragment_size).collect();
    if !sizes.is_empty() {
        let total: u64 = sizes.iter().map(|&s| u64::from(s)).sum();
        pooled.fragment_size = u32::try_from(total / bams.len() as u64).ok();
    }
    pooled.dupes_removed = first.dupes_removed;
    Ok(Sample::synthetic(format!("{label}_pooled"), pooled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{arg_after, RecordingRunner};
    use chip_types::Settings;
    use std::sync::Arc;

    fn ready(dir: &Path, name: &str, frag: u32) -> Result<Arc<Sample>> {
        let path = dir.join(format!("{name}.bam"));
        fs::write(&path, b"bam")?;
        let mut bam = Bam::new(path, false);
        bam.fragment_size = Some(frag);
        Ok(Arc::new(Sample::synthetic(name, bam)))
    }

    #[test]
    fn single_sample_is_linked() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = Arc::new(RecordingRunner::new());
        let ctx = PipelineContext::new(Settings::new("/ref.fa", dir.path()), runner.clone())?;
        let input = ready(dir.path(), "input", 150)?;
        let pooled = pool_samples("input", &[input], &dir.path().join("idr/input"), &ctx)?;
        assert_eq!(pooled.name(), "input_pooled");
        assert!(pooled.is_ready());
        assert_eq!(pooled.bam.as_ref().unwrap().fragment_size, Some(150));
        assert!(runner.calls().is_empty());
        Ok(())
    }

    #[test]
    fn relative_link_targets_are_made_absolute() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let link = dir.path().join("manifest.bam");
        // tests run from the package root
        link_into_place(Path::new("./Cargo.toml"), &link)?;
        let target = fs::read_link(&link)?;
        assert!(target.is_absolute(), "{}", target.display());
        assert!(link.is_file());

        // an existing link is left alone
        link_into_place(Path::new("src/lib.rs"), &link)?;
        assert_eq!(fs::read_link(&link)?, target);
        Ok(())
    }

    #[test]
    fn several_samples_are_merged() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = Arc::new(RecordingRunner::with_handler(|_, argv| {
            if let Some(out) = argv.iter().find_map(|a| a.strip_prefix("OUTPUT=")) {
                fs::write(out, b"merged")?;
            }
            Ok(())
        }));
        let ctx = PipelineContext::new(Settings::new("/ref.fa", dir.path()), runner.clone())?;
        let a = ready(dir.path(), "a", 100)?;
        let b = ready(dir.path(), "b", 201)?;
        let pooled = pool_samples("ab", &[a, b], &dir.path().join("ab"), &ctx)?;
        let bam = pooled.bam.as_ref().unwrap();
        assert_eq!(bam.fragment_size, Some(150));
        assert!(bam.exists());
        let calls = runner.calls_to("MergeSamFiles");
        assert_eq!(calls.len(), 1);
        assert_eq!(arg_after(&calls[0], "picard"), Some("MergeSamFiles"));
        assert_eq!(calls[0].iter().filter(|a| a.starts_with("INPUT=")).count(), 2);
        Ok(())
    }
}
