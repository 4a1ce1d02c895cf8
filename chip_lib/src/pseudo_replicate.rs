//! Random splitting of one alignment into disjoint pseudo-replicates.

use crate::peaks::non_empty;
use anyhow::{ensure, Context, Result};
use chip_types::{Bam, Sample};
use log::info;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rust_htslib::bam::{self, Read};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the `index`th (1-based) pseudo-replicate of `safe_name`.
pub fn pseudo_replicate_name(safe_name: &str, index: usize) -> String {
    format!("{safe_name}_pseudo_replicate_{index:02}")
}

/// Output paths for `num_replicates` pseudo-replicates of `safe_name` in `out_dir`.
pub fn pseudo_replicate_paths(out_dir: &Path, safe_name: &str, num_replicates: usize) -> Vec<PathBuf> {
    (1..=num_replicates)
        .map(|i| out_dir.join(format!("{}.bam", pseudo_replicate_name(safe_name, i))))
        .collect()
}

/// Replicate index of every record: a shuffled round robin, so replicate sizes
/// differ by at most one.
pub fn partition_assignments<R: Rng>(
    num_records: usize,
    num_replicates: usize,
    rng: &mut R,
) -> Vec<usize> {
    let mut assignments: Vec<usize> = (0..num_records).map(|i| i % num_replicates).collect();
    assignments.shuffle(rng);
    assignments
}

fn count_records(path: &Path) -> Result<usize> {
    let mut reader =
        bam::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;
    let mut record = bam::Record::new();
    let mut n = 0;
    while let Some(r) = reader.read(&mut record) {
        r.with_context(|| format!("reading {}", path.display()))?;
        n += 1;
    }
    Ok(n)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".tmp");
    PathBuf::from(s)
}

/// Stream the records of `input` into `outputs`, each record to exactly one
/// output. Record order, and therefore coordinate sorting, is preserved.
/// Returns the number of records written to each output.
pub fn split_bam(input: &Path, outputs: &[PathBuf], seed: u64) -> Result<Vec<u64>> {
    ensure!(!outputs.is_empty(), "no outputs to split {} into", input.display());
    let num_records = count_records(input)?;
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let assignments = partition_assignments(num_records, outputs.len(), &mut rng);

    let mut reader =
        bam::Reader::from_path(input).with_context(|| format!("opening {}", input.display()))?;
    let header = bam::Header::from_template(reader.header());
    let tmp_paths: Vec<PathBuf> = outputs.iter().map(|p| tmp_path(p)).collect();
    let mut writers = tmp_paths
        .iter()
        .map(|p| {
            bam::Writer::from_path(p, &header, bam::Format::Bam)
                .with_context(|| format!("creating {}", p.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut counts = vec![0u64; outputs.len()];
    let mut record = bam::Record::new();
    let mut i = 0;
    while let Some(r) = reader.read(&mut record) {
        r.with_context(|| format!("reading {}", input.display()))?;
        let Some(&k) = assignments.get(i) else {
            anyhow::bail!("{} grew while it was being split", input.display());
        };
        writers[k].write(&record)?;
        counts[k] += 1;
        i += 1;
    }
    ensure!(
        i == num_records,
        "{} shrank while it was being split",
        input.display()
    );

    // flush and close before the outputs become visible
    drop(writers);
    for (tmp, out) in tmp_paths.iter().zip(outputs) {
        fs::rename(tmp, out)
            .with_context(|| format!("moving {} to {}", tmp.display(), out.display()))?;
    }
    Ok(counts)
}

/// Split the alignment of `source` into `num_replicates` synthetic samples
/// stored in `out_dir`. Outputs left by an earlier run are reused as they are.
pub fn make_pseudo_replicates(
    source: &Sample,
    num_replicates: usize,
    out_dir: &Path,
    seed: u64,
) -> Result<Vec<Sample>> {
    ensure!(
        num_replicates > 1,
        "pseudo-replication of {source} needs at least 2 replicates"
    );
    let bam = source.ready_bam()?;
    let paths = pseudo_replicate_paths(out_dir, source.safe_name(), num_replicates);

    if paths.iter().all(|p| non_empty(p)) {
        info!("reusing pseudo-replicates of {source} in {}", out_dir.display());
    } else {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("creating {}", out_dir.display()))?;
        let counts = split_bam(&bam.path, &paths, seed)?;
        info!("split {source} into pseudo-replicates of {counts:?} records");
    }

    Ok(paths
        .into_iter()
        .enumerate()
        .map(|(i, path)| {
            let mut rep = Bam::new(path, bam.paired());
            rep.fragment_size = bam.fragment_size;
            rep.dupes_removed = bam.dupes_removed;
            Sample::synthetic(pseudo_replicate_name(source.safe_name(), i + 1), rep)
        })
        .collect())
}
