//! Markdown summary of a finished run.

use crate::peak_callers::PeakCaller;
use crate::stages::Spotter;
use anyhow::{Context, Result};
use chip_types::Sample;
use itertools::Itertools;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Padded Markdown table; the first row is the header.
fn make_table(rows: &[Vec<String>]) -> String {
    let Some(header) = rows.first() else {
        return String::new();
    };
    let mut widths = vec![0; header.len()];
    for row in rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.chars().count());
        }
    }
    let line = |cells: Vec<String>| {
        let padded = cells
            .iter()
            .zip(&widths)
            .map(|(c, &w)| format!(" {c:<w$} "))
            .join("|");
        format!("|{padded}|")
    };
    let mut out = vec![line(header.clone())];
    out.push(line(widths.iter().map(|w| "-".repeat(*w)).collect()));
    out.extend(rows.iter().skip(1).map(|r| line(r.clone())));
    out.join("\n")
}

fn link(path: &Path, label: String) -> String {
    format!("[{label}]({})", path.display())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn peaks_table(callers: &[Box<dyn PeakCaller>]) -> String {
    let mut rows = vec![vec![
        "Name".to_string(),
        "Caller".to_string(),
        "Type".to_string(),
        "File".to_string(),
        "Peaks".to_string(),
    ]];
    for caller in callers {
        let paths = caller.peak_path();
        let counts = caller.num_peaks();
        for (i, (path, count)) in paths.iter().zip(&counts).enumerate() {
            let kind = match (paths.len() > 1, i) {
                (true, 0) => "conservative",
                (true, 1) => "optimal",
                _ => "*not idr*",
            };
            rows.push(vec![
                caller.to_string(),
                caller.algorithm().to_string(),
                kind.to_string(),
                link(path, file_name(path)),
                count.to_string(),
            ]);
        }
    }
    make_table(&rows)
}

fn bams_table(callers: &[Box<dyn PeakCaller>]) -> String {
    let mut rows = vec![vec![
        "Bam".to_string(),
        "Fragment".to_string(),
        "Alignments".to_string(),
    ]];
    let mut seen = BTreeSet::new();
    for sample in callers
        .iter()
        .flat_map(|c| c.treatments().iter().chain(c.controls()))
    {
        let Some(bam) = &sample.bam else {
            continue;
        };
        if !seen.insert(bam.path.clone()) {
            continue;
        }
        let parent = bam
            .path
            .parent()
            .map(file_name)
            .unwrap_or_default();
        rows.push(vec![
            link(&bam.path, format!("{parent}/{}", file_name(&bam.path))),
            bam.fragment_size.map(|f| f.to_string()).unwrap_or_default(),
            bam.num_alignments.map(|n| n.to_string()).unwrap_or_default(),
        ]);
    }
    make_table(&rows)
}

fn libraries_table(samples: &[Arc<Sample>]) -> String {
    let mut rows = vec![vec!["Library".to_string()]];
    for lib in samples.iter().flat_map(|s| &s.libraries) {
        rows.push(vec![lib.fastq_paths().map(|p| p.display()).join(",")]);
    }
    make_table(&rows)
}

fn spot_table(spotters: &[Spotter]) -> String {
    let mut rows = vec![vec!["Spot".to_string(), "Score".to_string()]];
    for s in spotters {
        rows.push(vec![
            s.name(),
            s.score().map(|v| format!("{v:.4}")).unwrap_or_default(),
        ]);
    }
    make_table(&rows)
}

/// Render the run report.
pub fn render_report(
    samples: &[Arc<Sample>],
    callers: &[Box<dyn PeakCaller>],
    spotters: &[Spotter],
) -> String {
    let mut out = String::new();
    let now = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%:z");
    // writing to a String cannot fail
    let _ = write!(
        out,
        "ChIP-seq Run Report\n===================\n\n\
         Results from chipflow version {} on {now}\n\n\
         Peaks\n-----\n\n{}\n\n\
         BAMs\n----\n\n{}\n\n\
         Libraries\n---------\n\n{}\n",
        env!("CARGO_PKG_VERSION"),
        peaks_table(callers),
        bams_table(callers),
        libraries_table(samples),
    );
    if !spotters.is_empty() {
        let _ = write!(out, "\nSPOT\n----\n\n{}\n", spot_table(spotters));
    }
    out
}

/// Render the run report into `path`.
pub fn write_report(
    path: &Path,
    samples: &[Arc<Sample>],
    callers: &[Box<dyn PeakCaller>],
    spotters: &[Spotter],
) -> Result<()> {
    fs::write(path, render_report(samples, callers, spotters))
        .with_context(|| format!("writing report {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn tables_are_padded() {
        let rows = vec![
            vec!["Name".to_string(), "Peaks".to_string()],
            vec!["ctcf of rep1".to_string(), "12".to_string()],
        ];
        assert_eq!(
            make_table(&rows),
            "| Name         | Peaks |\n\
             | ------------ | ----- |\n\
             | ctcf of rep1 | 12    |"
        );
        assert_eq!(make_table(&[]), "");
    }
}
