//! Operations on tab-separated peak files (BED-like, one peak per row).

use anyhow::{Context, Result};
use std::cmp::Ordering;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use tempfile::NamedTempFile;

fn is_data_line(line: &str) -> bool {
    !(line.trim().is_empty() || line.starts_with("track") || line.starts_with('#'))
}

/// Data rows of a peak file, skipping track and comment lines.
pub fn read_peak_rows(path: &Path) -> Result<Vec<String>> {
    let f = File::open(path).with_context(|| format!("opening peaks {}", path.display()))?;
    let mut rows = Vec::new();
    for line in BufReader::new(f).lines() {
        let line = line.with_context(|| format!("reading peaks {}", path.display()))?;
        if is_data_line(&line) {
            rows.push(line);
        }
    }
    Ok(rows)
}

/// Number of peaks in a file.
pub fn count_peaks(path: &Path) -> Result<u64> {
    Ok(read_peak_rows(path)?.len() as u64)
}

/// True if the file exists and has at least one byte.
pub fn non_empty(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|m| m.is_file() && m.len() > 0)
}

/// Value of the 1-based `column`; rows without a numeric value sort last.
fn score(row: &str, column: usize) -> f64 {
    row.split('\t')
        .nth(column - 1)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .unwrap_or(f64::NEG_INFINITY)
}

/// Indices of the `n` highest scoring rows; ties keep file order.
fn top_indices(rows: &[String], column: usize, n: usize) -> Vec<usize> {
    let scores: Vec<f64> = rows.iter().map(|r| score(r, column)).collect();
    let mut order: Vec<usize> = (0..rows.len()).collect();
    order.sort_by(|&a, &b| scores[b].partial_cmp(&scores[a]).unwrap_or(Ordering::Equal));
    order.truncate(n);
    order
}

fn write_rows<'a>(dest: &Path, header: Option<&str>, rows: impl Iterator<Item = &'a str>) -> Result<()> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    if let Some(h) = header {
        writeln!(tmp, "{h}")?;
    }
    for row in rows {
        writeln!(tmp, "{row}")?;
    }
    tmp.persist(dest)
        .with_context(|| format!("writing {}", dest.display()))?;
    Ok(())
}

/// Keep the `limit` best rows by `score_column`, preserving file order and any
/// track line. Returns the resulting number of peaks.
pub fn trim_peak_file(path: &Path, score_column: usize, limit: usize) -> Result<u64> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let header = text.lines().next().filter(|l| l.starts_with("track"));
    let rows: Vec<String> = text
        .lines()
        .filter(|l| is_data_line(l))
        .map(ToString::to_string)
        .collect();
    if rows.len() <= limit {
        return Ok(rows.len() as u64);
    }
    let mut keep = top_indices(&rows, score_column, limit);
    keep.sort_unstable();
    write_rows(path, header, keep.iter().map(|&i| rows[i].as_str()))?;
    Ok(keep.len() as u64)
}

fn genomic_order(a: &str, b: &str) -> Ordering {
    let key = |row: &str| {
        let mut f = row.split('\t');
        let chrom = f.next().unwrap_or("").to_string();
        let start = f.next().and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
        let end = f.next().and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
        (chrom, start, end)
    };
    key(a).cmp(&key(b))
}

/// Write the `n` best rows of `ranked` to `dest` in genomic coordinate order.
/// Returns the number of rows written.
pub fn select_top_peaks(ranked: &Path, score_column: usize, n: u64, dest: &Path) -> Result<u64> {
    let rows = read_peak_rows(ranked)?;
    let n = usize::try_from(n).unwrap_or(usize::MAX);
    let mut top: Vec<&str> = top_indices(&rows, score_column, n)
        .into_iter()
        .map(|i| rows[i].as_str())
        .collect();
    top.sort_by(|a, b| genomic_order(a, b));
    write_rows(dest, None, top.iter().copied())?;
    Ok(top.len() as u64)
}

/// Column of the comparison overlap file holding the score that is thresholded.
pub const OVERLAP_SCORE_COLUMN: usize = 11;

/// Rows of an overlap file whose score is at or below `threshold`. Header rows
/// and rows without a numeric score do not count.
pub fn count_passing(overlap: &Path, threshold: f64) -> Result<u64> {
    let f = File::open(overlap).with_context(|| format!("opening {}", overlap.display()))?;
    let mut passing = 0;
    for line in BufReader::new(f).lines() {
        let line = line?;
        let value = line
            .split_whitespace()
            .nth(OVERLAP_SCORE_COLUMN - 1)
            .and_then(|v| v.trim_matches('"').parse::<f64>().ok());
        if value.is_some_and(|v| v <= threshold) {
            passing += 1;
        }
    }
    Ok(passing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn peak(chrom: &str, start: u64, score: f64) -> String {
        format!("{chrom}\t{start}\t{}\tp{start}\t0\t.\t{score}", start + 100)
    }

    #[test]
    fn count_skips_track_lines() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let p = dir.path().join("a.bed");
        fs::write(&p, format!("track name=x\n{}\n{}\n\n", peak("chr1", 5, 1.0), peak("chr2", 1, 2.0)))?;
        assert_eq!(count_peaks(&p)?, 2);
        assert!(non_empty(&p));
        assert!(!non_empty(&dir.path().join("missing")));
        Ok(())
    }

    #[test]
    fn trim_keeps_best_in_file_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let p = dir.path().join("a.regionPeak");
        let rows = [peak("chr1", 10, 3.0), peak("chr1", 20, 9.0), peak("chr1", 30, 1.0), peak("chr1", 40, 5.0)];
        fs::write(&p, rows.join("\n") + "\n")?;
        assert_eq!(trim_peak_file(&p, 7, 2)?, 2);
        assert_eq!(read_peak_rows(&p)?, vec![rows[1].clone(), rows[3].clone()]);
        // already within the limit
        assert_eq!(trim_peak_file(&p, 7, 10)?, 2);
        Ok(())
    }

    #[test]
    fn top_peaks_are_sorted_by_position() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ranked = dir.path().join("merged.regionPeak");
        let rows = [
            peak("chr2", 500, 8.0),
            peak("chr1", 900, 7.0),
            peak("chr1", 100, 6.0),
            peak("chr1", 50, 0.5),
        ];
        fs::write(&ranked, rows.join("\n"))?;
        let dest = dir.path().join("final.regionPeak");
        assert_eq!(select_top_peaks(&ranked, 7, 3, &dest)?, 3);
        assert_eq!(
            read_peak_rows(&dest)?,
            vec![rows[2].clone(), rows[1].clone(), rows[0].clone()]
        );
        assert_eq!(select_top_peaks(&ranked, 7, 0, &dest)?, 0);
        assert_eq!(count_peaks(&dest)?, 0);
        Ok(())
    }

    #[test]
    fn passing_uses_score_column() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let p = dir.path().join("x-overlapped-peaks.txt");
        let row = |idr: &str| format!("chr1 1 2 5 chr1 1 2 6 0.1 0.2 {idr}");
        let text = [
            "chr1 start1 stop1 sig.value1 chr2 start2 stop2 sig.value2 idr.local local.idr IDR".to_string(),
            row("0.001"),
            row("0.01"),
            row("0.5"),
        ]
        .join("\n");
        fs::write(&p, text)?;
        assert_eq!(count_passing(&p, 0.01)?, 2);
        Ok(())
    }
}
