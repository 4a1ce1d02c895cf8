//! Test doubles: a job runner that records commands and can fake tool
//! outputs, and a small BAM writer.

use crate::cluster::JobRunner;
use anyhow::Result;
use chip_types::JobSpec;
use rust_htslib::bam::header::{Header, HeaderRecord};
use rust_htslib::bam::record::{Cigar, CigarString, Record};
use rust_htslib::bam::{self, Read};
use std::path::Path;
use std::sync::Mutex;

type Handler = Box<dyn Fn(&JobSpec, &[String]) -> Result<()> + Send + Sync>;

/// Records every submitted command. An optional handler simulates the tool.
pub(crate) struct RecordingRunner {
    calls: Mutex<Vec<Vec<String>>>,
    handler: Option<Handler>,
}

impl RecordingRunner {
    pub(crate) fn new() -> Self {
        RecordingRunner {
            calls: Mutex::new(Vec::new()),
            handler: None,
        }
    }

    pub(crate) fn with_handler(
        handler: impl Fn(&JobSpec, &[String]) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        RecordingRunner {
            calls: Mutex::new(Vec::new()),
            handler: Some(Box::new(handler)),
        }
    }

    pub(crate) fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// Commands whose program, or first argument, is `name`.
    pub(crate) fn calls_to(&self, name: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|argv| argv.iter().take(2).any(|a| a == name))
            .collect()
    }
}

impl JobRunner for RecordingRunner {
    fn run(&self, job: &JobSpec, argv: &[String]) -> Result<()> {
        self.calls.lock().unwrap().push(argv.to_vec());
        match &self.handler {
            Some(h) => h(job, argv),
            None => Ok(()),
        }
    }
}

/// Value following `flag` in `argv`.
pub(crate) fn arg_after<'a>(argv: &'a [String], flag: &str) -> Option<&'a str> {
    argv.iter()
        .position(|a| a == flag)
        .and_then(|i| argv.get(i + 1))
        .map(String::as_str)
}

/// Write a coordinate-sorted BAM with `n` mapped reads on one contig.
/// Paired reads carry a template length of 150.
pub(crate) fn write_test_bam(path: &Path, n: usize, paired: bool) -> Result<()> {
    let mut header = Header::new();
    let mut sq = HeaderRecord::new(b"SQ");
    sq.push_tag(b"SN", "chr1");
    sq.push_tag(b"LN", 10_000_000);
    header.push_record(&sq);

    let mut writer = bam::Writer::from_path(path, &header, bam::Format::Bam)?;
    for i in 0..n {
        let mut rec = Record::new();
        let qname = format!("read{i:06}");
        rec.set(
            qname.as_bytes(),
            Some(&CigarString(vec![Cigar::Match(10)])),
            b"ACGTACGTAC",
            &[30; 10],
        );
        rec.set_tid(0);
        rec.set_pos(i as i64 * 7);
        rec.set_mapq(60);
        if paired {
            rec.set_paired();
            rec.set_first_in_template();
            rec.set_mtid(0);
            rec.set_mpos(i as i64 * 7 + 140);
            rec.set_insert_size(150);
        }
        writer.write(&rec)?;
    }
    Ok(())
}

/// Query names and positions of every record, in file order.
pub(crate) fn read_test_bam(path: &Path) -> Result<Vec<(String, i64)>> {
    let mut reader = bam::Reader::from_path(path)?;
    let mut out = Vec::new();
    for rec in reader.records() {
        let rec = rec?;
        out.push((String::from_utf8_lossy(rec.qname()).into_owned(), rec.pos()));
    }
    Ok(out)
}
