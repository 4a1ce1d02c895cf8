//! SPOT (signal portion of tags) scores with hotspot.

use crate::cluster::argv;
use crate::context::PipelineContext;
use crate::peak_callers::PeakCaller;
use anyhow::{ensure, Context, Result};
use chip_types::{make_safe_name, JobSpec, PipelineError, Sample};
use log::info;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Read the score from a hotspot `.spot.out` file: a header line naming
/// `total tags`, then one row whose last field is the SPOT score.
pub fn parse_spot_score(path: &Path) -> Result<f64> {
    let text =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut lines = text.lines();
    let header = lines.next().unwrap_or_default();
    ensure!(
        header.contains("total tags"),
        "Incorrect spot result file format in {}: no header",
        path.display()
    );
    let value = lines
        .next()
        .and_then(|l| l.split_whitespace().last())
        .with_context(|| format!("no spot score row in {}", path.display()))?;
    value
        .parse()
        .with_context(|| format!("invalid spot score {value:?} in {}", path.display()))
}

/// One hotspot run over a set of treatments and an optional control.
#[derive(Debug)]
pub struct Spotter {
    treatments: Vec<Arc<Sample>>,
    controls: Vec<Arc<Sample>>,
    score: Option<f64>,
}

fn by_name(mut samples: Vec<Arc<Sample>>) -> Vec<Arc<Sample>> {
    samples.sort_by(|a, b| a.name().cmp(b.name()));
    samples
}

impl Spotter {
    pub fn new(treatments: Vec<Arc<Sample>>, controls: Vec<Arc<Sample>>) -> Self {
        Spotter {
            treatments: by_name(treatments),
            controls: by_name(controls),
            score: None,
        }
    }

    /// First treatment, joined with the first control when there is one.
    pub fn name(&self) -> String {
        let mut name = self
            .treatments
            .first()
            .map(|t| t.safe_name().to_string())
            .unwrap_or_default();
        if let Some(c) = self.controls.first() {
            name.push('_');
            name.push_str(c.safe_name());
        }
        make_safe_name(&name)
    }

    pub fn score(&self) -> Option<f64> {
        self.score
    }

    pub fn data_dir(&self, base: &Path) -> PathBuf {
        base.join(self.name())
    }

    fn spot_file(&self, base: &Path) -> Result<PathBuf> {
        let tag = self
            .treatments
            .first()
            .context("hotspot needs a treatment")?
            .ready_bam()?;
        let stem = tag
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(self.data_dir(base).join(format!("{stem}.spot.out")))
    }

    /// Run hotspot unless an earlier run left its result, then read the score.
    pub fn calculate(&mut self, base: &Path, ctx: &PipelineContext) -> Result<bool> {
        let spot_file = self.spot_file(base)?;
        if spot_file.is_file() {
            info!("reusing {}", spot_file.display());
        } else {
            let Some(config) = &ctx.settings().hotspot_config else {
                return Err(PipelineError::Precondition("no hotspot_config for SPOT scores".into()).into());
            };
            let data_dir = self.data_dir(base);
            fs::create_dir_all(&data_dir)
                .with_context(|| format!("creating {}", data_dir.display()))?;
            let mut cmd = argv!["runhotspot", "-m", "spot", "-o", ".", "-c", config];
            if let Some(control) = self.controls.first() {
                cmd.extend(argv!["-i", control.ready_bam()?.path]);
            }
            for t in &self.treatments {
                cmd.push(t.ready_bam()?.path.display().to_string());
            }
            let job = JobSpec::named(format!("spot_{}", self.name()))
                .memory(2, 16)
                .in_dir(&data_dir);
            ctx.run(&job, &cmd)
                .with_context(|| format!("Failure hotspotting for {}", self.name()))?;
        }
        let score = parse_spot_score(&spot_file)?;
        info!("SPOT score of {self}: {score}");
        self.score = Some(score);
        Ok(true)
    }
}

impl fmt::Display for Spotter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "spot of {}", self.name())
    }
}

/// One spotter per distinct treatment/control set among the peak callers.
pub fn spotters_for(callers: &[Box<dyn PeakCaller>]) -> Vec<Spotter> {
    let mut spotters = BTreeMap::new();
    for caller in callers {
        let spotter = Spotter::new(caller.treatments().to_vec(), caller.controls().to_vec());
        spotters.entry(spotter.name()).or_insert(spotter);
    }
    spotters.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingRunner;
    use chip_types::{Bam, Settings};

    fn sample(dir: &Path, name: &str) -> Result<Arc<Sample>> {
        let path = dir.join(format!("{name}.bam"));
        fs::write(&path, b"bam")?;
        Ok(Arc::new(Sample::synthetic(name, Bam::new(path, false))))
    }

    #[test]
    fn spot_file_format() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let good = dir.path().join("a.spot.out");
        fs::write(&good, "           tih    total tags    SPOT\n  rep1.bam   1234  5678  0.2173\n")?;
        assert_eq!(parse_spot_score(&good)?, 0.2173);

        let bad = dir.path().join("b.spot.out");
        fs::write(&bad, "something else\n1 2 3\n")?;
        assert!(parse_spot_score(&bad).is_err());
        Ok(())
    }

    #[test]
    fn hotspot_runs_once_per_set() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = Arc::new(RecordingRunner::with_handler(|job, argv| {
            if argv[0] == "runhotspot" {
                if let Some(wd) = &job.work_dir {
                    fs::write(wd.join("rep1.spot.out"), "total tags SPOT\nrep1 10 0.5\n")?;
                }
            }
            Ok(())
        }));
        let mut settings = Settings::new("/ref.fa", dir.path());
        settings.hotspot_config = Some(dir.path().join("hotspot.conf"));
        let ctx = PipelineContext::new(settings, runner.clone())?;

        let rep1 = sample(dir.path(), "rep1")?;
        let rep2 = sample(dir.path(), "rep2")?;
        let input = sample(dir.path(), "input")?;
        let mut spotter = Spotter::new(vec![rep2, rep1], vec![input]);
        assert_eq!(spotter.name(), "rep1_input");
        assert!(spotter.calculate(dir.path(), &ctx)?);
        assert_eq!(spotter.score(), Some(0.5));
        assert!(spotter.calculate(dir.path(), &ctx)?);

        let calls = runner.calls_to("runhotspot");
        assert_eq!(calls.len(), 1);
        assert_eq!(&calls[0][7..9], ["-i".to_string(), dir.path().join("input.bam").display().to_string()]);
        assert_eq!(calls[0].len(), 11);
        Ok(())
    }
}
