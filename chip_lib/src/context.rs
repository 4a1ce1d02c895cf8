use crate::cluster::{render, ClusterRunner, JobRunner};
use anyhow::{Context, Result};
use chip_types::{JobSpec, Settings};
use log::info;
use par_proc::ErrorSink;
use rand::seq::SliceRandom;
use std::fmt::Display;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

const DEFAULT_COLOR: &str = "54,54,54";

/// Everything a stage needs besides its own inputs: the settings, the way
/// jobs are executed and the track colour palette.
pub struct PipelineContext {
    settings: Settings,
    runner: Arc<dyn JobRunner>,
    colors: Vec<String>,
}

impl PipelineContext {
    pub fn new(settings: Settings, runner: Arc<dyn JobRunner>) -> Result<Self> {
        let colors = match &settings.viz_color_list {
            Some(path) => load_colors(path)?,
            None => Vec::new(),
        };
        Ok(PipelineContext {
            settings,
            runner,
            colors,
        })
    }

    /// Context that submits jobs according to the settings.
    pub fn with_cluster(settings: Settings) -> Result<Self> {
        let runner = Arc::new(ClusterRunner::new(settings.clone()));
        Self::new(settings, runner)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run one external command and wait for it.
    pub fn run(&self, job: &JobSpec, argv: &[String]) -> Result<()> {
        self.runner
            .run(job, argv)
            .with_context(|| format!("running {}", render(argv)))
    }

    /// A colour from the palette as `r,g,b`.
    pub fn random_color(&self) -> String {
        self.colors
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_else(|| DEFAULT_COLOR.to_string())
    }

    /// [`par_proc::fan_out`] bounded by the configured job limit.
    pub fn fan_out<I, T, F>(&self, items: I, sink: &ErrorSink, work: F) -> bool
    where
        I: IntoIterator<Item = T>,
        T: Send + Display,
        F: Fn(T) -> Result<bool> + Sync,
    {
        par_proc::fan_out(items, self.settings.max_concurrent_jobs, sink, work)
    }

    /// Directory of a top-level stage.
    pub fn stage_dir(&self, stage: &str) -> PathBuf {
        self.settings.output_base.join(stage)
    }
}

fn load_colors(path: &std::path::Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading colour list {}", path.display()))?;
    let colors: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(ToString::to_string)
        .collect();
    info!("loaded {} track colours from {}", colors.len(), path.display());
    Ok(colors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingRunner;

    #[test]
    fn colors_come_from_list() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let list = dir.path().join("colors.txt");
        fs::write(&list, "# palette\n255,0,0\n\n0,0,255\n")?;
        let mut settings = Settings::new("/ref.fa", dir.path());
        settings.viz_color_list = Some(list);
        let ctx = PipelineContext::new(settings, Arc::new(RecordingRunner::new()))?;
        for _ in 0..10 {
            let c = ctx.random_color();
            assert!(c == "255,0,0" || c == "0,0,255");
        }

        let ctx = PipelineContext::new(
            Settings::new("/ref.fa", dir.path()),
            Arc::new(RecordingRunner::new()),
        )?;
        assert_eq!(ctx.random_color(), DEFAULT_COLOR);
        Ok(())
    }
}
