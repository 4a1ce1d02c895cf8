//! Resource description of one external command submitted to the cluster.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub name: Option<String>,
    /// Memory the scheduler must find free before starting the job, in GB.
    pub free_gb: u32,
    /// Hard memory limit, in GB.
    pub max_gb: u32,
    pub threads: Option<u32>,
    pub work_dir: Option<PathBuf>,
}

impl Default for JobSpec {
    fn default() -> Self {
        JobSpec {
            name: None,
            free_gb: 4,
            max_gb: 8,
            threads: None,
            work_dir: None,
        }
    }
}

impl JobSpec {
    pub fn named(name: impl Into<String>) -> Self {
        JobSpec {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn memory(mut self, free_gb: u32, max_gb: u32) -> Self {
        self.free_gb = free_gb;
        self.max_gb = max_gb.max(free_gb);
        self
    }

    pub fn threads(mut self, threads: u32) -> Self {
        self.threads = (threads > 1).then_some(threads);
        self
    }

    pub fn in_dir(mut self, dir: &Path) -> Self {
        self.work_dir = Some(dir.to_path_buf());
        self
    }

    /// Job name as accepted by the scheduler.
    pub fn scheduler_name(&self) -> Option<String> {
        self.name
            .as_ref()
            .map(|n| crate::sample::make_safe_name(n).replace(':', "_"))
    }
}
