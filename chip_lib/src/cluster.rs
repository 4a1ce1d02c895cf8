//! Running external tools, locally or through the cluster queue.

use anyhow::{Context, Result};
use chip_types::{JobSpec, PipelineError, Settings};
use itertools::Itertools;
use log::debug;
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Something that can run an external command to completion.
pub trait JobRunner: Send + Sync {
    /// Run `argv` as described by `job` and block until it finishes.
    /// A non-zero exit is an error.
    fn run(&self, job: &JobSpec, argv: &[String]) -> Result<()>;
}

/// Conversion of command-line arguments to strings.
pub trait ToArg {
    fn to_arg(&self) -> String;
}

impl ToArg for str {
    fn to_arg(&self) -> String {
        self.to_string()
    }
}

impl ToArg for String {
    fn to_arg(&self) -> String {
        self.clone()
    }
}

impl ToArg for Path {
    fn to_arg(&self) -> String {
        self.display().to_string()
    }
}

impl ToArg for PathBuf {
    fn to_arg(&self) -> String {
        self.display().to_string()
    }
}

macro_rules! num_to_arg {
    ($($t:ty),*) => {
        $(impl ToArg for $t {
            fn to_arg(&self) -> String {
                self.to_string()
            }
        })*
    };
}
num_to_arg!(u8, u32, u64, usize, f64);

impl<T: ToArg + ?Sized> ToArg for &T {
    fn to_arg(&self) -> String {
        (**self).to_arg()
    }
}

/// Build an argument vector from strings, paths and numbers.
macro_rules! argv {
    ($($arg:expr),* $(,)?) => {
        vec![$($crate::cluster::ToArg::to_arg(&$arg)),*]
    };
}
pub(crate) use argv;

/// Run `script` with bash, failing on the first failing pipeline stage.
pub fn bash_script(script: impl Into<String>) -> Vec<String> {
    let script: String = script.into();
    argv!["/bin/bash", "-o", "pipefail", "-o", "errexit", "-c", script]
}

/// Quote one word for inclusion in a shell script.
pub fn shell_quote(word: impl AsRef<std::ffi::OsStr>) -> String {
    let word = word.as_ref().to_string_lossy();
    shell_escape::escape(word).into_owned()
}

/// Printable form of a command line.
pub fn render(argv: &[String]) -> String {
    argv.iter()
        .map(|a| shell_escape::escape(Cow::Borrowed(a.as_str())))
        .join(" ")
}

/// Runs jobs through `qsub -sync y` when the settings ask for it, otherwise
/// directly on this machine.
pub struct ClusterRunner {
    settings: Settings,
}

impl ClusterRunner {
    pub fn new(settings: Settings) -> Self {
        ClusterRunner { settings }
    }

    fn command(&self, job: &JobSpec, argv: &[String]) -> Result<Command> {
        let (program, args) = argv
            .split_first()
            .with_context(|| format!("empty command for job {:?}", job.name))?;
        let prefix = self.settings.cluster_cmd_prefix(job);
        let cmd = match prefix.split_first() {
            Some((qsub, qsub_args)) => {
                let mut cmd = Command::new(qsub);
                cmd.args(qsub_args);
                // the queue hands the command to a shell on the execution host
                cmd.arg(program);
                cmd.args(args.iter().map(|a| shell_escape::escape(Cow::Borrowed(a.as_str())).into_owned()));
                cmd
            }
            None => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                if let Some(dir) = &job.work_dir {
                    cmd.current_dir(dir);
                }
                cmd
            }
        };
        Ok(cmd)
    }
}

impl JobRunner for ClusterRunner {
    fn run(&self, job: &JobSpec, argv: &[String]) -> Result<()> {
        let mut cmd = self.command(job, argv)?;
        debug!("running {}", render(argv));
        let what = job.name.clone().unwrap_or_else(|| argv[0].clone());
        let status = cmd
            .status()
            .with_context(|| format!("launching {}", render(argv)))?;
        if !status.success() {
            return Err(PipelineError::Subprocess {
                what,
                code: status.code(),
            }
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_mixes_types() {
        let dir = PathBuf::from("/data/x");
        let args = argv!["macs2", "--bw", 200u32, &dir, dir.join("y.bam"), String::from("s")];
        assert_eq!(args, vec!["macs2", "--bw", "200", "/data/x", "/data/x/y.bam", "s"]);
    }

    #[test]
    fn local_run_reports_exit_code() {
        let mut settings = Settings::new("/ref.fa", "/tmp");
        settings.use_qsub = false;
        let runner = ClusterRunner::new(settings);
        let job = JobSpec::named("fail");
        runner.run(&job, &argv!["true"]).unwrap();
        let err = runner.run(&job, &bash_script("exit 3")).unwrap_err();
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::Subprocess { code, .. }) => assert_eq!(*code, Some(3)),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn render_quotes_arguments() {
        assert_eq!(
            render(&bash_script("cat a > b")),
            "/bin/bash -o pipefail -o errexit -c 'cat a > b'"
        );
    }
}
