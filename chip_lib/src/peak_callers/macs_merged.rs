use super::{Macs, PeakCallCore, PeakCaller};
use crate::context::PipelineContext;
use crate::pipeline::VISUALIZATION_DIR;
use crate::pool::pool_samples;
use crate::visual::visualize_pooled;
use anyhow::Result;
use chip_types::{Algorithm, PeakCallerOpts, PipelineError, Sample};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// MACS on the pooled treatments against the pooled controls.
#[derive(Debug)]
pub struct MacsMerged {
    core: PeakCallCore,
}

impl MacsMerged {
    pub fn new(
        name: &str,
        treatments: Vec<Arc<Sample>>,
        controls: Vec<Arc<Sample>>,
        opts: PeakCallerOpts,
    ) -> Result<Self> {
        if treatments.len() < 2 {
            return Err(PipelineError::Precondition(format!(
                "Too few treatments (< 2) for {name}"
            ))
            .into());
        }
        if controls.is_empty() {
            return Err(PipelineError::Precondition(format!("no control for {name}")).into());
        }
        Ok(MacsMerged {
            core: PeakCallCore::new(name, treatments, controls, opts),
        })
    }

    /// A pool of `samples`, or the sample itself when there is only one.
    fn pooled(
        &self,
        label: &str,
        samples: &[Arc<Sample>],
        out_dir: &Path,
        ctx: &PipelineContext,
    ) -> Result<Arc<Sample>> {
        if let [single] = samples {
            return Ok(single.clone());
        }
        let mut pooled = pool_samples(label, samples, &out_dir.join(label), ctx)?;
        visualize_pooled(
            self.core.name(),
            &mut pooled,
            &ctx.stage_dir(VISUALIZATION_DIR),
            ctx,
        )?;
        Ok(Arc::new(pooled))
    }
}

impl fmt::Display for MacsMerged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.core, f)
    }
}

impl PeakCaller for MacsMerged {
    fn core(&self) -> &PeakCallCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PeakCallCore {
        &mut self.core
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::MacsMerged
    }

    fn score_column(&self) -> usize {
        8
    }

    fn find_peaks(&mut self, out_dir: &Path, ctx: &PipelineContext) -> Result<bool> {
        let all: Vec<Arc<Sample>> = self
            .core
            .treatments()
            .iter()
            .chain(self.core.controls())
            .cloned()
            .collect();
        if !self.core.require_ready(&all) {
            return Ok(false);
        }

        let control = self.pooled(
            &self.core.controls_label(),
            self.core.controls(),
            out_dir,
            ctx,
        )?;
        let treatment = self.pooled(
            &self.core.treatments_label(),
            self.core.treatments(),
            out_dir,
            ctx,
        )?;

        // same result names as this strategy
        let mut opts = self.core.opts.clone();
        opts.treatment_name = Some(self.core.treatments_label());
        opts.control_name = Some(self.core.controls_label());
        let mut macs = Macs::new(self.core.name(), vec![treatment], vec![control], opts)?;
        let ok = macs.find_peaks(out_dir, ctx)?;
        if !ok {
            return Ok(self.core.fail(macs.error()));
        }
        self.core
            .set_counted_results(macs.peak_path(), macs.num_peaks())?;
        for (kind, path) in macs.outputs() {
            self.core.set_output(kind, path.clone());
        }
        Ok(true)
    }
}
