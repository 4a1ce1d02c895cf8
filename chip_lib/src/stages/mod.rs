//! Per-sample stages run ahead of peak calling.

mod align;
mod fastqc;
mod spot;

pub use align::{parse_library_qc, prepare_bam};
pub use fastqc::run_fastqc;
pub use spot::{parse_spot_score, spotters_for, Spotter};
