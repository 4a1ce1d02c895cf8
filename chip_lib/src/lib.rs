// Warning groups (as of rust 1.55)
#![deny(
    future_incompatible,
    nonstandard_style,
    rust_2018_compatibility,
    rust_2021_compatibility,
    rust_2018_idioms,
    unused
)]
// Other warnings (as of rust 1.55)
#![deny(
    asm_sub_register,
    bad_asm_style,
    bindings_with_variant_name,
    clashing_extern_declarations,
    confusable_idents,
    const_item_mutation,
    deprecated,
    deref_nullptr,
    drop_bounds,
    dyn_drop,
    elided_lifetimes_in_paths,
    exported_private_dependencies,
    function_item_references,
    improper_ctypes,
    improper_ctypes_definitions,
    incomplete_features,
    inline_no_sanitize,
    invalid_value,
    irrefutable_let_patterns,
    large_assignments,
    mixed_script_confusables,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    overlapping_range_endpoints,
    renamed_and_removed_lints,
    stable_features,
    dangling_pointers_from_temporaries,
    trivial_bounds,
    type_alias_bounds,
    uncommon_codepoints,
    unconditional_recursion,
    unknown_lints,
    unnameable_test_items,
    unused_comparisons,
    while_true
)]

//! ChIP-seq pipeline orchestration: job submission, per-sample stages,
//! peak-calling strategies, the IDR reproducibility protocol and the
//! analysis driver tying them together.

pub mod cluster;
pub mod context;
pub mod filters;
pub mod peak_callers;
pub mod peaks;
pub mod pipeline;
pub mod pool;
pub mod pseudo_replicate;
pub mod report;
pub mod stages;
pub mod visual;

#[cfg(test)]
mod testing;

pub use cluster::{ClusterRunner, JobRunner};
pub use context::PipelineContext;
pub use peak_callers::{create_peak_caller, PeakCaller};
pub use pipeline::{AnalysisOutcome, ChipAnalysis};
