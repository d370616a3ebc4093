pub mod plan;
pub mod runner;

pub use plan::{plan, PlannedPipeline};
pub use runner::{run_from_config, run_pipelines, RunSummary};
