pub mod pipeline;
pub mod state;

pub use pipeline::{build_run_name, source_label, Orchestrator, WorkflowParams, WorkflowRun};
pub use state::{ResolvedParams, WorkflowState, STATE_FILE};
