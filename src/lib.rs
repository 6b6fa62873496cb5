pub mod classifier;
pub mod driver;
pub mod error;
pub mod observability;
pub mod pipeline;
pub mod pts;
pub mod recipe;
pub mod retry;
pub mod scheduler;
pub mod sink;
pub mod sizing;
pub mod source;
pub mod stages;
pub mod surface;
pub mod sync;
pub mod tasks;
pub mod trim;
pub mod validation;

pub use driver::{Pipeline, PipelineReport};
pub use error::{PipelineError, PipelineResult};
pub use pipeline::{PipelineConfig, PipelineContext, StageRegistry, StageSpec, build_pipeline};
pub use recipe::Recipe;
