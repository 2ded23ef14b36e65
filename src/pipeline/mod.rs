pub mod coordinates;
pub mod orchestrator;

pub use orchestrator::{Collection, ReportBlocks, ReportPipeline, ReportRequest};
