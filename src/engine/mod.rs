pub mod api;
pub mod context;
pub mod executor;
pub mod result;
pub mod retry;
pub mod table;

pub use api::{ApiBackend, ApiRegistry, ApiRun, execute_api_bundles};
pub use context::ExecutionContext;
pub use executor::{QueryBackend, SessionSource, execute_plan};
pub use result::ExecutionResult;
pub use retry::RetryPolicy;
pub use table::TableQuery;
