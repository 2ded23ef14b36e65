pub mod document;
pub mod presets;
pub mod query;
pub mod registry;
pub mod resolver;
pub mod template;

pub use document::{BundleCatalog, BundleDefinition};
pub use registry::BundleRegistry;
pub use resolver::{ResolvedPlan, ResolvedQuery, resolve};
