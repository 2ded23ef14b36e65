pub mod pool;
pub mod tables;

pub use pool::create_pool;
pub use tables::{PgSession, PgSessionSource};
