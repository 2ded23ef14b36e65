pub mod blocks;
pub mod bundles;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod layout;
pub mod llm;
pub mod pipeline;
pub mod stats;
pub mod telemetry;
