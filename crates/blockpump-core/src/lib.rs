//! blockpump core - multi-source PCM block synchronisation, engine pump and
//! live tuning

pub mod config;
pub mod control;
pub mod engine;
pub mod output;
pub mod pipeline;
pub mod pump;
pub mod source;
pub mod store;
pub mod types;

pub use pipeline::{Pipeline, PipelineError, PipelineHandle, PipelineReport, PipelineResult};
pub use types::*;
